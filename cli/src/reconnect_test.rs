use super::*;
use rand::SeedableRng;
use rand::rngs::StdRng;

fn fixed() -> ReconnectPolicy {
    ReconnectPolicy { jitter: false, ..ReconnectPolicy::default() }
}

#[test]
fn default_schedule_doubles_and_caps() {
    let policy = fixed();
    let delays: Vec<_> = (1..=5).filter_map(|n| policy.delay_for(n)).collect();
    assert_eq!(
        delays,
        vec![
            Duration::from_secs(3),
            Duration::from_secs(6),
            Duration::from_secs(12),
            Duration::from_secs(24),
            Duration::from_secs(30),
        ]
    );
}

#[test]
fn attempts_beyond_budget_give_up() {
    let policy = fixed();
    assert_eq!(policy.delay_for(0), None);
    assert_eq!(policy.delay_for(6), None);
}

#[test]
fn huge_multiplier_saturates_at_cap() {
    let policy = ReconnectPolicy { multiplier: u32::MAX, max_attempts: 40, ..fixed() };
    assert_eq!(policy.delay_for(40), Some(Duration::from_secs(30)));
}

#[test]
fn jitter_stays_within_half_to_full_delay() {
    let policy = ReconnectPolicy::default();
    let mut rng = StdRng::seed_from_u64(7);
    let delay = Duration::from_secs(10);
    for _ in 0..200 {
        let jittered = policy.apply_jitter(delay, &mut rng);
        assert!(jittered >= Duration::from_secs(5), "{jittered:?} below lower bound");
        assert!(jittered <= delay, "{jittered:?} above delay");
    }
}

#[test]
fn jitter_disabled_is_exact() {
    let mut rng = StdRng::seed_from_u64(7);
    assert_eq!(fixed().apply_jitter(Duration::from_secs(3), &mut rng), Duration::from_secs(3));
}

#[test]
fn backoff_exhausts_then_resets() {
    let mut rng = StdRng::seed_from_u64(1);
    let mut backoff = Backoff::new(fixed());
    for _ in 0..5 {
        assert!(backoff.next_delay(&mut rng).is_some());
    }
    assert_eq!(backoff.attempts(), 5);
    assert_eq!(backoff.next_delay(&mut rng), None);
    assert_eq!(backoff.attempts(), 5);

    backoff.reset();
    assert_eq!(backoff.next_delay(&mut rng), Some(Duration::from_secs(3)));
}
