mod reconnect;

use std::fmt;

use clap::{Args, Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::reconnect::{Backoff, ReconnectPolicy};

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("invalid base URL: {0}")]
    InvalidBaseUrl(String),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("websocket connect failed: {0}")]
    WsConnect(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("server returned error for {context}: {message}")]
    ServerError { context: String, message: String },
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("gave up after {attempts} reconnect attempts")]
    RetriesExhausted { attempts: u32 },
}

#[derive(Parser, Debug)]
#[command(name = "hub-cli", about = "Task board collaboration hub CLI")]
struct Cli {
    #[arg(long, env = "HUB_BASE_URL", default_value = "http://127.0.0.1:3000")]
    base_url: String,

    #[arg(long, env = "HUB_USER_ID", default_value = "hub-cli")]
    user_id: String,

    #[arg(long, env = "HUB_USERNAME")]
    username: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone)]
struct CliContext {
    base_url: String,
    user_id: String,
    username: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check `/healthz`.
    Ping,
    /// Join a room and print every message as a JSON line.
    Watch(WatchArgs),
    /// Announce a committed task change to a room.
    Announce(AnnounceArgs),
}

#[derive(Args, Debug)]
struct WatchArgs {
    #[arg(long)]
    room: String,
    #[arg(long, default_value_t = 5)]
    max_attempts: u32,
    #[arg(long, default_value_t = false)]
    no_jitter: bool,
}

#[derive(Args, Debug)]
struct AnnounceArgs {
    #[arg(long)]
    room: String,
    #[arg(long = "type", default_value = "task_updated")]
    kind: String,
    #[arg(long, default_value = "{}")]
    data: String,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let cli = Cli::parse();
    let ctx = CliContext { base_url: cli.base_url, user_id: cli.user_id, username: cli.username };

    match cli.command {
        Command::Ping => run_ping(&ctx).await,
        Command::Watch(args) => run_watch(&ctx, args).await,
        Command::Announce(args) => run_announce(&ctx, args).await,
    }
}

// =============================================================================
// HTTP
// =============================================================================

async fn run_ping(cli: &CliContext) -> Result<(), CliError> {
    let client = reqwest::Client::new();
    let url = format!("{}/healthz", cli.base_url.trim_end_matches('/'));
    let response = client.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(CliError::ServerError {
            context: format!("HTTP {}", status.as_u16()),
            message: "health check failed".to_owned(),
        });
    }
    println!("ok");
    Ok(())
}

async fn run_announce(cli: &CliContext, args: AnnounceArgs) -> Result<(), CliError> {
    let data = serde_json::from_str::<Value>(&args.data)?;
    let body = json!({
        "type": args.kind,
        "data": data,
        "user_id": cli.user_id,
        "username": cli.username.as_deref().unwrap_or(&cli.user_id),
    });
    let url = format!("{}/api/rooms/{}/events", cli.base_url.trim_end_matches('/'), args.room);

    let response = reqwest::Client::new().post(url).json(&body).send().await?;
    let status = response.status();
    let value = response.json::<Value>().await.unwrap_or(Value::Null);
    if !status.is_success() {
        return Err(CliError::ServerError { context: format!("HTTP {}", status.as_u16()), message: value.to_string() });
    }
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

// =============================================================================
// WATCH
// =============================================================================

/// How a single websocket session ended.
#[derive(Debug)]
enum SessionEnd {
    Closed { code: u16, reason: String },
    Lost(String),
    Interrupted,
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed { code, reason } => write!(f, "closed by server ({code} {reason})"),
            Self::Lost(why) => write!(f, "connection lost: {why}"),
            Self::Interrupted => f.write_str("interrupted"),
        }
    }
}

async fn run_watch(cli: &CliContext, args: WatchArgs) -> Result<(), CliError> {
    let url = ws_url(&cli.base_url, &cli.user_id, cli.username.as_deref())?;
    let policy = ReconnectPolicy { max_attempts: args.max_attempts, jitter: !args.no_jitter, ..ReconnectPolicy::default() };
    let mut backoff = Backoff::new(policy);
    let mut rng = rand::rng();

    loop {
        let mut established = false;
        let end = tokio::select! {
            end = watch_once(&url, &args.room, &mut established) => end,
            _ = tokio::signal::ctrl_c() => Ok(SessionEnd::Interrupted),
        };
        match end {
            Ok(SessionEnd::Interrupted) => return Ok(()),
            Ok(SessionEnd::Closed { code: 1000, .. }) => return Ok(()),
            Ok(end) => eprintln!("{end}"),
            Err(e) => eprintln!("{e}"),
        }
        if established {
            backoff.reset();
        }

        let Some(delay) = backoff.next_delay(&mut rng) else {
            return Err(CliError::RetriesExhausted { attempts: backoff.attempts() });
        };
        eprintln!("reconnecting in {:.1}s (attempt {})", delay.as_secs_f64(), backoff.attempts());
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

async fn watch_once(url: &str, room: &str, established: &mut bool) -> Result<SessionEnd, CliError> {
    let (mut stream, _) = connect_async(url)
        .await
        .map_err(|error| CliError::WsConnect(Box::new(error)))?;

    send_json(&mut stream, &json!({ "id": Uuid::new_v4().to_string(), "type": "room_joined", "data": { "room_id": room } }))
        .await?;

    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(error) => return Ok(SessionEnd::Lost(error.to_string())),
        };
        match frame {
            Message::Text(text) => {
                println!("{}", text.as_str());
                let Ok(value) = serde_json::from_str::<Value>(text.as_str()) else {
                    continue;
                };
                if is_welcome(&value) {
                    *established = true;
                }
                if is_server_heartbeat(&value) {
                    send_json(&mut stream, &json!({ "id": Uuid::new_v4().to_string(), "type": "heartbeat" })).await?;
                }
            }
            Message::Close(frame) => {
                let (code, reason) = frame.map_or((1005, String::new()), |f| (u16::from(f.code), f.reason.as_str().to_owned()));
                return Ok(SessionEnd::Closed { code, reason });
            }
            _ => {}
        }
    }
    Ok(SessionEnd::Lost("stream ended".to_owned()))
}

async fn send_json(stream: &mut WsStream, value: &Value) -> Result<(), CliError> {
    stream
        .send(Message::Text(value.to_string().into()))
        .await
        .map_err(|error| CliError::WsConnect(Box::new(error)))
}

fn is_welcome(value: &Value) -> bool {
    value.get("type").and_then(Value::as_str) == Some("notification")
        && value.pointer("/data/event").and_then(Value::as_str) == Some("connected")
}

/// Server-initiated heartbeats carry no `reply_to`; replies to our own do.
fn is_server_heartbeat(value: &Value) -> bool {
    value.get("type").and_then(Value::as_str) == Some("heartbeat") && value.pointer("/data/reply_to").is_none()
}

fn ws_url(base_url: &str, user_id: &str, username: Option<&str>) -> Result<String, CliError> {
    let invalid = || CliError::InvalidBaseUrl(base_url.to_owned());
    let mut url = reqwest::Url::parse(base_url).map_err(|_| invalid())?;
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        _ => return Err(invalid()),
    };
    url.set_scheme(scheme).map_err(|()| invalid())?;
    url.set_path("/api/ws");
    {
        let mut query = url.query_pairs_mut();
        query.clear().append_pair("user_id", user_id);
        if let Some(username) = username {
            query.append_pair("username", username);
        }
    }
    Ok(url.into())
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
