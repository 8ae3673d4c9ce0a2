//! Hub services used by websocket and HTTP routes.
//!
//! ARCHITECTURE
//! ============
//! Leaf-first: `registry` owns membership, `presence` owns user status,
//! `router` and `relay` fan out through the registry, and `connection`
//! drives all of them across a connection's lifetime. Route handlers only
//! translate between the wire and these services.

pub mod connection;
pub mod expiry;
pub mod presence;
pub mod registry;
pub mod relay;
pub mod router;
