//! Privilege broker.
//!
//! The broker runs with elevated rights in its own process and serves a
//! single authorized peer: the transfer scheduler that spawned it. It
//! executes three fixed operations on the cache tree (`CHOWN`, `PUBLISH`,
//! `CHUNK`) and answers every request with exactly one reply line.
//!
//! Requests are only ever expressed in cache-name tokens, never in raw
//! remote paths, so the broker's path arithmetic stays within the cache
//! root.

pub mod auth;
pub mod client;
pub mod error;
pub mod ops;
pub mod server;

pub use auth::{Authorizer, Rejection};
pub use client::BrokerClient;
pub use error::BrokerError;
pub use ops::BrokerOps;
pub use server::BrokerServer;

/// Copy buffer used when carving chunks (256 KiB).
pub const CHUNK_COPY_BUFFER: usize = 256 * 1024;

/// Mode of the broker socket: only the owner may connect.
pub const BROKER_SOCKET_MODE: u32 = 0o600;
