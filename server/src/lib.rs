//! # Multiplayer Relay Server Library
//!
//! This library implements a dual-transport relay for real-time
//! multiplayer state: identity join, position updates, and chat,
//! fanned out across one consistent player roster.
//!
//! ## Transports
//!
//! ### Stream (`stream`)
//! Persistent TCP connections exchanging newline-delimited records.
//! Low latency, push delivery, intended for local networks. Events are
//! written as they happen through a per-connection writer task.
//!
//! ### Poll (`poll`)
//! Discrete HTTP request/response exchanges keyed by an opaque session
//! token. Firewall and NAT friendly, intended for internet play.
//! Events accumulate in a per-session queue and are drained by each
//! `sync` request. Both transports observe the same roster and the
//! same message stream.
//!
//! ## Architecture
//!
//! All registry mutation and broadcast fan-out is serialized through a
//! single mutex around the relay core ([`relay::Relay`]), so each
//! state-changing operation runs to completion atomically. Fan-out
//! never performs socket I/O: stream deliveries go through unbounded
//! channels drained by writer tasks, poll deliveries sit in queues.
//! Cross-transport global ordering is not guaranteed; per-connection
//! and per-token ordering is.
//!
//! ## Module Organization
//!
//! - [`registry`] — sessions, the monotonic id counter, server config
//! - [`relay`] — admission, fan-out, teardown, reaping, admin surface
//! - [`stream`] — TCP transport adapter
//! - [`poll`] — HTTP polling transport adapter
//! - [`notify`] — fire-and-forget dashboard notifications
//! - [`server`] — binds everything together
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::notify::NotificationSink;
//! use server::registry::ServerConfig;
//! use server::server::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let config = ServerConfig {
//!         name: "My Server".to_string(),
//!         motd: "Welcome!".to_string(),
//!         max_players: 8,
//!     };
//!
//!     let server = Server::bind(
//!         "0.0.0.0:4110",          // stream transport
//!         "0.0.0.0:4111",          // poll transport
//!         "203.0.113.9".to_string(), // advertised address
//!         config,
//!         NotificationSink::detached(),
//!     )
//!     .await?;
//!
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod notify;
pub mod poll;
pub mod registry;
pub mod relay;
pub mod server;
pub mod stream;
