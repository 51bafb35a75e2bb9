//! hubmq – a subject/key-addressed pub-sub fan-out hub over raw TCP.
//!
//! This crate exports
//!  * `core`     – wire framing, commands, envelopes, subscriptions, replay cache
//!  * `broker`   – the embeddable hub engine (publishing side)
//!  * `dispatch` – delivery strategies and the send worker pool
//!  * `client`   – the receiving-side connection handle
//!  * `config`   – TOML-driven runtime configuration
//!
//! Applications embed the hub (`Hub::start`) and publish through it;
//! remote processes attach with `HubClient` to subscribe and receive.

// ───────────────────────────────────────────────────────────
// Public modules
// ───────────────────────────────────────────────────────────
pub mod broker;
pub mod client;
pub mod config;
pub mod core;
pub mod dispatch;
pub mod logging;

// ───────────────────────────────────────────────────────────
// Re-exports
// ───────────────────────────────────────────────────────────
pub use broker::{Hub, HubEvent, HubStats};
pub use client::{ClientOptions, HubClient};
pub use config::{load_config, Config};
pub use crate::core::error::{HubError, SendError};
pub use crate::core::message::{ClientId, Message};
