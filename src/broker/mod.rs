//! The hub side: engine, sessions, fan-out and both transports.
//!
//! - [`server`]: the [`Hub`](server::Hub) engine with its listener,
//!   command handling and management surface.
//! - [`session`]: per-connection state behind the outbox seam.
//! - [`registry`]: live sessions, identity bindings and disable rules.
//! - [`fanout`]: candidate collection and the delivery strategies.
//! - [`poller`]: the mio event-loop transport.

pub mod fanout;
pub(crate) mod poller;
pub mod registry;
pub mod server;
pub mod session;

pub use self::registry::SessionRegistry;
pub use self::server::{ClientInfo, Hub, HubEvent, HubStats};
pub use self::session::{ClientSession, Outbox, SessionId, SessionStats};
