//! Receiving-side client for a hub: connect, identify, subscribe and
//! consume the envelope stream. Publishing happens on the hub side only.

pub mod connection;

pub use connection::{ClientOptions, HubClient};
