use std::time::Duration;

use thiserror::Error;

use crate::core::frame::{FrameDecodeError, FrameEncodeError};
use crate::core::message::ClientId;

/// Failure while forwarding one frame to one client session.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("outbox full")]
    Backpressure,

    #[error("session closed")]
    SessionClosed,

    #[error("no acknowledgement within {0:?}")]
    AckTimeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level error taxonomy shared by the hub and client engines.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("connect failed: {0}")]
    Connect(#[source] std::io::Error),

    #[error("send failed: {0}")]
    Send(#[from] SendError),

    #[error("communication failed: {0}")]
    Communicate(String),

    #[error("protocol violation: {0}")]
    Protocol(#[from] FrameDecodeError),

    #[error("encode failed: {0}")]
    Encode(#[from] FrameEncodeError),

    #[error("delivery retries exhausted for {} client(s)", failed.len())]
    RetryExhausted { failed: Vec<ClientId> },

    #[error("connection closed")]
    Closed,
}

impl HubError {
    /// True when the failure closed (or should close) the connection.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            HubError::Protocol(_) | HubError::Closed | HubError::Send(SendError::SessionClosed)
        )
    }
}
