//! Upstream control protocol: everything a client can ask of the hub.
//!
//! Commands are created per call, encoded, and discarded after send. The
//! request id is a 2-byte signed counter that wraps; the hub echoes it in
//! `ServerResponse` envelopes when acknowledgements are enabled.

use std::sync::atomic::{AtomicI16, Ordering};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::core::frame::{
    encode_frame, put_string, take_string, FrameDecodeError, FrameEncodeError,
};

const CONTROL_ID: u8 = 1;
const CONTROL_ADD: u8 = 2;
const CONTROL_REMOVE: u8 = 3;
const CONTROL_BYE: u8 = 4;
const CONTROL_START_RECEIVE: u8 = 5;
const CONTROL_STOP_RECEIVE: u8 = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    /// Bind (or re-bind) the session's public identifier.
    Id { identifier: String },
    /// Subscribe to a subject; `None` keys means the wildcard filter.
    AddSubscription {
        subject: String,
        keys: Option<Vec<String>>,
    },
    /// Drop key filters, or the whole subject when `keys` is `None`.
    RemoveSubscription {
        subject: String,
        keys: Option<Vec<String>>,
    },
    /// Orderly goodbye; the hub closes the session without a response.
    Bye,
    /// Start delivery; `from_ms` requests a replay of the cached backlog.
    StartReceive { from_ms: Option<u64> },
    /// Pause delivery without dropping subscriptions.
    StopReceive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCommand {
    pub request_id: i16,
    pub control: Control,
}

pub fn new_id(request_id: i16, identifier: impl Into<String>) -> ClientCommand {
    ClientCommand {
        request_id,
        control: Control::Id {
            identifier: identifier.into(),
        },
    }
}

pub fn new_add(
    request_id: i16,
    subject: impl Into<String>,
    keys: Option<Vec<String>>,
) -> ClientCommand {
    ClientCommand {
        request_id,
        control: Control::AddSubscription {
            subject: subject.into(),
            keys,
        },
    }
}

pub fn new_remove(
    request_id: i16,
    subject: impl Into<String>,
    keys: Option<Vec<String>>,
) -> ClientCommand {
    ClientCommand {
        request_id,
        control: Control::RemoveSubscription {
            subject: subject.into(),
            keys,
        },
    }
}

pub fn new_bye(request_id: i16) -> ClientCommand {
    ClientCommand {
        request_id,
        control: Control::Bye,
    }
}

pub fn new_start_receive(request_id: i16, from_ms: Option<u64>) -> ClientCommand {
    ClientCommand {
        request_id,
        control: Control::StartReceive { from_ms },
    }
}

pub fn new_stop_receive(request_id: i16) -> ClientCommand {
    ClientCommand {
        request_id,
        control: Control::StopReceive,
    }
}

/// Wrapping 2-byte request-id source, one per connection.
#[derive(Debug)]
pub struct RequestIds(AtomicI16);

impl RequestIds {
    pub fn new() -> Self {
        Self(AtomicI16::new(1))
    }

    pub fn next(&self) -> i16 {
        // fetch_add wraps on overflow, which is exactly the contract.
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for RequestIds {
    fn default() -> Self {
        Self::new()
    }
}

fn put_keys(dst: &mut BytesMut, keys: &Option<Vec<String>>) -> Result<(), FrameEncodeError> {
    match keys {
        None => dst.put_u8(0),
        Some(keys) => {
            dst.put_u8(1);
            let count =
                u16::try_from(keys.len()).map_err(|_| FrameEncodeError::FieldTooLong(keys.len()))?;
            dst.put_u16(count);
            for key in keys {
                put_string(dst, key)?;
            }
        }
    }
    Ok(())
}

fn take_keys(src: &mut &[u8]) -> Result<Option<Vec<String>>, FrameDecodeError> {
    if src.remaining() < 1 {
        return Err(FrameDecodeError::Truncated);
    }
    match src.get_u8() {
        0 => Ok(None),
        _ => {
            if src.remaining() < 2 {
                return Err(FrameDecodeError::Truncated);
            }
            let count = src.get_u16() as usize;
            let mut keys = Vec::with_capacity(count);
            for _ in 0..count {
                keys.push(take_string(src)?);
            }
            Ok(Some(keys))
        }
    }
}

/// Serialize a command body (no length prefix).
pub fn encode_command(cmd: &ClientCommand) -> Result<Bytes, FrameEncodeError> {
    let mut buf = BytesMut::with_capacity(64);
    match &cmd.control {
        Control::Id { identifier } => {
            buf.put_u8(CONTROL_ID);
            buf.put_i16(cmd.request_id);
            put_string(&mut buf, identifier)?;
        }
        Control::AddSubscription { subject, keys } => {
            buf.put_u8(CONTROL_ADD);
            buf.put_i16(cmd.request_id);
            put_string(&mut buf, subject)?;
            put_keys(&mut buf, keys)?;
        }
        Control::RemoveSubscription { subject, keys } => {
            buf.put_u8(CONTROL_REMOVE);
            buf.put_i16(cmd.request_id);
            put_string(&mut buf, subject)?;
            put_keys(&mut buf, keys)?;
        }
        Control::Bye => {
            buf.put_u8(CONTROL_BYE);
            buf.put_i16(cmd.request_id);
        }
        Control::StartReceive { from_ms } => {
            buf.put_u8(CONTROL_START_RECEIVE);
            buf.put_i16(cmd.request_id);
            match from_ms {
                None => buf.put_u8(0),
                Some(ms) => {
                    buf.put_u8(1);
                    buf.put_u64(*ms);
                }
            }
        }
        Control::StopReceive => {
            buf.put_u8(CONTROL_STOP_RECEIVE);
            buf.put_i16(cmd.request_id);
        }
    }
    Ok(buf.freeze())
}

/// Serialize a command as a complete length-prefixed frame.
pub fn encode_command_frame(cmd: &ClientCommand) -> Result<Bytes, FrameEncodeError> {
    let body = encode_command(cmd)?;
    let mut buf = BytesMut::with_capacity(4 + body.len());
    encode_frame(&body, &mut buf)?;
    Ok(buf.freeze())
}

pub fn decode_command(bytes: &[u8]) -> Result<ClientCommand, FrameDecodeError> {
    let mut src = bytes;
    if src.remaining() < 3 {
        return Err(FrameDecodeError::Truncated);
    }
    let control_type = src.get_u8();
    let request_id = src.get_i16();

    let control = match control_type {
        CONTROL_ID => Control::Id {
            identifier: take_string(&mut src)?,
        },
        CONTROL_ADD => Control::AddSubscription {
            subject: take_string(&mut src)?,
            keys: take_keys(&mut src)?,
        },
        CONTROL_REMOVE => Control::RemoveSubscription {
            subject: take_string(&mut src)?,
            keys: take_keys(&mut src)?,
        },
        CONTROL_BYE => Control::Bye,
        CONTROL_START_RECEIVE => {
            if src.remaining() < 1 {
                return Err(FrameDecodeError::Truncated);
            }
            let from_ms = match src.get_u8() {
                0 => None,
                _ => {
                    if src.remaining() < 8 {
                        return Err(FrameDecodeError::Truncated);
                    }
                    Some(src.get_u64())
                }
            };
            Control::StartReceive { from_ms }
        }
        CONTROL_STOP_RECEIVE => Control::StopReceive,
        other => return Err(FrameDecodeError::UnknownControl(other)),
    };

    Ok(ClientCommand {
        request_id,
        control,
    })
}
