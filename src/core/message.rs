//! Downstream message envelope and the pluggable payload codec.

use std::fmt;
use std::ops::Deref;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::core::frame::{
    encode_frame, put_string, take_string, FrameDecodeError, FrameEncodeError,
};

/// Public client identifier, bound by the `Id` control command.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ClientId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for ClientId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Deref for ClientId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Application = 0,
    ServerResponse = 1,
    ServerClose = 2,
}

impl From<MessageKind> for u8 {
    fn from(k: MessageKind) -> Self {
        k as u8
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = FrameDecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageKind::Application),
            1 => Ok(MessageKind::ServerResponse),
            2 => Ok(MessageKind::ServerClose),
            other => Err(FrameDecodeError::UnknownKind(other)),
        }
    }
}

/// Insertion-ordered subject -> optional key pairs; the first entry is the
/// message's primary subject.
pub type SubjectMap = Vec<(String, Option<String>)>;

/// One hub message. The payload is always held in serialized form; typed
/// access goes through a [`PayloadCodec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    /// Echoed request id for `ServerResponse`, zero elsewhere.
    pub request_id: i16,
    pub subjects: SubjectMap,
    /// Empty means unrestricted delivery.
    pub destinations: Vec<ClientId>,
    pub payload: Bytes,
    /// Stamped by the hub when the message enters fan-out.
    pub sent_at_ms: u64,
    /// Stamped by the reader on arrival; never wired.
    pub received_at_ms: u64,
}

impl Message {
    pub fn application(subjects: SubjectMap, payload: impl Into<Bytes>) -> Self {
        Self {
            kind: MessageKind::Application,
            request_id: 0,
            subjects,
            destinations: Vec::new(),
            payload: payload.into(),
            sent_at_ms: 0,
            received_at_ms: 0,
        }
    }

    /// Application message with the payload serialized at creation.
    pub fn application_with<C, T>(codec: &C, subjects: SubjectMap, value: &T) -> Result<Self, C::Error>
    where
        C: PayloadCodec,
        T: Serialize,
    {
        Ok(Self::application(subjects, codec.to_bytes(value)?))
    }

    pub fn server_response(request_id: i16) -> Self {
        Self {
            kind: MessageKind::ServerResponse,
            request_id,
            subjects: Vec::new(),
            destinations: Vec::new(),
            payload: Bytes::new(),
            sent_at_ms: 0,
            received_at_ms: 0,
        }
    }

    pub fn server_close() -> Self {
        Self {
            kind: MessageKind::ServerClose,
            request_id: 0,
            subjects: Vec::new(),
            destinations: Vec::new(),
            payload: Bytes::new(),
            sent_at_ms: 0,
            received_at_ms: 0,
        }
    }

    pub fn with_destinations(mut self, destinations: Vec<ClientId>) -> Self {
        self.destinations = destinations;
        self
    }

    /// Decode the payload on demand.
    pub fn payload_as<T, C>(&self, codec: &C) -> Result<T, C::Error>
    where
        T: DeserializeOwned,
        C: PayloadCodec,
    {
        codec.from_bytes(&self.payload)
    }

    /// True when the destination filter admits `client`.
    pub fn addressed_to(&self, client: &ClientId) -> bool {
        self.destinations.is_empty() || self.destinations.contains(client)
    }

    /// Reset every field for pool reuse.
    pub fn clear(&mut self) {
        self.kind = MessageKind::Application;
        self.request_id = 0;
        self.subjects.clear();
        self.destinations.clear();
        self.payload = Bytes::new();
        self.sent_at_ms = 0;
        self.received_at_ms = 0;
    }
}

/// Milliseconds since the Unix epoch.
pub fn current_timestamp() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time went backwards")
        .as_millis() as u64
}

/// Serialization boundary for application payloads.
pub trait PayloadCodec {
    type Error: std::error::Error + Send + Sync + 'static;

    fn to_bytes<T: Serialize>(&self, value: &T) -> Result<Bytes, Self::Error>;
    fn from_bytes<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, Self::Error>;
}

/// Default codec: JSON via serde_json.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl PayloadCodec for JsonCodec {
    type Error = serde_json::Error;

    fn to_bytes<T: Serialize>(&self, value: &T) -> Result<Bytes, Self::Error> {
        serde_json::to_vec(value).map(Bytes::from)
    }

    fn from_bytes<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, Self::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Serialize an envelope body (no length prefix).
pub fn encode_message(msg: &Message) -> Result<Bytes, FrameEncodeError> {
    let mut buf = BytesMut::with_capacity(32 + msg.payload.len());
    buf.put_u8(msg.kind.into());
    buf.put_i16(msg.request_id);
    buf.put_u64(msg.sent_at_ms);

    let subject_count = u16::try_from(msg.subjects.len())
        .map_err(|_| FrameEncodeError::FieldTooLong(msg.subjects.len()))?;
    buf.put_u16(subject_count);
    for (subject, key) in &msg.subjects {
        put_string(&mut buf, subject)?;
        match key {
            None => buf.put_u8(0),
            Some(key) => {
                buf.put_u8(1);
                put_string(&mut buf, key)?;
            }
        }
    }

    let dest_count = u16::try_from(msg.destinations.len())
        .map_err(|_| FrameEncodeError::FieldTooLong(msg.destinations.len()))?;
    buf.put_u16(dest_count);
    for dest in &msg.destinations {
        put_string(&mut buf, dest.as_str())?;
    }

    buf.put_u32(msg.payload.len() as u32);
    buf.put_slice(&msg.payload);
    Ok(buf.freeze())
}

/// Serialize an envelope as a complete length-prefixed frame.
pub fn encode_message_frame(msg: &Message) -> Result<Bytes, FrameEncodeError> {
    let body = encode_message(msg)?;
    let mut buf = BytesMut::with_capacity(4 + body.len());
    encode_frame(&body, &mut buf)?;
    Ok(buf.freeze())
}

pub fn decode_message(bytes: &[u8]) -> Result<Message, FrameDecodeError> {
    let mut src = bytes;
    if src.remaining() < 1 + 2 + 8 {
        return Err(FrameDecodeError::Truncated);
    }
    let kind = MessageKind::try_from(src.get_u8())?;
    let request_id = src.get_i16();
    let sent_at_ms = src.get_u64();

    if src.remaining() < 2 {
        return Err(FrameDecodeError::Truncated);
    }
    let subject_count = src.get_u16() as usize;
    let mut subjects = Vec::with_capacity(subject_count);
    for _ in 0..subject_count {
        let subject = take_string(&mut src)?;
        if src.remaining() < 1 {
            return Err(FrameDecodeError::Truncated);
        }
        let key = match src.get_u8() {
            0 => None,
            _ => Some(take_string(&mut src)?),
        };
        subjects.push((subject, key));
    }

    if src.remaining() < 2 {
        return Err(FrameDecodeError::Truncated);
    }
    let dest_count = src.get_u16() as usize;
    let mut destinations = Vec::with_capacity(dest_count);
    for _ in 0..dest_count {
        destinations.push(ClientId::from(take_string(&mut src)?));
    }

    if src.remaining() < 4 {
        return Err(FrameDecodeError::Truncated);
    }
    let payload_len = src.get_u32() as usize;
    if src.remaining() < payload_len {
        return Err(FrameDecodeError::Truncated);
    }
    let payload = src.copy_to_bytes(payload_len);

    Ok(Message {
        kind,
        request_id,
        subjects,
        destinations,
        payload,
        sent_at_ms,
        received_at_ms: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_roundtrips() {
        let mut msg = Message::application(
            vec![
                ("orders".into(), Some("42".into())),
                ("audit".into(), None),
            ],
            Bytes::from_static(b"{\"qty\":3}"),
        )
        .with_destinations(vec![ClientId::from("billing")]);
        msg.sent_at_ms = 1_723_111_000_123;

        let encoded = encode_message(&msg).unwrap();
        let decoded = decode_message(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn server_frames_roundtrip() {
        let resp = Message::server_response(-7);
        let decoded = decode_message(&encode_message(&resp).unwrap()).unwrap();
        assert_eq!(decoded.kind, MessageKind::ServerResponse);
        assert_eq!(decoded.request_id, -7);

        let close = Message::server_close();
        let decoded = decode_message(&encode_message(&close).unwrap()).unwrap();
        assert_eq!(decoded.kind, MessageKind::ServerClose);
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(9);
        buf.put_i16(0);
        buf.put_u64(0);
        buf.put_u16(0);
        buf.put_u16(0);
        buf.put_u32(0);
        assert!(matches!(
            decode_message(&buf),
            Err(FrameDecodeError::UnknownKind(9))
        ));
    }

    #[test]
    fn destination_filter_matching() {
        let open = Message::application(vec![("orders".into(), None)], Bytes::new());
        assert!(open.addressed_to(&ClientId::from("anyone")));

        let scoped = Message::application(vec![("orders".into(), None)], Bytes::new())
            .with_destinations(vec![ClientId::from("billing")]);
        assert!(scoped.addressed_to(&ClientId::from("billing")));
        assert!(!scoped.addressed_to(&ClientId::from("audit")));
    }

    #[test]
    fn json_codec_roundtrip() {
        #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
        struct Order {
            qty: u32,
            sku: String,
        }

        let order = Order {
            qty: 3,
            sku: "A-17".into(),
        };
        let msg = Message::application_with(
            &JsonCodec,
            vec![("orders".into(), Some("42".into()))],
            &order,
        )
        .unwrap();

        let back: Order = msg.payload_as(&JsonCodec).unwrap();
        assert_eq!(back, order);
    }

    #[test]
    fn clear_resets_for_reuse() {
        let mut msg = Message::application(
            vec![("orders".into(), Some("42".into()))],
            Bytes::from_static(b"x"),
        );
        msg.sent_at_ms = 5;
        msg.received_at_ms = 6;
        msg.clear();

        assert_eq!(msg.kind, MessageKind::Application);
        assert!(msg.subjects.is_empty());
        assert!(msg.destinations.is_empty());
        assert!(msg.payload.is_empty());
        assert_eq!(msg.sent_at_ms, 0);
        assert_eq!(msg.received_at_ms, 0);
    }
}
