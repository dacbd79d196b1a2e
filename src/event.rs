//! The wire-level unit of transport: name, positional args, header, identity.

use std::collections::BTreeMap;

use bytes::Bytes;
use uuid::Uuid;

/// A self-describing dynamic value, used for both `args` and free-form
/// header entries. Backed by the MessagePack value model so it can carry
/// whatever a serializer on top of this crate chooses to put in it.
pub type Value = rmpv::Value;

/// Opaque 16-byte id, unique per event. Reused as both `message_id` and
/// `response_to` / `channel_id`.
pub type MessageId = Uuid;

/// Opaque peer address, meaningful only on transports that expose one
/// (e.g. a ROUTER socket's identity frame).
pub type Identity = Bytes;

/// Current protocol version. Values `< 2` opt into the legacy single-string
/// error encoding and disable active heartbeats (see `heartbeat.rs`).
pub const PROTOCOL_VERSION: i64 = 3;

pub const HEARTBEAT: &str = "_zpc_hb";
pub const CREDIT: &str = "_zpc_more";
pub const OK: &str = "OK";
pub const ERR: &str = "ERR";
pub const STREAM: &str = "STREAM";
pub const STREAM_DONE: &str = "STREAM_DONE";

/// Recognized header keys, plus arbitrary task-context keys in `xheader`.
#[derive(Debug, Clone)]
pub struct Header {
    pub message_id: MessageId,
    pub v: i64,
    pub response_to: Option<MessageId>,
    pub xheader: BTreeMap<String, Value>,
}

impl Header {
    fn new(v: i64, xheader: BTreeMap<String, Value>) -> Self {
        Header {
            message_id: Uuid::new_v4(),
            v,
            response_to: None,
            xheader,
        }
    }
}

/// Immutable-in-spirit unit of transport. `identity` and `header.response_to`
/// are the two fields mutated after construction, by the Channel/multiplexer
/// layer, while binding the event to a logical call.
#[derive(Debug, Clone)]
pub struct Event {
    pub name: String,
    pub args: Vec<Value>,
    pub header: Header,
    pub identity: Option<Identity>,
}

impl Event {
    /// Builds a fresh initiating event: a new unique `message_id`, no
    /// `response_to`, and no identity (filled in later by the Channel that
    /// owns this event).
    pub fn new(name: impl Into<String>, args: Vec<Value>, v: i64, xheader: BTreeMap<String, Value>) -> Self {
        Event {
            name: name.into(),
            args,
            header: Header::new(v, xheader),
            identity: None,
        }
    }

    pub fn is_reserved(&self) -> bool {
        self.name.starts_with("_zpc_")
    }
}
