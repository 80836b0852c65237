//! Event envelope and codec
//!
//! Every message on the wire is an [`Event`]: a MessagePack array
//! `[header, name, args]`. The header is a map carrying the correlation
//! fields; `name` selects a task or a protocol reply kind; `args` is the
//! ordered argument list.

use crate::{ProtocolError, Value};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Version tag written into outgoing headers
pub const PROTOCOL_VERSION: i64 = 3;

/// Heartbeat event name
pub const HEARTBEAT: &str = "_zpc_hb";
/// Successful single reply
pub const OK: &str = "OK";
/// Remote exception reply
pub const ERR: &str = "ERR";
/// One streamed reply item
pub const STREAM: &str = "STREAM";
/// End of a streamed reply
pub const STREAM_DONE: &str = "STREAM_DONE";

/// Event header
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    /// Unique id of this event
    pub message_id: String,
    /// Id of the exchange this event belongs to, when it is not the first
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_to: Option<String>,
    /// Protocol version tag; unknown values are kept as-is
    #[serde(rename = "v", default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Value>,
}

impl Header {
    /// Header with a freshly generated message id
    pub fn new() -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            response_to: None,
            version: Some(Value::Integer(PROTOCOL_VERSION)),
        }
    }

    /// Header with a fresh message id that belongs to an existing exchange
    pub fn response_to(id: impl Into<String>) -> Self {
        Self {
            response_to: Some(id.into()),
            ..Self::new()
        }
    }
}

impl Default for Header {
    fn default() -> Self {
        Self::new()
    }
}

/// Unit of RPC communication
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Correlation header
    pub header: Header,
    /// Task or reply kind
    pub name: String,
    /// Ordered arguments
    pub args: Vec<Value>,
}

impl Event {
    /// Create an exchange-initiating event with a fresh message id
    pub fn new(name: impl Into<String>, args: Vec<Value>) -> Self {
        Self::with_header(Header::new(), name, args)
    }

    /// Create an event with an explicit header
    pub fn with_header(header: Header, name: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            header,
            name: name.into(),
            args,
        }
    }

    /// Create an event on the exchange identified by `channel_id`
    pub fn reply(channel_id: &str, name: impl Into<String>, args: Vec<Value>) -> Self {
        Self::with_header(Header::response_to(channel_id), name, args)
    }

    /// Create a heartbeat for the exchange identified by `channel_id`
    pub fn heartbeat(channel_id: &str) -> Self {
        Self::reply(channel_id, HEARTBEAT, Vec::new())
    }

    /// The id used to route this event to a channel
    pub fn correlation_id(&self) -> &str {
        self.header
            .response_to
            .as_deref()
            .unwrap_or(&self.header.message_id)
    }

    /// Whether this is a heartbeat
    pub fn is_heartbeat(&self) -> bool {
        self.name == HEARTBEAT
    }

    /// Serialize to MessagePack bytes
    pub fn to_msgpack(&self) -> Result<Vec<u8>, ProtocolError> {
        EventCodec::encode(self)
    }

    /// Deserialize from MessagePack bytes
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, ProtocolError> {
        EventCodec::decode(bytes)
    }
}

#[derive(Serialize)]
struct EnvelopeRef<'a>(&'a Header, &'a str, &'a [Value]);

#[derive(Deserialize)]
struct Envelope(Header, String, Vec<Value>);

/// Encoder/decoder for the `[header, name, args]` envelope
pub struct EventCodec;

impl EventCodec {
    /// Encode an event
    pub fn encode(event: &Event) -> Result<Vec<u8>, ProtocolError> {
        // Named encoding keeps the header a string-keyed map
        let envelope = EnvelopeRef(&event.header, &event.name, &event.args);
        Ok(rmp_serde::to_vec_named(&envelope)?)
    }

    /// Decode an event, rejecting envelopes without a usable `message_id`
    pub fn decode(bytes: &[u8]) -> Result<Event, ProtocolError> {
        let Envelope(header, name, args) = rmp_serde::from_slice(bytes)?;
        if header.message_id.is_empty() {
            return Err(ProtocolError::Decode("empty message_id".to_string()));
        }
        Ok(Event { header, name, args })
    }
}
