//! The kernel message type exchanged over a kernel WebSocket.

use bytes::Bytes;
use jupyter_protocol::{Header, JupyterMessageContent};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::validate::validate_message;

/// Kernel messaging protocol version stamped on outgoing headers.
pub const PROTOCOL_VERSION: &str = "5.3";

/// Error type for message decoding and validation failures.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Failed to parse message content: {0}")]
    ContentParseError(String),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Kernel channel a message travels on.
///
/// Heartbeat never crosses the WebSocket, so it has no variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Shell,
    Control,
    Iopub,
    Stdin,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Shell => "shell",
            Channel::Control => "control",
            Channel::Iopub => "iopub",
            Channel::Stdin => "stdin",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "shell" => Some(Channel::Shell),
            "control" => Some(Channel::Control),
            "iopub" => Some(Channel::Iopub),
            "stdin" => Some(Channel::Stdin),
            _ => None,
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A kernel protocol message.
///
/// `content` is kept as raw JSON so that unknown message types pass through
/// untouched; [`KernelMessage::typed_content`] parses it on demand. Buffers
/// are not part of the JSON body, the frame codecs carry them separately.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelMessage {
    pub header: Header,

    #[serde(
        default,
        deserialize_with = "jupyter_protocol::deserialize_parent_header",
        serialize_with = "serialize_parent_header"
    )]
    pub parent_header: Option<Header>,

    #[serde(default = "empty_object")]
    pub metadata: Value,

    #[serde(default = "empty_object")]
    pub content: Value,

    #[serde(skip)]
    pub buffers: Vec<Bytes>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<Channel>,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// Servers expect an empty object, not `null`, for a missing parent.
fn serialize_parent_header<S>(parent: &Option<Header>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match parent {
        Some(header) => header.serialize(serializer),
        None => Map::new().serialize(serializer),
    }
}

impl KernelMessage {
    /// Build an outgoing message with a fresh header.
    pub fn new(
        channel: Channel,
        msg_type: impl Into<String>,
        msg_id: impl Into<String>,
        session: &str,
        username: &str,
        content: Value,
    ) -> Self {
        KernelMessage {
            header: Header {
                msg_id: msg_id.into(),
                username: username.to_string(),
                session: session.to_string(),
                date: chrono::Utc::now(),
                msg_type: msg_type.into(),
                version: PROTOCOL_VERSION.to_string(),
            },
            parent_header: None,
            metadata: empty_object(),
            content,
            buffers: Vec::new(),
            channel: Some(channel),
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_buffers(mut self, buffers: Vec<Bytes>) -> Self {
        self.buffers = buffers;
        self
    }

    pub fn with_parent(mut self, parent: &KernelMessage) -> Self {
        self.parent_header = Some(parent.header.clone());
        self
    }

    /// Validate a decoded JSON value and convert it into a message.
    pub fn from_value(value: Value, buffers: Vec<Bytes>) -> Result<Self, WireError> {
        validate_message(&value)?;
        let mut msg: KernelMessage = serde_json::from_value(value)?;
        msg.buffers = buffers;
        Ok(msg)
    }

    pub fn msg_id(&self) -> &str {
        &self.header.msg_id
    }

    pub fn msg_type(&self) -> &str {
        &self.header.msg_type
    }

    pub fn parent_msg_id(&self) -> Option<&str> {
        self.parent_header.as_ref().map(|h| h.msg_id.as_str())
    }

    /// `comm_id` of a `comm_open`/`comm_msg`/`comm_close` message.
    pub fn comm_id(&self) -> Option<&str> {
        if !self.is_comm_message() {
            return None;
        }
        self.content.get("comm_id").and_then(Value::as_str)
    }

    pub fn is_comm_message(&self) -> bool {
        matches!(self.msg_type(), "comm_open" | "comm_msg" | "comm_close")
    }

    /// `execution_state` of an iopub `status` message.
    pub fn execution_state(&self) -> Option<&str> {
        if self.msg_type() != "status" {
            return None;
        }
        self.content.get("execution_state").and_then(Value::as_str)
    }

    /// Parse `content` according to `msg_type`.
    pub fn typed_content(&self) -> Result<JupyterMessageContent, WireError> {
        JupyterMessageContent::from_type_and_content(self.msg_type(), self.content.clone())
            .map_err(|e| WireError::ContentParseError(e.to_string()))
    }
}
