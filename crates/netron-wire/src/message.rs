//! Wire protocol message types.
//!
//! All communication between Netron peers uses JSON-framed messages. Each
//! message is prefixed with a 4-byte big-endian length header.

use netron_types::{DefId, Definition, RemoteError, WireValue};
use serde::{Deserialize, Serialize};

/// Correlation id used by the handshake and by notifications.
pub const UNCORRELATED: u64 = 0;

/// A wire protocol message (envelope).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    /// Request id; responses carry the id of the request they answer.
    pub id: u64,
    /// Message variant.
    #[serde(flatten)]
    pub kind: WireMessageKind,
}

impl WireMessage {
    /// A request with the given correlation id.
    pub fn request(id: u64, request: WireRequest) -> Self {
        Self {
            id,
            kind: WireMessageKind::Request(request),
        }
    }

    /// A response to the request with the given id.
    pub fn response(id: u64, response: WireResponse) -> Self {
        Self {
            id,
            kind: WireMessageKind::Response(response),
        }
    }

    /// A one-way notification.
    pub fn notification(notification: WireNotification) -> Self {
        Self {
            id: UNCORRELATED,
            kind: WireMessageKind::Notification(notification),
        }
    }
}

/// The different kinds of wire messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireMessageKind {
    /// Request from one peer to another.
    #[serde(rename = "request")]
    Request(WireRequest),
    /// Response to a request.
    #[serde(rename = "response")]
    Response(WireResponse),
    /// One-way notification (no response expected).
    #[serde(rename = "notification")]
    Notification(WireNotification),
}

/// Request messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method")]
pub enum WireRequest {
    /// Handshake: exchange identity and the current set of strong contexts.
    #[serde(rename = "handshake")]
    Handshake {
        /// The peer's unique node ID.
        node_id: String,
        /// Human-readable node name.
        node_name: String,
        /// Protocol version.
        protocol_version: u32,
        /// Contexts currently attached on the sender.
        contexts: Vec<Definition>,
    },
    /// Call a method or read a property.
    #[serde(rename = "invoke")]
    Invoke {
        def_id: DefId,
        member: String,
        payload: WireValue,
    },
    /// Write a property or call a method without a result.
    #[serde(rename = "assign")]
    Assign {
        def_id: DefId,
        member: String,
        payload: WireValue,
    },
    /// Ask for metadata entries ("ability", "contexts").
    #[serde(rename = "meta")]
    Meta { ids: Vec<String> },
    /// Ping to check if the peer is alive.
    #[serde(rename = "ping")]
    Ping,
}

/// Response messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method")]
pub enum WireResponse {
    /// Handshake acknowledgement.
    #[serde(rename = "handshake_ack")]
    HandshakeAck {
        node_id: String,
        node_name: String,
        protocol_version: u32,
        contexts: Vec<Definition>,
    },
    /// Successful invoke.
    #[serde(rename = "result")]
    Result { value: WireValue },
    /// Successful assign.
    #[serde(rename = "done")]
    Done,
    /// Metadata entries, in request order.
    #[serde(rename = "meta_result")]
    MetaResult { entries: Vec<MetaEntry> },
    /// Pong response.
    #[serde(rename = "pong")]
    Pong {
        /// Uptime in seconds.
        uptime_secs: u64,
    },
    /// Failed request.
    #[serde(rename = "error")]
    Error { error: RemoteError },
}

/// Notification messages (one-way, no response).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum WireNotification {
    /// A context was attached on the sender.
    #[serde(rename = "context_attach")]
    ContextAttach {
        ctx_id: String,
        definition: Definition,
    },
    /// A context was detached on the sender.
    #[serde(rename = "context_detach")]
    ContextDetach { ctx_id: String, def_id: DefId },
    /// Peer is shutting down.
    #[serde(rename = "shutting_down")]
    ShuttingDown,
}

/// One answered metadata request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaEntry {
    /// Requested metadata id.
    pub id: String,
    /// Value, when the id is known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Failure, when it is not.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteError>,
}

/// Current protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Encode a wire message to bytes (4-byte big-endian length + JSON).
pub fn encode_message(msg: &WireMessage) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_vec(msg)?;
    let len = json.len() as u32;
    let mut bytes = Vec::with_capacity(4 + json.len());
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(&json);
    Ok(bytes)
}

/// Decode the length prefix from a 4-byte header.
pub fn decode_length(header: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*header)
}

/// Parse a JSON body into a WireMessage.
pub fn decode_message(body: &[u8]) -> Result<WireMessage, serde_json::Error> {
    serde_json::from_slice(body)
}
