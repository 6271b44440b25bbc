/// Wire types exchanged between nodes.
///
/// Every frame on a link is one MessagePack-encoded [`Frame`]. Single-hop
/// traffic (routing gossip) travels as [`Frame::Hop`]; everything else is
/// an addressed [`Envelope`] that relays forward untouched.
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::device::DeviceDescriptor;
use crate::error::MeshError;
use crate::types::NodeId;

// ── Payloads ───────────────────────────────────────────────────────────

/// One entry of a routing advertisement: a node the sender can reach and
/// the sender's best path to it (sender and target excluded).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteAdvert {
    pub id: NodeId,
    pub path: Vec<NodeId>,
}

/// Identifies one registration of a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRef {
    pub id: String,
    pub instance: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceEventPayload {
    pub id: String,
    pub instance: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeRequest {
    pub id: String,
    pub seq: u64,
    pub action: String,
    #[serde(default)]
    pub arguments: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeProgress {
    pub id: String,
    pub seq: u64,
    #[serde(default)]
    pub data: Value,
}

/// Final answer to an [`InvokeRequest`]. `error` wins over `result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeResult {
    pub id: String,
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl InvokeResult {
    pub fn ok(id: String, seq: u64, result: Value) -> Self {
        Self {
            id,
            seq,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: String, seq: u64, error: impl Into<String>) -> Self {
        Self {
            id,
            seq,
            result: None,
            error: Some(error.into()),
        }
    }
}

// ── Messages ───────────────────────────────────────────────────────────

/// Application message: `{ type, payload }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Message {
    #[serde(rename = "routing")]
    Routing(Vec<RouteAdvert>),
    #[serde(rename = "device:available")]
    DeviceAvailable(DeviceDescriptor),
    #[serde(rename = "device:unavailable")]
    DeviceUnavailable(DeviceRef),
    #[serde(rename = "device:event")]
    DeviceEvent(DeviceEventPayload),
    #[serde(rename = "device:invoke")]
    Invoke(InvokeRequest),
    #[serde(rename = "device:invoke-progress")]
    InvokeProgress(InvokeProgress),
    #[serde(rename = "device:invoke-result")]
    InvokeResult(InvokeResult),
}

impl Message {
    /// The wire `type` string.
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Routing(_) => "routing",
            Message::DeviceAvailable(_) => "device:available",
            Message::DeviceUnavailable(_) => "device:unavailable",
            Message::DeviceEvent(_) => "device:event",
            Message::Invoke(_) => "device:invoke",
            Message::InvokeProgress(_) => "device:invoke-progress",
            Message::InvokeResult(_) => "device:invoke-result",
        }
    }
}

/// A message addressed across the mesh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub source: NodeId,
    pub target: NodeId,
    pub message: Message,
}

/// One frame on a link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frame {
    /// Only meaningful to the directly connected peer.
    Hop(Message),
    /// Relayed hop by hop until it reaches `target`.
    Routed(Envelope),
}

impl Frame {
    /// Serialize to MessagePack bytes (field names kept).
    pub fn to_bytes(&self) -> Result<Vec<u8>, MeshError> {
        rmp_serde::to_vec_named(self).map_err(Into::into)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, MeshError> {
        rmp_serde::from_slice(data).map_err(Into::into)
    }

    pub fn message(&self) -> &Message {
        match self {
            Frame::Hop(message) => message,
            Frame::Routed(envelope) => &envelope.message,
        }
    }
}
