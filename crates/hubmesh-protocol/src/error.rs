/// Protocol-level errors for hubmesh.
///
/// Wraps transport errors and adds registry, storage and
/// serialization variants. Never sent over the wire.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("transport error: {0}")]
    Transport(#[from] hubmesh_transport::TransportError),

    #[error("invalid device id {id:?}: expected <namespace>:<name>")]
    InvalidDeviceId { id: String },

    #[error("Action {action} needs to be implemented by device (from {required_by})")]
    MissingAction { action: String, required_by: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("runtime shut down")]
    Shutdown,
}

impl From<rmp_serde::encode::Error> for MeshError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        MeshError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for MeshError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        MeshError::Deserialization(e.to_string())
    }
}

impl From<rusqlite::Error> for MeshError {
    fn from(e: rusqlite::Error) -> Self {
        MeshError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(e: serde_json::Error) -> Self {
        MeshError::Storage(e.to_string())
    }
}

/// Why a device call failed.
///
/// Only the display string crosses the wire: a remote failure arrives as
/// [`CallError::Failed`] carrying the callee's message verbatim.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    #[error("Unknown Device")]
    UnknownDevice,

    #[error("Device is no longer available")]
    Unavailable,

    #[error("Call timed out")]
    TimedOut,

    #[error("No action named {0}")]
    NoSuchAction(String),

    #[error("runtime shut down")]
    Shutdown,

    #[error("{0}")]
    Failed(String),
}

impl CallError {
    /// Error raised by a device implementation.
    pub fn failed(message: impl Into<String>) -> Self {
        CallError::Failed(message.into())
    }
}
