use crate::PeerId;

/// Errors returned by the hubmesh transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("link {peer} is closed")]
    Closed { peer: PeerId },

    #[error("send buffer for {peer} is full")]
    Backpressure { peer: PeerId },

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("unknown peer: {0}")]
    UnknownPeer(PeerId),

    #[error("transport is shut down")]
    Shutdown,

    #[error("invalid node id: {0:?}")]
    InvalidNodeId(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}
