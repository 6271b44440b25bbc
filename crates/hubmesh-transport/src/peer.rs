use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::{NodeId, PeerId, TransportError};

/// Outgoing side of one connection.
///
/// Implemented by each concrete transport. `send` never blocks: a full or
/// closed link reports an error and the frame is dropped.
pub trait FrameSink: Send + Sync {
    fn send(&self, data: Bytes) -> Result<(), TransportError>;
}

/// Sender tied to one live connection, available after the handshake.
///
/// Cheap to clone. Equality is by connection identity ([`PeerId`]).
#[derive(Clone)]
pub struct PeerHandle {
    id: PeerId,
    node_id: NodeId,
    sink: Arc<dyn FrameSink>,
}

impl PeerHandle {
    pub fn new(id: PeerId, node_id: NodeId, sink: Arc<dyn FrameSink>) -> Self {
        Self { id, node_id, sink }
    }

    /// Connection identity.
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Node the remote end advertised during the handshake.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Send one frame to the remote end.
    pub fn send(&self, data: impl Into<Bytes>) -> Result<(), TransportError> {
        self.sink.send(data.into())
    }
}

impl PartialEq for PeerHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for PeerHandle {}

impl fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerHandle[{} -> {}]", self.id, self.node_id)
    }
}

/// Connection lifecycle events a transport delivers to its owner.
#[derive(Debug)]
pub enum PeerEvent {
    /// A connection finished its handshake.
    Connected(PeerHandle),
    /// A frame arrived on a connection.
    Message { peer: PeerId, data: Bytes },
    /// A connection closed. No further events follow for `peer`.
    Disconnected { peer: PeerId },
}
