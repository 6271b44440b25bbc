//! hubmesh transport layer.
//!
//! Defines what the mesh core needs from a physical transport: a stable
//! node identity, an opaque per-connection peer identity, a cheap sender
//! tied to one connection, and a stream of connect / message / disconnect
//! events. Socket transports and discovery live outside this crate; the
//! bundled [`MemoryTransport`] links nodes inside one process.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use hubmesh_transport::{LinkConfig, MemoryTransport, NodeId, PeerEvent};
//!
//! # async fn example() -> Result<(), hubmesh_transport::TransportError> {
//! let (a, _a_events) = MemoryTransport::new(NodeId::generate(), LinkConfig::new());
//! let (b, mut b_events) = MemoryTransport::new(NodeId::generate(), LinkConfig::new());
//!
//! a.connect(&b).await?;
//!
//! if let Some(PeerEvent::Connected(peer)) = b_events.recv().await {
//!     println!("{} connected as {}", peer.node_id(), peer.id());
//! }
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod memory;
mod peer;

pub use config::LinkConfig;
pub use error::TransportError;
pub use memory::MemoryTransport;
pub use peer::{FrameSink, PeerEvent, PeerHandle};

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Mesh identity of a process.
///
/// Stable for the lifetime of the process and advertised to peers during
/// the transport handshake. Serialized as a plain string.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Generate a fresh random identity.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Borrow the identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = if self.0.len() > 12 { &self.0[..12] } else { &self.0 };
        write!(f, "NodeId({short})")
    }
}

impl FromStr for NodeId {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.chars().any(char::is_whitespace) {
            return Err(TransportError::InvalidNodeId(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one live connection.
///
/// Compared by identity, never by the node it claims to reach: two links
/// to the same [`NodeId`] have distinct `PeerId`s.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct PeerId(u64);

impl PeerId {
    /// Allocate a process-unique connection identity.
    pub fn next() -> Self {
        Self(NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_parse_and_display() {
        let id: NodeId = "kitchen-hub".parse().unwrap();
        assert_eq!(id.to_string(), "kitchen-hub");
        assert_eq!(id.as_str(), "kitchen-hub");
    }

    #[test]
    fn node_id_rejects_empty_and_whitespace() {
        assert!(matches!(
            "".parse::<NodeId>(),
            Err(TransportError::InvalidNodeId(_))
        ));
        assert!("a b".parse::<NodeId>().is_err());
    }

    #[test]
    fn node_id_serializes_as_plain_string() {
        let id: NodeId = "n1".parse().unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"n1\"");
        let back: NodeId = serde_json::from_str("\"n1\"").unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn generated_ids_are_distinct() {
        assert_ne!(NodeId::generate(), NodeId::generate());
    }

    #[test]
    fn peer_ids_are_unique() {
        let a = PeerId::next();
        let b = PeerId::next();
        assert_ne!(a, b);
        assert!(b.as_u64() > a.as_u64());
    }
}
