use std::collections::HashMap;

use bytes::Bytes;
use hubmesh_transport::{PeerHandle, TransportError};

use crate::types::PeerId;

/// Outgoing side of the links the runtime knows about.
///
/// In production: a [`PeerTable`] fed from `PeerEvent::Connected`.
/// In tests: `MockTransport`, which records every send.
#[async_trait::async_trait]
pub trait Transport: Send {
    /// Write one encoded frame to `peer`.
    async fn send_raw(&self, peer: PeerId, data: Bytes) -> Result<(), TransportError>;
}

// ── PeerTable (production) ──────────────────────────────────────────

/// Live links by connection identity.
#[derive(Default)]
pub struct PeerTable {
    peers: HashMap<PeerId, PeerHandle>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, handle: PeerHandle) {
        self.peers.insert(handle.id(), handle);
    }

    pub fn remove(&mut self, peer: PeerId) -> Option<PeerHandle> {
        self.peers.remove(&peer)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[async_trait::async_trait]
impl Transport for PeerTable {
    async fn send_raw(&self, peer: PeerId, data: Bytes) -> Result<(), TransportError> {
        match self.peers.get(&peer) {
            Some(handle) => handle.send(data),
            None => Err(TransportError::UnknownPeer(peer)),
        }
    }
}

// ── MockTransport (tests) ───────────────────────────────────────────
