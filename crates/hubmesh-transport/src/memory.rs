//! In-process transport.
//!
//! Every [`MemoryTransport`] owns an event channel. Linking two transports
//! hands each side a [`PeerHandle`] whose sink pushes frames straight into
//! the other side's channel, tagged with the other side's [`PeerId`] for
//! that link.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::config::LinkConfig;
use crate::peer::{FrameSink, PeerEvent, PeerHandle};
use crate::{NodeId, PeerId, TransportError};

/// Bookkeeping for one end of a link.
struct LinkEnd {
    remote_peer: PeerId,
    remote: Weak<Inner>,
    closed: Arc<AtomicBool>,
}

struct Inner {
    node_id: NodeId,
    config: LinkConfig,
    events: mpsc::Sender<PeerEvent>,
    links: Mutex<HashMap<PeerId, LinkEnd>>,
}

impl Inner {
    fn take_link(&self, peer: PeerId) -> Option<LinkEnd> {
        self.links.lock().ok()?.remove(&peer)
    }
}

struct MemorySink {
    /// Identity of this link as seen by the receiving side.
    deliver_as: PeerId,
    target: mpsc::Sender<PeerEvent>,
    closed: Arc<AtomicBool>,
    max_frame_size: usize,
}

impl FrameSink for MemorySink {
    fn send(&self, data: Bytes) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed {
                peer: self.deliver_as,
            });
        }
        if data.len() > self.max_frame_size {
            return Err(TransportError::MessageTooLarge {
                size: data.len(),
                max: self.max_frame_size,
            });
        }
        self.target
            .try_send(PeerEvent::Message {
                peer: self.deliver_as,
                data,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => TransportError::Backpressure {
                    peer: self.deliver_as,
                },
                mpsc::error::TrySendError::Closed(_) => TransportError::Closed {
                    peer: self.deliver_as,
                },
            })
    }
}

/// A node's attachment point to an in-process mesh.
///
/// Cheap to clone; clones share the same links and event channel.
#[derive(Clone)]
pub struct MemoryTransport {
    inner: Arc<Inner>,
}

impl MemoryTransport {
    /// Create a transport for `node_id`. The receiver yields every
    /// [`PeerEvent`] for links attached to this node.
    pub fn new(node_id: NodeId, config: LinkConfig) -> (Self, mpsc::Receiver<PeerEvent>) {
        let (events, rx) = mpsc::channel(config.buffer);
        let inner = Arc::new(Inner {
            node_id,
            config,
            events,
            links: Mutex::new(HashMap::new()),
        });
        (Self { inner }, rx)
    }

    /// This node's identity.
    pub fn node_id(&self) -> &NodeId {
        &self.inner.node_id
    }

    /// Live links owned by this node.
    pub fn links(&self) -> Vec<PeerId> {
        self.inner
            .links
            .lock()
            .map(|links| links.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Link this node with `other`.
    ///
    /// Both sides receive [`PeerEvent::Connected`] before any frame can be
    /// sent over the new link. Returns `(local, remote)` peer ids.
    pub async fn connect(&self, other: &MemoryTransport) -> Result<(PeerId, PeerId), TransportError> {
        if Arc::ptr_eq(&self.inner, &other.inner) {
            return Err(TransportError::Config(
                "cannot link a transport to itself".into(),
            ));
        }

        let local_peer = PeerId::next();
        let remote_peer = PeerId::next();
        let closed = Arc::new(AtomicBool::new(false));

        let local_handle = PeerHandle::new(
            local_peer,
            other.inner.node_id.clone(),
            Arc::new(MemorySink {
                deliver_as: remote_peer,
                target: other.inner.events.clone(),
                closed: closed.clone(),
                max_frame_size: self.inner.config.max_frame_size,
            }),
        );
        let remote_handle = PeerHandle::new(
            remote_peer,
            self.inner.node_id.clone(),
            Arc::new(MemorySink {
                deliver_as: local_peer,
                target: self.inner.events.clone(),
                closed: closed.clone(),
                max_frame_size: other.inner.config.max_frame_size,
            }),
        );

        self.register_link(local_peer, remote_peer, &other.inner, &closed)?;
        other.register_link(remote_peer, local_peer, &self.inner, &closed)?;

        let local_permit = self
            .inner
            .events
            .reserve()
            .await
            .map_err(|_| TransportError::Shutdown)?;
        let remote_permit = other
            .inner
            .events
            .reserve()
            .await
            .map_err(|_| TransportError::Shutdown)?;
        local_permit.send(PeerEvent::Connected(local_handle));
        remote_permit.send(PeerEvent::Connected(remote_handle));

        tracing::debug!(
            local = %self.inner.node_id,
            remote = %other.inner.node_id,
            %local_peer,
            %remote_peer,
            "memory link established"
        );
        Ok((local_peer, remote_peer))
    }

    /// Close one link. Both ends receive [`PeerEvent::Disconnected`].
    pub async fn disconnect(&self, peer: PeerId) -> Result<(), TransportError> {
        let link = self
            .inner
            .take_link(peer)
            .ok_or(TransportError::UnknownPeer(peer))?;
        link.closed.store(true, Ordering::Release);

        let _ = self
            .inner
            .events
            .send(PeerEvent::Disconnected { peer })
            .await;

        if let Some(remote) = link.remote.upgrade() {
            if remote.take_link(link.remote_peer).is_some() {
                let _ = remote
                    .events
                    .send(PeerEvent::Disconnected {
                        peer: link.remote_peer,
                    })
                    .await;
            }
        }

        tracing::debug!(node = %self.inner.node_id, %peer, "memory link closed");
        Ok(())
    }

    /// Close every link owned by this node.
    pub async fn shutdown(&self) {
        for peer in self.links() {
            let _ = self.disconnect(peer).await;
        }
    }

    fn register_link(
        &self,
        local: PeerId,
        remote_peer: PeerId,
        remote: &Arc<Inner>,
        closed: &Arc<AtomicBool>,
    ) -> Result<(), TransportError> {
        let mut links = self
            .inner
            .links
            .lock()
            .map_err(|_| TransportError::Shutdown)?;
        links.insert(
            local,
            LinkEnd {
                remote_peer,
                remote: Arc::downgrade(remote),
                closed: closed.clone(),
            },
        );
        Ok(())
    }
}
