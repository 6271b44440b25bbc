/// Node graph and path-vector router.
///
/// Pure decision logic: peer lifecycle and inbound frames go in, a list of
/// `RoutingAction`s comes out telling the caller what to transmit, what to
/// deliver and which nodes came or went. No I/O, no timers.
use std::collections::{HashMap, HashSet};

use crate::envelope::{Envelope, Frame, Message, RouteAdvert};
use crate::types::{NodeId, PeerId};

// ── Routing decisions ──────────────────────────────────────────────────

/// What the caller should do after a router state change.
#[derive(Debug, Clone, PartialEq)]
pub enum RoutingAction {
    /// Write `frame` to the link identified by `peer`.
    Transmit { peer: PeerId, frame: Frame },
    /// A message addressed to us arrived from `source`.
    Deliver { source: NodeId, message: Message },
    /// `node` gained its first reachability record.
    NodeConnected(NodeId),
    /// `node` lost its last reachability record and was evicted.
    NodeDisconnected(NodeId),
    /// Reachability changed: advertise again once the debounce expires.
    ScheduleGossip,
}

// ── Node ───────────────────────────────────────────────────────────────

/// One known way to reach a node: the link to use and the intermediate
/// hops behind it (self and target excluded).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reachability {
    pub peer: PeerId,
    pub path: Vec<NodeId>,
}

/// Outcome of offering a reachability record to a [`Node`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordChange {
    Added,
    Updated,
    Unchanged,
    /// The path would loop; any existing record via that peer was dropped.
    Rejected { removed: bool },
}

impl RecordChange {
    pub fn changed(self) -> bool {
        matches!(
            self,
            RecordChange::Added | RecordChange::Updated | RecordChange::Rejected { removed: true }
        )
    }
}

/// A logical participant and every known route to it.
///
/// Records stay sorted by ascending path length; the sort is stable so the
/// first record registered wins among equal-length routes.
#[derive(Debug, Clone)]
pub struct Node {
    id: NodeId,
    reachability: Vec<Reachability>,
}

impl Node {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            reachability: Vec::new(),
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn records(&self) -> &[Reachability] {
        &self.reachability
    }

    pub fn reachable(&self) -> bool {
        !self.reachability.is_empty()
    }

    /// Link of the active (shortest) route.
    pub fn active_peer(&self) -> Option<PeerId> {
        self.reachability.first().map(|r| r.peer)
    }

    /// Hops of the active route; empty when unreachable.
    pub fn path(&self) -> &[NodeId] {
        self.reachability
            .first()
            .map(|r| r.path.as_slice())
            .unwrap_or(&[])
    }

    /// Whether the active route is a zero-hop link.
    pub fn direct(&self) -> bool {
        self.reachability
            .first()
            .is_some_and(|r| r.path.is_empty())
    }

    /// Intermediate hop count of the active route.
    pub fn distance(&self) -> Option<usize> {
        self.reachability.first().map(|r| r.path.len())
    }

    /// Add or refresh the record learned through `peer`.
    ///
    /// `local_id` is the id of the router owning this node; a path through
    /// it, or through the node itself, is a loop and is refused.
    pub fn add_reachability(&mut self, peer: PeerId, path: Vec<NodeId>, local_id: &NodeId) -> RecordChange {
        if path.contains(&self.id) || path.contains(local_id) {
            let removed = self.remove_reachability(peer);
            return RecordChange::Rejected { removed };
        }

        let change = match self.reachability.iter_mut().find(|r| r.peer == peer) {
            Some(existing) if existing.path == path => return RecordChange::Unchanged,
            Some(existing) => {
                existing.path = path;
                RecordChange::Updated
            }
            None => {
                self.reachability.push(Reachability { peer, path });
                RecordChange::Added
            }
        };
        self.reachability.sort_by_key(|r| r.path.len());
        change
    }

    /// Drop the record learned through `peer`. Returns whether one existed.
    pub fn remove_reachability(&mut self, peer: PeerId) -> bool {
        let before = self.reachability.len();
        self.reachability.retain(|r| r.peer != peer);
        self.reachability.len() != before
    }
}

/// Read-only view of a node for introspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub path: Vec<NodeId>,
    pub direct: bool,
    pub records: usize,
}

// ── Router ─────────────────────────────────────────────────────────────

/// Owns the node table of one process.
pub struct Router {
    local_id: NodeId,
    nodes: HashMap<NodeId, Node>,
    /// Node each live link advertised at handshake.
    peers: HashMap<PeerId, NodeId>,
}

impl Router {
    pub fn new(local_id: NodeId) -> Self {
        Self {
            local_id,
            nodes: HashMap::new(),
            peers: HashMap::new(),
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn is_reachable(&self, id: &NodeId) -> bool {
        self.nodes.get(id).is_some_and(Node::reachable)
    }

    /// Intermediate hop count to `id`, if reachable.
    pub fn distance(&self, id: &NodeId) -> Option<usize> {
        self.nodes.get(id).and_then(Node::distance)
    }

    /// Node a live link belongs to.
    pub fn peer_node(&self, peer: PeerId) -> Option<&NodeId> {
        self.peers.get(&peer)
    }

    /// Snapshot of every known node, sorted by id.
    pub fn nodes(&self) -> Vec<NodeSnapshot> {
        let mut out: Vec<NodeSnapshot> = self
            .nodes
            .values()
            .map(|n| NodeSnapshot {
                id: n.id.clone(),
                path: n.path().to_vec(),
                direct: n.direct(),
                records: n.reachability.len(),
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    // ── Peer lifecycle ─────────────────────────────────────────────────

    /// A link to `node_id` finished its handshake.
    pub fn peer_connected(&mut self, peer: PeerId, node_id: NodeId) -> Vec<RoutingAction> {
        if node_id == self.local_id {
            tracing::warn!(%peer, "ignoring link that claims our own node id");
            return Vec::new();
        }
        self.peers.insert(peer, node_id.clone());

        let mut actions = Vec::new();
        let node = self
            .nodes
            .entry(node_id.clone())
            .or_insert_with(|| Node::new(node_id.clone()));
        let was_reachable = node.reachable();
        let change = node.add_reachability(peer, Vec::new(), &self.local_id);
        if !was_reachable && node.reachable() {
            tracing::info!(node = %node_id, %peer, "node reachable directly");
            actions.push(RoutingAction::NodeConnected(node_id));
        }
        if change.changed() {
            actions.push(RoutingAction::ScheduleGossip);
        }
        actions
    }

    /// A link closed. Only records learned through it are removed; routes
    /// other nodes advertised through third parties heal on the next round.
    pub fn peer_disconnected(&mut self, peer: PeerId) -> Vec<RoutingAction> {
        let Some(node_id) = self.peers.remove(&peer) else {
            return Vec::new();
        };
        tracing::debug!(node = %node_id, %peer, "link closed");

        let mut actions = Vec::new();
        let mut changed = false;
        for node in self.nodes.values_mut() {
            changed |= node.remove_reachability(peer);
        }
        actions.extend(self.evict_unreachable());
        if changed {
            actions.push(RoutingAction::ScheduleGossip);
        }
        actions
    }

    // ── Inbound ────────────────────────────────────────────────────────

    /// Process one frame received on `peer`.
    pub fn handle_frame(&mut self, peer: PeerId, frame: Frame) -> Vec<RoutingAction> {
        let Some(sender) = self.peers.get(&peer).cloned() else {
            tracing::debug!(%peer, "frame from unknown link dropped");
            return Vec::new();
        };

        match frame {
            Frame::Hop(Message::Routing(adverts)) => self.handle_routing(peer, &sender, adverts),
            Frame::Hop(message) => vec![RoutingAction::Deliver {
                source: sender,
                message,
            }],
            Frame::Routed(envelope) if envelope.target == self.local_id => match envelope.message {
                Message::Routing(adverts) => self.handle_routing(peer, &sender, adverts),
                message => vec![RoutingAction::Deliver {
                    source: envelope.source,
                    message,
                }],
            },
            Frame::Routed(envelope) => self.forward(envelope).into_iter().collect(),
        }
    }

    /// Relay an envelope along the target's active route, untouched.
    fn forward(&self, envelope: Envelope) -> Option<RoutingAction> {
        match self.nodes.get(&envelope.target).and_then(Node::active_peer) {
            Some(peer) => {
                tracing::trace!(
                    source = %envelope.source,
                    target = %envelope.target,
                    %peer,
                    "forwarding"
                );
                Some(RoutingAction::Transmit {
                    peer,
                    frame: Frame::Routed(envelope),
                })
            }
            None => {
                tracing::debug!(
                    target = %envelope.target,
                    kind = envelope.message.type_name(),
                    "no route, dropping"
                );
                None
            }
        }
    }

    /// Merge a routing advertisement received from `sender` over `peer`.
    fn handle_routing(&mut self, peer: PeerId, sender: &NodeId, adverts: Vec<RouteAdvert>) -> Vec<RoutingAction> {
        let mut actions = Vec::new();
        let mut changed = false;
        let mut available: HashSet<NodeId> = HashSet::with_capacity(adverts.len() + 1);
        available.insert(sender.clone());

        for advert in adverts {
            available.insert(advert.id.clone());
            if advert.id == self.local_id {
                continue;
            }

            let mut path = Vec::with_capacity(advert.path.len() + 1);
            path.push(sender.clone());
            path.extend(advert.path);

            let looping = path.contains(&advert.id) || path.contains(&self.local_id);
            if looping && !self.nodes.contains_key(&advert.id) {
                continue;
            }
            let node = self
                .nodes
                .entry(advert.id.clone())
                .or_insert_with(|| Node::new(advert.id.clone()));

            let was_reachable = node.reachable();
            let change = node.add_reachability(peer, path, &self.local_id);
            changed |= change.changed();
            if !was_reachable && node.reachable() {
                tracing::info!(node = %advert.id, via = %sender, "node reachable through gossip");
                actions.push(RoutingAction::NodeConnected(advert.id));
            }
        }

        for node in self.nodes.values_mut() {
            if !available.contains(&node.id) {
                changed |= node.remove_reachability(peer);
            }
        }
        actions.extend(self.evict_unreachable());

        if changed {
            actions.push(RoutingAction::ScheduleGossip);
        }
        actions
    }

    fn evict_unreachable(&mut self) -> Vec<RoutingAction> {
        let gone: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|n| !n.reachable())
            .map(|n| n.id.clone())
            .collect();
        gone.into_iter()
            .map(|id| {
                self.nodes.remove(&id);
                tracing::info!(node = %id, "node no longer reachable");
                RoutingAction::NodeDisconnected(id)
            })
            .collect()
    }

    // ── Outbound ───────────────────────────────────────────────────────

    /// Address `message` to `target`. `None` when there is no route.
    pub fn send(&self, target: &NodeId, message: Message) -> Option<RoutingAction> {
        self.forward(Envelope {
            source: self.local_id.clone(),
            target: target.clone(),
            message,
        })
    }

    /// Address `message` to every known node once, each over its best path.
    pub fn broadcast(&self, message: &Message) -> Vec<RoutingAction> {
        let mut targets: Vec<&NodeId> = self.nodes.keys().collect();
        targets.sort();
        targets
            .into_iter()
            .filter_map(|target| self.send(target, message.clone()))
            .collect()
    }

    /// Send `message` as a single-hop frame to directly connected nodes only.
    pub fn limited_broadcast(&self, message: &Message) -> Vec<RoutingAction> {
        let mut direct: Vec<&Node> = self.nodes.values().filter(|n| n.direct()).collect();
        direct.sort_by(|a, b| a.id.cmp(&b.id));
        direct
            .into_iter()
            .filter_map(|n| {
                n.active_peer().map(|peer| RoutingAction::Transmit {
                    peer,
                    frame: Frame::Hop(message.clone()),
                })
            })
            .collect()
    }

    /// Everything we can reach, with our best path to each.
    pub fn routing_advertisement(&self) -> Vec<RouteAdvert> {
        let mut adverts: Vec<RouteAdvert> = self
            .nodes
            .values()
            .filter(|n| n.reachable())
            .map(|n| RouteAdvert {
                id: n.id.clone(),
                path: n.path().to_vec(),
            })
            .collect();
        adverts.sort_by(|a, b| a.id.cmp(&b.id));
        adverts
    }

    /// Frames for one gossip round.
    pub fn gossip(&self) -> Vec<RoutingAction> {
        self.limited_broadcast(&Message::Routing(self.routing_advertisement()))
    }
}
