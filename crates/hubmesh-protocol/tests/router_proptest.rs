use proptest::prelude::*;

use hubmesh_protocol::{Frame, Message, NodeId, PeerId, RouteAdvert, Router};

const NODES: usize = 6;

fn node_id(i: usize) -> NodeId {
    format!("node-{i}").parse().unwrap()
}

fn local() -> NodeId {
    "node-local".parse().unwrap()
}

#[derive(Debug, Clone)]
enum Step {
    /// Direct neighbour `from` advertises `(id, path)` pairs. Index NODES
    /// stands for the local node, so self-referencing loops get generated.
    Advertise { from: usize, adverts: Vec<(usize, Vec<usize>)> },
    Disconnect { from: usize },
    Reconnect { from: usize },
}

fn arb_step() -> impl Strategy<Value = Step> {
    let index = 0..=NODES;
    let advert = (index.clone(), prop::collection::vec(index, 0..4));
    prop_oneof![
        6 => (0..3usize, prop::collection::vec(advert, 0..6))
            .prop_map(|(from, adverts)| Step::Advertise { from, adverts }),
        1 => (0..3usize).prop_map(|from| Step::Disconnect { from }),
        1 => (0..3usize).prop_map(|from| Step::Reconnect { from }),
    ]
}

fn id_for(i: usize) -> NodeId {
    if i == NODES {
        local()
    } else {
        node_id(i)
    }
}

/// Router with direct neighbours node-0, node-1 and node-2.
fn connected_router() -> (Router, Vec<Option<PeerId>>) {
    let mut router = Router::new(local());
    let peers = (0..3)
        .map(|i| {
            let peer = PeerId::next();
            router.peer_connected(peer, node_id(i));
            Some(peer)
        })
        .collect();
    (router, peers)
}

fn advertise(router: &mut Router, peer: PeerId, adverts: Vec<RouteAdvert>) {
    router.handle_frame(peer, Frame::Hop(Message::Routing(adverts)));
}

fn check_invariants(router: &Router) -> Result<(), TestCaseError> {
    let me = local();
    for i in 0..NODES {
        let id = node_id(i);
        let Some(node) = router.node(&id) else { continue };
        prop_assert!(node.reachable(), "{id} kept with no records");
        let mut previous = 0;
        for record in node.records() {
            prop_assert!(!record.path.contains(&id), "{id} path loops through itself: {record:?}");
            prop_assert!(!record.path.contains(&me), "{id} path loops through us: {record:?}");
            prop_assert!(record.path.len() >= previous, "{id} records out of order");
            previous = record.path.len();
        }
        prop_assert_eq!(node.distance(), node.records().iter().map(|r| r.path.len()).min());
    }
    prop_assert!(router.node(&me).is_none());
    Ok(())
}

proptest! {
    /// No advertisement sequence produces a looping or unsorted record, and
    /// nodes without records are evicted.
    #[test]
    fn routes_never_loop(steps in prop::collection::vec(arb_step(), 1..40)) {
        let (mut router, mut peers) = connected_router();

        for step in steps {
            match step {
                Step::Advertise { from, adverts } => {
                    let Some(peer) = peers[from] else { continue };
                    let adverts = adverts
                        .into_iter()
                        .map(|(id, path)| RouteAdvert {
                            id: id_for(id),
                            path: path.into_iter().map(id_for).collect(),
                        })
                        .collect();
                    advertise(&mut router, peer, adverts);
                }
                Step::Disconnect { from } => {
                    if let Some(peer) = peers[from].take() {
                        router.peer_disconnected(peer);
                    }
                }
                Step::Reconnect { from } => {
                    if peers[from].is_none() {
                        let peer = PeerId::next();
                        router.peer_connected(peer, node_id(from));
                        peers[from] = Some(peer);
                    }
                }
            }
            check_invariants(&router)?;
        }
    }

    /// With a one-hop and a three-hop route to the same node, the one-hop
    /// route is active until its link closes.
    #[test]
    fn shortest_route_is_active_and_falls_back(short_first in any::<bool>()) {
        let (mut router, peers) = connected_router();
        let (short_peer, long_peer) = (peers[0].unwrap(), peers[1].unwrap());
        let target = node_id(5);

        let short = vec![RouteAdvert { id: target.clone(), path: vec![] }];
        let long = vec![RouteAdvert { id: target.clone(), path: vec![node_id(3), node_id(4)] }];
        if short_first {
            advertise(&mut router, short_peer, short);
            advertise(&mut router, long_peer, long);
        } else {
            advertise(&mut router, long_peer, long);
            advertise(&mut router, short_peer, short);
        }

        let node = router.node(&target).unwrap();
        prop_assert_eq!(node.records().len(), 2);
        prop_assert_eq!(node.active_peer(), Some(short_peer));
        prop_assert_eq!(node.path(), &[node_id(0)][..]);

        router.peer_disconnected(short_peer);
        let node = router.node(&target).unwrap();
        prop_assert_eq!(node.active_peer(), Some(long_peer));
        prop_assert_eq!(node.path(), &[node_id(1), node_id(3), node_id(4)][..]);

        router.peer_disconnected(long_peer);
        prop_assert!(router.node(&target).is_none());
    }
}
