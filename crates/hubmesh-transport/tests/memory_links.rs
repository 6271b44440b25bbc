//! Integration tests: several in-process transports linked together.

use hubmesh_transport::{LinkConfig, MemoryTransport, PeerEvent, PeerHandle};
use std::time::Duration;
use tokio::sync::mpsc;

async fn next_connected(rx: &mut mpsc::Receiver<PeerEvent>) -> PeerHandle {
    match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
        Ok(Some(PeerEvent::Connected(handle))) => handle,
        other => panic!("expected Connected, got {:?}", other),
    }
}

/// A hub linked to two leaves: each leaf only sees the hub.
#[tokio::test]
async fn hub_and_leaves() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .try_init();

    let (hub, mut hub_rx) = MemoryTransport::new("hub".parse().unwrap(), LinkConfig::new());
    let (left, mut left_rx) = MemoryTransport::new("left".parse().unwrap(), LinkConfig::new());
    let (right, mut right_rx) = MemoryTransport::new("right".parse().unwrap(), LinkConfig::new());

    hub.connect(&left).await.unwrap();
    hub.connect(&right).await.unwrap();

    let to_left = next_connected(&mut hub_rx).await;
    let to_right = next_connected(&mut hub_rx).await;
    let left_to_hub = next_connected(&mut left_rx).await;
    let right_to_hub = next_connected(&mut right_rx).await;

    assert_eq!(to_left.node_id().as_str(), "left");
    assert_eq!(to_right.node_id().as_str(), "right");
    assert_eq!(left_to_hub.node_id().as_str(), "hub");
    assert_eq!(right_to_hub.node_id().as_str(), "hub");
    assert_eq!(hub.links().len(), 2);

    // Frames from both leaves land on the hub, distinguishable by link.
    left_to_hub.send(b"from-left".to_vec()).unwrap();
    right_to_hub.send(b"from-right".to_vec()).unwrap();

    let mut seen = Vec::new();
    for _ in 0..2 {
        match hub_rx.recv().await {
            Some(PeerEvent::Message { peer, data }) => seen.push((peer, data.to_vec())),
            other => panic!("expected Message, got {:?}", other),
        }
    }
    assert!(seen.contains(&(to_left.id(), b"from-left".to_vec())));
    assert!(seen.contains(&(to_right.id(), b"from-right".to_vec())));

    // Shutting the hub down closes every link on both ends.
    hub.shutdown().await;
    assert!(hub.links().is_empty());
    assert!(matches!(left_rx.recv().await, Some(PeerEvent::Disconnected { .. })));
    assert!(matches!(right_rx.recv().await, Some(PeerEvent::Disconnected { .. })));
}
