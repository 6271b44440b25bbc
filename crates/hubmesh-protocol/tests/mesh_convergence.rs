/// Node graph over real runtimes and in-process links.
///
/// A ── B ── C, optionally with a direct A ── C shortcut.
mod common;

use common::{init_tracing, spawn_node, wait_for_no_route, wait_for_route, TestNode};
use hubmesh_protocol::MeshEvent;

#[tokio::test]
async fn chain_converges_to_two_hop_routes() {
    init_tracing();
    let a = spawn_node("node-a");
    let b = spawn_node("node-b");
    let c = spawn_node("node-c");

    a.transport.connect(&b.transport).await.unwrap();
    b.transport.connect(&c.transport).await.unwrap();

    wait_for_route(&a, &b.id, &[]).await;
    wait_for_route(&a, &c.id, &[&b.id]).await;
    wait_for_route(&c, &a.id, &[&b.id]).await;

    let from_b = b.handle.nodes().await;
    assert_eq!(from_b.len(), 2);
    assert!(from_b.iter().all(|n| n.direct));
}

#[tokio::test]
async fn shortcut_wins_and_chain_takes_over_when_it_closes() {
    init_tracing();
    let a = spawn_node("node-a");
    let b = spawn_node("node-b");
    let c = spawn_node("node-c");

    a.transport.connect(&b.transport).await.unwrap();
    b.transport.connect(&c.transport).await.unwrap();
    let (shortcut, _) = a.transport.connect(&c.transport).await.unwrap();

    wait_for_route(&a, &c.id, &[]).await;
    let snapshot = a.handle.nodes().await;
    let to_c = snapshot.iter().find(|n| n.id == c.id).unwrap();
    assert!(to_c.direct);

    // Both records were learned; dropping the link falls back to B.
    wait_for_records(&a, &c, 2).await;
    a.transport.disconnect(shortcut).await.unwrap();
    wait_for_route(&a, &c.id, &[&b.id]).await;
}

#[tokio::test]
async fn losing_the_only_link_evicts_everything_behind_it() {
    init_tracing();
    let mut a = spawn_node("node-a");
    let b = spawn_node("node-b");
    let c = spawn_node("node-c");

    let (a_to_b, _) = a.transport.connect(&b.transport).await.unwrap();
    b.transport.connect(&c.transport).await.unwrap();
    wait_for_route(&a, &c.id, &[&b.id]).await;

    a.transport.disconnect(a_to_b).await.unwrap();
    wait_for_no_route(&a, &b.id).await;
    wait_for_no_route(&a, &c.id).await;

    let c_id = c.id.clone();
    let event = common::next_event(&mut a, |e| matches!(e, MeshEvent::NodeDisconnected(n) if *n == c_id)).await;
    assert_eq!(event, MeshEvent::NodeDisconnected(c.id.clone()));
}

async fn wait_for_records(node: &TestNode, target: &TestNode, records: usize) {
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        let count = node
            .handle
            .nodes()
            .await
            .into_iter()
            .find(|n| n.id == target.id)
            .map_or(0, |n| n.records);
        if count == records {
            return;
        }
        assert!(tokio::time::Instant::now() < deadline, "{count} records to {}", target.id);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}
