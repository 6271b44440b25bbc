/// Nodes that join after devices were registered still learn about them,
/// without waiting for the periodic re-announcement.
mod common;

use common::{init_tracing, next_event, spawn_node, wait_for_device, wait_for_route, Lamp};
use hubmesh_protocol::{MeshEvent, MemoryStore, MeshRuntime, MetadataStore, RuntimeChannels};
use hubmesh_transport::{LinkConfig, MemoryTransport, NodeId};
use serde_json::json;
use std::sync::Arc;

#[tokio::test]
async fn direct_joiner_receives_device_list() {
    init_tracing();
    let a = spawn_node("node-a");
    let mut b = spawn_node("node-b");
    a.handle.register("light:kitchen", Lamp::default()).await.unwrap();
    a.handle.register("light:hall", Lamp::default()).await.unwrap();

    a.transport.connect(&b.transport).await.unwrap();

    let event = next_event(&mut b, |e| matches!(e, MeshEvent::DeviceAvailable(_))).await;
    let MeshEvent::DeviceAvailable(info) = event else {
        unreachable!()
    };
    assert_eq!(info.owner.as_ref(), Some(&a.id));
    wait_for_device(&b, "light:kitchen", 1).await;
    wait_for_device(&b, "light:hall", 1).await;
    assert_eq!(b.handle.get(&["type:light"]).len().await, 2);
}

#[tokio::test]
async fn joiner_behind_a_relay_receives_device_list() {
    init_tracing();
    let a = spawn_node("node-a");
    let b = spawn_node("node-b");
    a.handle.register("light:kitchen", Lamp::default()).await.unwrap();
    a.transport.connect(&b.transport).await.unwrap();
    wait_for_device(&b, "light:kitchen", 1).await;

    // C only ever links to B.
    let c = spawn_node("node-c");
    b.transport.connect(&c.transport).await.unwrap();
    wait_for_route(&c, &a.id, &[&b.id]).await;
    wait_for_device(&c, "light:kitchen", 1).await;
}

#[tokio::test]
async fn stored_tags_come_back_on_registration() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    store
        .put("internal.device.light:kitchen.tags", json!(["downstairs"]))
        .unwrap();
    store
        .put("internal.device.light:kitchen.name", json!("Kitchen"))
        .unwrap();

    let id: NodeId = "node-a".parse().unwrap();
    let (_transport, peer_events) = MemoryTransport::new(id.clone(), LinkConfig::new());
    let RuntimeChannels { handle, .. } = MeshRuntime::new(id).store(store.clone()).spawn(peer_events);

    handle.register("light:kitchen", Lamp::default()).await.unwrap();
    let info = handle.device_info("light:kitchen").await.unwrap();
    assert_eq!(info.tags, vec!["downstairs"]);
    assert_eq!(info.name.as_deref(), Some("Kitchen"));

    handle.device("light:kitchen").add_tags(&["warm"]).await.unwrap();
    assert_eq!(
        store.get("internal.device.light:kitchen.tags").unwrap(),
        Some(json!(["downstairs", "warm"]))
    );
}
