//! Shared fixtures: in-process nodes and a test lamp.
#![allow(dead_code)]

use std::time::Duration;

use hubmesh_protocol::{
    CallError, Device, DeviceDefinition, MeshEvent, MeshRuntime, NodeId, Progress, RuntimeChannels,
    RuntimeConfig, RuntimeHandle,
};
use hubmesh_transport::{LinkConfig, MemoryTransport};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::time::Instant;

const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .with_test_writer()
        .try_init();
}

/// One mesh participant wired to an in-process transport.
pub struct TestNode {
    pub id: NodeId,
    pub transport: MemoryTransport,
    pub handle: RuntimeHandle,
    pub events: broadcast::Receiver<MeshEvent>,
}

pub fn spawn_node(name: &str) -> TestNode {
    let id: NodeId = name.parse().unwrap();
    let (transport, peer_events) = MemoryTransport::new(id.clone(), LinkConfig::new());
    let config = RuntimeConfig {
        gossip_debounce: Duration::from_millis(20),
        call_sweep_interval: Duration::from_millis(10),
        ..RuntimeConfig::default()
    };
    let RuntimeChannels { handle, events } = MeshRuntime::new(id.clone()).config(config).spawn(peer_events);
    TestNode {
        id,
        transport,
        handle,
        events,
    }
}

/// Wait until `node` has an active route to `target` over `path`.
pub async fn wait_for_route(node: &TestNode, target: &NodeId, path: &[&NodeId]) {
    let deadline = Instant::now() + WAIT;
    loop {
        let nodes = node.handle.nodes().await;
        let found = nodes
            .iter()
            .find(|n| &n.id == target)
            .is_some_and(|n| n.path.iter().eq(path.iter().copied()));
        if found {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "{} never routed to {target} via {path:?}; graph: {nodes:?}",
            node.id
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until `node` no longer knows `target`.
pub async fn wait_for_no_route(node: &TestNode, target: &NodeId) {
    let deadline = Instant::now() + WAIT;
    while node.handle.nodes().await.iter().any(|n| &n.id == target) {
        assert!(Instant::now() < deadline, "{} still routes to {target}", node.id);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until `node` sees `device` with `registrations` backing it
/// (0 meaning gone).
pub async fn wait_for_device(node: &TestNode, device: &str, registrations: usize) {
    let deadline = Instant::now() + WAIT;
    loop {
        let seen = node
            .handle
            .device_info(device)
            .await
            .map_or(0, |info| info.registrations);
        if seen == registrations {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "{} sees {seen} registrations of {device}, expected {registrations}",
            node.id
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Next event matching `pred`, skipping the rest.
pub async fn next_event(node: &mut TestNode, pred: impl Fn(&MeshEvent) -> bool) -> MeshEvent {
    let deadline = Instant::now() + WAIT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, node.events.recv()).await {
            Ok(Ok(event)) if pred(&event) => return event,
            Ok(Ok(_)) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(broadcast::error::RecvError::Closed)) => panic!("{} event stream closed", node.id),
            Err(_) => panic!("{} timed out waiting for an event", node.id),
        }
    }
}

/// A light whose `turnOn` reports progress and whose `flash` never ends.
#[derive(Default)]
pub struct Lamp {
    pub broken: bool,
}

#[async_trait::async_trait]
impl Device for Lamp {
    fn definition(&self) -> DeviceDefinition {
        DeviceDefinition::new()
            .named("Lamp")
            .with_type("light")
            .with_capability("nameable")
    }

    fn actions(&self) -> Vec<String> {
        ["state", "power", "setPower", "turnOn", "turnOff", "flash"]
            .into_iter()
            .map(String::from)
            .collect()
    }

    async fn call(&self, action: &str, args: Vec<Value>, progress: Progress) -> Result<Value, CallError> {
        match action {
            "state" => Ok(json!({ "power": false })),
            "power" => Ok(json!(false)),
            "setPower" => Ok(args.first().cloned().unwrap_or(Value::Bool(false))),
            "turnOn" => {
                progress.notify("warming");
                progress.notify(50);
                Ok(json!(true))
            }
            "turnOff" if self.broken => Err(CallError::failed("bulb broken")),
            "turnOff" => Ok(json!(false)),
            "flash" => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Value::Null)
            }
            other => Err(CallError::NoSuchAction(other.to_string())),
        }
    }
}
