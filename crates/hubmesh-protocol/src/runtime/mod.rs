/// Mesh runtime: integrates router, registry and correlator into a live
/// event loop.
///
/// The runtime owns all protocol state inside one task. It consumes the
/// transport's `PeerEvent`s and exposes a channel-based API so application
/// code never touches frames or routing internals.
mod effect;
mod executor;
mod r#loop;
mod state;
mod transport;

pub use transport::{PeerTable, Transport};

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};

use hubmesh_transport::PeerEvent;

use crate::catalog::Catalog;
use crate::collection::{Collection, Filter};
use crate::device::Device;
use crate::error::{CallError, MeshError};
use crate::extension::Extension;
use crate::facade::{CallOptions, DeviceHandle, DeviceProxy};
use crate::registry::{DeviceInfo, RegistryEvent};
use crate::router::NodeSnapshot;
use crate::rpc::{CallHandle, CallReply};
use crate::store::{MemoryStore, MetadataStore};
use crate::types::NodeId;

use effect::RemoteInvocation;
use executor::Executor;
use state::RuntimeState;

// ── Configuration ─────────────────────────────────────────────────────

/// Configuration for the mesh runtime.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Delay coalescing routing changes into one advertisement. Also the
    /// bound on how long a derived multi-hop record may stay stale.
    pub gossip_debounce: Duration,
    /// Interval for re-announcing every local device. Raised to
    /// [`MIN_INTERVAL`](Self::MIN_INTERVAL) when shorter.
    pub rebroadcast_interval: Duration,
    /// Granularity of call timeout checks. Raised to
    /// [`MIN_INTERVAL`](Self::MIN_INTERVAL) when shorter.
    pub call_sweep_interval: Duration,
    /// Timeout for calls that do not set one. `None` waits indefinitely.
    pub default_call_timeout: Option<Duration>,
    /// Capacity of the application event channel.
    pub event_buffer: usize,
    /// Capacity of the command channel.
    pub command_buffer: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            gossip_debounce: Duration::from_millis(500),
            rebroadcast_interval: Duration::from_secs(300),
            call_sweep_interval: Duration::from_millis(100),
            default_call_timeout: None,
            event_buffer: 256,
            command_buffer: 64,
        }
    }
}

impl RuntimeConfig {
    /// Shortest period the loop's timers run at.
    pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

    /// Defaults, overridden by `HUBMESH_GOSSIP_DEBOUNCE_MS`,
    /// `HUBMESH_REBROADCAST_SECS` and `HUBMESH_CALL_TIMEOUT_MS` when set.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str| {
            let raw = lookup(name)?;
            match raw.trim().parse::<u64>() {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!(setting = name, value = %raw, "ignoring unparsable setting");
                    None
                }
            }
        };
        let mut config = Self::default();
        if let Some(ms) = var("HUBMESH_GOSSIP_DEBOUNCE_MS") {
            config.gossip_debounce = Duration::from_millis(ms);
        }
        if let Some(secs) = var("HUBMESH_REBROADCAST_SECS") {
            config.rebroadcast_interval = Duration::from_secs(secs).max(Self::MIN_INTERVAL);
        }
        if let Some(ms) = var("HUBMESH_CALL_TIMEOUT_MS") {
            config.default_call_timeout = Some(Duration::from_millis(ms));
        }
        config
    }
}

// ── Commands (app → runtime) ──────────────────────────────────────────

/// Commands processed by the runtime event loop.
pub(crate) enum RuntimeCommand {
    /// Register a local device under `id`; replies with its instance id.
    Register {
        id: String,
        device: Arc<dyn Device>,
        reply: oneshot::Sender<Result<String, MeshError>>,
    },
    /// Remove one local registration.
    Unregister { id: String, instance: String },
    /// Publish an event from a local registration.
    EmitEvent {
        id: String,
        instance: String,
        event: String,
        payload: Value,
    },
    /// Invoke an action on a device, wherever it lives.
    Call {
        device_id: String,
        action: String,
        arguments: Vec<Value>,
        timeout: Option<Duration>,
        reply: CallReply,
        progress: mpsc::UnboundedSender<Value>,
    },
    /// Query: every device, unless `since` is the current registry version.
    Devices {
        since: Option<u64>,
        reply: oneshot::Sender<Option<(u64, Vec<DeviceInfo>)>>,
    },
    /// Query: one device.
    Device {
        id: String,
        reply: oneshot::Sender<Option<DeviceInfo>>,
    },
    /// Query: the node graph.
    Nodes {
        reply: oneshot::Sender<Vec<NodeSnapshot>>,
    },
    /// A local action serving a remote caller reported progress.
    InvocationProgress { origin: RemoteInvocation, data: Value },
    /// A local action serving a remote caller finished.
    InvocationFinished {
        origin: RemoteInvocation,
        outcome: Result<Value, CallError>,
    },
    /// Graceful shutdown.
    Shutdown,
}

// ── Events (runtime → app) ───────────────────────────────────────────

/// What the application can observe about the mesh.
#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    /// A node became reachable.
    NodeConnected(NodeId),
    /// A node is no longer reachable.
    NodeDisconnected(NodeId),
    /// A device id got its first registration.
    DeviceAvailable(DeviceInfo),
    /// A device's registrations or metadata changed.
    DeviceUpdated(DeviceInfo),
    /// The last registration of a device went away.
    DeviceUnavailable(String),
    /// A device emitted an event.
    DeviceEvent {
        id: String,
        event: String,
        payload: Value,
    },
}

impl From<RegistryEvent> for MeshEvent {
    fn from(event: RegistryEvent) -> Self {
        match event {
            RegistryEvent::Available(info) => MeshEvent::DeviceAvailable(info),
            RegistryEvent::Updated(info) => MeshEvent::DeviceUpdated(info),
            RegistryEvent::Unavailable { id } => MeshEvent::DeviceUnavailable(id),
        }
    }
}

// ── RuntimeHandle (app-facing API) ───────────────────────────────────

/// Handle to communicate with a running mesh runtime.
///
/// Cheap to clone. Every method is a channel round trip to the loop.
#[derive(Clone)]
pub struct RuntimeHandle {
    cmd_tx: mpsc::Sender<RuntimeCommand>,
    events_tx: broadcast::Sender<MeshEvent>,
    local_id: NodeId,
}

impl RuntimeHandle {
    /// This node's identity.
    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    /// Register a device implemented in this process.
    ///
    /// Fails if `id` has no namespace or the device misses an action one
    /// of its types or capabilities requires.
    pub async fn register(&self, id: impl Into<String>, device: impl Device) -> Result<DeviceHandle, MeshError> {
        self.register_shared(id, Arc::new(device)).await
    }

    /// Like [`register`](Self::register) for an already shared device.
    pub async fn register_shared(
        &self,
        id: impl Into<String>,
        device: Arc<dyn Device>,
    ) -> Result<DeviceHandle, MeshError> {
        let id = id.into();
        let (tx, rx) = oneshot::channel();
        self.command(RuntimeCommand::Register {
            id: id.clone(),
            device,
            reply: tx,
        })
        .await?;
        let instance = rx.await.map_err(|_| MeshError::Shutdown)??;
        Ok(DeviceHandle::new(self.clone(), id, instance))
    }

    /// Proxy for the device `id`. The device does not need to exist yet.
    pub fn device(&self, id: impl Into<String>) -> DeviceProxy {
        DeviceProxy::new(self.clone(), id.into())
    }

    /// Live view of the devices carrying every tag in `tags`.
    pub fn get(&self, tags: &[&str]) -> Collection {
        let tags = tags.iter().map(|t| t.to_string()).collect();
        Collection::new(self.clone(), Filter::Tags(tags))
    }

    /// Live view of every device.
    pub fn all(&self) -> Collection {
        Collection::new(self.clone(), Filter::All)
    }

    /// Enhance every device carrying all of `tags`, now and as devices
    /// appear. `enhance` sees each matching id once; a device it returns is
    /// registered here under that id and merges with the original.
    pub async fn extend<F>(&self, tags: &[&str], enhance: F) -> Extension
    where
        F: Fn(&DeviceInfo) -> Option<Arc<dyn Device>> + Send + Sync + 'static,
    {
        let tags = tags.iter().map(|t| t.to_string()).collect();
        Extension::start(self.clone(), Filter::Tags(tags), Arc::new(enhance)).await
    }

    /// Invoke `action` on `device_id` and wait for the result.
    pub async fn call(&self, device_id: &str, action: &str, arguments: Vec<Value>) -> Result<Value, CallError> {
        self.start_call(device_id, action, arguments, CallOptions::default())
            .await
            .await
    }

    /// Invoke `action` on `device_id`, returning a handle that streams
    /// progress before resolving.
    pub async fn start_call(
        &self,
        device_id: &str,
        action: &str,
        arguments: Vec<Value>,
        options: CallOptions,
    ) -> CallHandle {
        let (handle, reply, progress) = CallHandle::channel();
        let sent = self
            .command(RuntimeCommand::Call {
                device_id: device_id.to_string(),
                action: action.to_string(),
                arguments,
                timeout: options.timeout,
                reply,
                progress,
            })
            .await;
        match sent {
            Ok(()) => handle,
            Err(_) => CallHandle::failed(CallError::Shutdown),
        }
    }

    /// Subscribe to mesh events.
    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.events_tx.subscribe()
    }

    /// Snapshot of every known node.
    pub async fn nodes(&self) -> Vec<NodeSnapshot> {
        let (tx, rx) = oneshot::channel();
        if self.command(RuntimeCommand::Nodes { reply: tx }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Current metadata of `id`, if any registration backs it.
    pub async fn device_info(&self, id: &str) -> Option<DeviceInfo> {
        let (tx, rx) = oneshot::channel();
        self.command(RuntimeCommand::Device {
            id: id.to_string(),
            reply: tx,
        })
        .await
        .ok()?;
        rx.await.ok().flatten()
    }

    /// Whether any registration backs `id`.
    pub async fn is_available(&self, id: &str) -> bool {
        self.device_info(id).await.is_some()
    }

    /// Graceful shutdown. Pending calls fail with `CallError::Shutdown`.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(RuntimeCommand::Shutdown).await;
    }

    pub(crate) async fn devices_since(&self, since: Option<u64>) -> Result<Option<(u64, Vec<DeviceInfo>)>, MeshError> {
        let (tx, rx) = oneshot::channel();
        self.command(RuntimeCommand::Devices { since, reply: tx }).await?;
        rx.await.map_err(|_| MeshError::Shutdown)
    }

    pub(crate) async fn unregister(&self, id: String, instance: String) {
        let _ = self.command(RuntimeCommand::Unregister { id, instance }).await;
    }

    pub(crate) async fn emit_event(&self, id: String, instance: String, event: String, payload: Value) {
        let _ = self
            .command(RuntimeCommand::EmitEvent {
                id,
                instance,
                event,
                payload,
            })
            .await;
    }

    async fn command(&self, cmd: RuntimeCommand) -> Result<(), MeshError> {
        self.cmd_tx.send(cmd).await.map_err(|_| MeshError::Shutdown)
    }
}

// ── RuntimeChannels ──────────────────────────────────────────────────

/// Channels returned to the application when the runtime starts.
pub struct RuntimeChannels {
    /// Handle to send commands to the runtime.
    pub handle: RuntimeHandle,
    /// Mesh events, subscribed before the loop started so none are missed.
    pub events: broadcast::Receiver<MeshEvent>,
}

// ── MeshRuntime ──────────────────────────────────────────────────────

/// The mesh runtime: configure it, spawn it, talk to it via channels.
pub struct MeshRuntime {
    local_id: NodeId,
    config: RuntimeConfig,
    catalog: Catalog,
    store: Arc<dyn MetadataStore>,
}

impl MeshRuntime {
    /// Runtime for `local_id` with default config, the built-in catalog
    /// and an in-memory metadata store.
    pub fn new(local_id: NodeId) -> Self {
        Self {
            local_id,
            config: RuntimeConfig::default(),
            catalog: Catalog::with_builtins(),
            store: Arc::new(MemoryStore::new()),
        }
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn catalog(mut self, catalog: Catalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn store(mut self, store: Arc<dyn MetadataStore>) -> Self {
        self.store = store;
        self
    }

    /// Start the event loop on the current tokio runtime.
    ///
    /// `peer_events` is the transport's event stream; the loop ends when it
    /// closes or on [`RuntimeHandle::shutdown`].
    pub fn spawn(self, peer_events: mpsc::Receiver<PeerEvent>) -> RuntimeChannels {
        let (cmd_tx, cmd_rx) = mpsc::channel::<RuntimeCommand>(self.config.command_buffer.max(1));
        let (events_tx, events_rx) = broadcast::channel::<MeshEvent>(self.config.event_buffer.max(1));

        let executor = Executor::new(PeerTable::new(), events_tx.clone(), cmd_tx.downgrade());
        let state = RuntimeState::new(self.local_id.clone(), self.config, self.catalog, self.store);

        tokio::spawn(r#loop::runtime_loop(state, executor, peer_events, cmd_rx));

        RuntimeChannels {
            handle: RuntimeHandle {
                cmd_tx,
                events_tx,
                local_id: self.local_id,
            },
            events: events_rx,
        }
    }
}
