use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::catalog::{Catalog, Conversion};
use crate::device::{ActionSpec, Device, DeviceDescriptor};
use crate::envelope::{
    DeviceEventPayload, DeviceRef, Frame, InvokeProgress, InvokeRequest, InvokeResult, Message,
};
use crate::error::{CallError, MeshError};
use crate::registry::{Registration, Registry};
use crate::router::{Router, RoutingAction};
use crate::rpc::{CallCorrelator, CallHandle, CallReply, OutboundCall};
use crate::store::{device_key, MetadataStore};
use crate::types::{is_valid_device_id, NodeId, PeerId, METADATA_ACTION_PREFIX};

use super::effect::{InvocationOrigin, LocalInvocation, RemoteInvocation, RuntimeEffect};
use super::{MeshEvent, RuntimeCommand, RuntimeConfig};

const NAMEABLE: &str = "nameable";

/// Where a call on a merged device goes.
enum CallTarget {
    Local {
        device: Arc<dyn Device>,
        spec: ActionSpec,
    },
    Remote {
        node: NodeId,
        spec: ActionSpec,
    },
}

/// One registration addressed by a metadata fan-out.
enum MetadataTarget {
    Local(String),
    Remote(NodeId),
}

/// Complete mesh state: pure logic, no async, no I/O.
///
/// Every `handle_*` / `tick_*` method returns `Vec<RuntimeEffect>`. The
/// only side effects performed here are replies on oneshot channels owned
/// by callers and writes to the metadata store.
pub struct RuntimeState {
    pub(crate) local_id: NodeId,
    pub(crate) config: RuntimeConfig,

    pub(crate) router: Router,
    pub(crate) registry: Registry,
    pub(crate) calls: CallCorrelator,

    catalog: Catalog,
    store: Arc<dyn MetadataStore>,
}

impl RuntimeState {
    pub fn new(local_id: NodeId, config: RuntimeConfig, catalog: Catalog, store: Arc<dyn MetadataStore>) -> Self {
        Self {
            router: Router::new(local_id.clone()),
            registry: Registry::new(local_id.clone()),
            calls: CallCorrelator::new(),
            local_id,
            config,
            catalog,
            store,
        }
    }

    // ── Transport events ─────────────────────────────────────────────────

    pub fn handle_peer_connected(&mut self, peer: PeerId, node_id: NodeId) -> Vec<RuntimeEffect> {
        let actions = self.router.peer_connected(peer, node_id);
        self.apply_routing(actions)
    }

    pub fn handle_peer_disconnected(&mut self, peer: PeerId) -> Vec<RuntimeEffect> {
        let actions = self.router.peer_disconnected(peer);
        self.apply_routing(actions)
    }

    /// Decode and route one inbound frame. Garbage is dropped.
    pub fn handle_frame(&mut self, peer: PeerId, data: &[u8]) -> Vec<RuntimeEffect> {
        let frame = match Frame::from_bytes(data) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(%peer, "undecodable frame dropped: {e}");
                return Vec::new();
            }
        };
        let actions = self.router.handle_frame(peer, frame);
        self.apply_routing(actions)
    }

    // ── Ticks ────────────────────────────────────────────────────────────

    /// Advertise everything we can reach to direct neighbours.
    pub fn tick_gossip(&mut self) -> Vec<RuntimeEffect> {
        let actions = self.router.gossip();
        self.apply_routing(actions)
    }

    /// Re-announce every local device to every node.
    pub fn tick_rebroadcast(&mut self) -> Vec<RuntimeEffect> {
        let descriptors = self.registry.local_descriptors();
        if !descriptors.is_empty() {
            tracing::debug!(count = descriptors.len(), "re-announcing local devices");
        }
        descriptors
            .into_iter()
            .flat_map(|d| self.broadcast(Message::DeviceAvailable(d)))
            .collect()
    }

    /// Fail calls whose deadline has passed.
    pub fn tick_call_timeouts(&mut self, now: Instant) -> Vec<RuntimeEffect> {
        let expired = self.calls.expire(now);
        if expired > 0 {
            tracing::debug!(expired, "calls timed out");
        }
        Vec::new()
    }

    /// Fail everything still pending.
    pub fn shutdown(&mut self) {
        let rejected = self.calls.reject_all(CallError::Shutdown);
        tracing::info!(node = %self.local_id, rejected, "runtime shutting down");
    }

    // ── Commands ─────────────────────────────────────────────────────────

    pub(crate) fn handle_command(&mut self, cmd: RuntimeCommand, now: Instant) -> Vec<RuntimeEffect> {
        match cmd {
            RuntimeCommand::Register { id, device, reply } => match self.handle_register(id, device) {
                Ok((instance, effects)) => {
                    let _ = reply.send(Ok(instance));
                    effects
                }
                Err(e) => {
                    tracing::warn!("registration rejected: {e}");
                    let _ = reply.send(Err(e));
                    Vec::new()
                }
            },

            RuntimeCommand::Unregister { id, instance } => self.handle_unregister(id, instance),

            RuntimeCommand::EmitEvent {
                id,
                instance,
                event,
                payload,
            } => self.handle_emit_event(id, instance, event, payload),

            RuntimeCommand::Call {
                device_id,
                action,
                arguments,
                timeout,
                reply,
                progress,
            } => self.handle_call(device_id, action, arguments, timeout, reply, progress, now),

            RuntimeCommand::Devices { since, reply } => {
                let _ = reply.send(self.registry.snapshot_since(since));
                Vec::new()
            }

            RuntimeCommand::Device { id, reply } => {
                let _ = reply.send(self.registry.get(&id).map(|m| m.info()));
                Vec::new()
            }

            RuntimeCommand::Nodes { reply } => {
                let _ = reply.send(self.router.nodes());
                Vec::new()
            }

            RuntimeCommand::InvocationProgress { origin, data } => self.send(
                &origin.node,
                Message::InvokeProgress(InvokeProgress {
                    id: origin.id,
                    seq: origin.seq,
                    data,
                }),
            ),

            RuntimeCommand::InvocationFinished { origin, outcome } => {
                let result = match outcome {
                    Ok(value) => InvokeResult::ok(origin.id, origin.seq, value),
                    Err(e) => InvokeResult::err(origin.id, origin.seq, e.to_string()),
                };
                self.send(&origin.node, Message::InvokeResult(result))
            }

            RuntimeCommand::Shutdown => {
                self.shutdown();
                Vec::new()
            }
        }
    }

    // ── Local registrations ──────────────────────────────────────────────

    fn handle_register(
        &mut self,
        id: String,
        device: Arc<dyn Device>,
    ) -> Result<(String, Vec<RuntimeEffect>), MeshError> {
        if !is_valid_device_id(&id) {
            return Err(MeshError::InvalidDeviceId { id });
        }
        let description = self
            .catalog
            .describe_device(&id, &device.definition(), &device.actions())?;

        let nameable = description.capabilities.iter().any(|c| c == NAMEABLE);
        let instance = uuid::Uuid::new_v4().simple().to_string();
        let tags = self.stored_tags(&id);
        let mut descriptor = description.into_descriptor(&self.local_id, instance.clone(), tags);
        if nameable {
            if let Some(name) = self.stored_name(&id) {
                descriptor.name = Some(name);
            }
        }

        let event = self.registry.register_local(descriptor.clone(), device);
        let mut effects = vec![RuntimeEffect::Emit(event.into())];
        effects.extend(self.broadcast(Message::DeviceAvailable(descriptor)));
        Ok((instance, effects))
    }

    fn handle_unregister(&mut self, id: String, instance: String) -> Vec<RuntimeEffect> {
        let mut effects = Vec::new();
        if let Some(event) = self.registry.remove_local(&id, &instance) {
            effects.push(RuntimeEffect::Emit(event.into()));
        }
        effects.extend(self.broadcast(Message::DeviceUnavailable(DeviceRef { id, instance })));
        effects
    }

    fn handle_emit_event(&mut self, id: String, instance: String, event: String, payload: Value) -> Vec<RuntimeEffect> {
        let is_local = self
            .registry
            .get(&id)
            .and_then(|m| m.get(&instance))
            .is_some_and(Registration::is_local);
        if !is_local {
            tracing::debug!(%id, %event, "event from removed registration ignored");
            return Vec::new();
        }

        let mut effects = vec![RuntimeEffect::Emit(MeshEvent::DeviceEvent {
            id: id.clone(),
            event: event.clone(),
            payload: payload.clone(),
        })];
        effects.extend(self.broadcast(Message::DeviceEvent(DeviceEventPayload {
            id,
            instance,
            event,
            payload,
        })));
        effects
    }

    fn stored_tags(&self, id: &str) -> Vec<String> {
        match self.store.get(&device_key(id, "tags")) {
            Ok(Some(Value::Array(items))) => items
                .into_iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect(),
            Ok(_) => Vec::new(),
            Err(e) => {
                tracing::warn!(%id, "could not load stored tags: {e}");
                Vec::new()
            }
        }
    }

    fn stored_name(&self, id: &str) -> Option<String> {
        match self.store.get(&device_key(id, "name")) {
            Ok(value) => value.and_then(|v| v.as_str().map(String::from)),
            Err(e) => {
                tracing::warn!(%id, "could not load stored name: {e}");
                None
            }
        }
    }

    // ── Calls ────────────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    fn handle_call(
        &mut self,
        device_id: String,
        action: String,
        arguments: Vec<Value>,
        timeout: Option<Duration>,
        reply: CallReply,
        progress: mpsc::UnboundedSender<Value>,
        now: Instant,
    ) -> Vec<RuntimeEffect> {
        let Some(merged) = self.registry.get(&device_id) else {
            let _ = reply.send(Err(CallError::UnknownDevice));
            return Vec::new();
        };

        if action.starts_with(METADATA_ACTION_PREFIX) {
            let targets = merged
                .registrations()
                .iter()
                .map(|r| match r {
                    Registration::Local { descriptor, .. } => MetadataTarget::Local(descriptor.instance.clone()),
                    Registration::Remote { descriptor, .. } => MetadataTarget::Remote(descriptor.peer.clone()),
                })
                .collect();
            return self.fan_out_metadata(device_id, action, arguments, targets, timeout, reply, now);
        }

        let target = merged.first_capable(&action).map(|registration| {
            let spec = registration
                .descriptor()
                .actions
                .get(&action)
                .cloned()
                .unwrap_or_else(ActionSpec::unknown);
            match registration {
                Registration::Local { device, .. } => CallTarget::Local {
                    device: device.clone(),
                    spec,
                },
                Registration::Remote { descriptor, .. } => CallTarget::Remote {
                    node: descriptor.peer.clone(),
                    spec,
                },
            }
        });

        match target {
            None => {
                let _ = reply.send(Err(CallError::NoSuchAction(action)));
                Vec::new()
            }
            Some(CallTarget::Local { device, spec }) => {
                vec![RuntimeEffect::InvokeLocal(LocalInvocation {
                    device,
                    arguments: self.catalog.convert_arguments(&spec, arguments),
                    action,
                    origin: InvocationOrigin::Local { reply, progress },
                    result_to_wire: Conversion::identity(),
                })]
            }
            Some(CallTarget::Remote { node, spec }) => {
                let call = OutboundCall {
                    target: node,
                    device_id,
                    arguments: self.catalog.arguments_to_wire(&spec, arguments),
                    action,
                    timeout: timeout.or(self.config.default_call_timeout),
                    conversion: self.catalog.create_conversion(&spec.return_type),
                    reply,
                    progress: Some(progress),
                };
                self.start_remote_call(call, now)
            }
        }
    }

    /// Metadata calls from this process reach every registration. The
    /// caller gets one entry per registration, `null` where it failed.
    #[allow(clippy::too_many_arguments)]
    fn fan_out_metadata(
        &mut self,
        device_id: String,
        action: String,
        arguments: Vec<Value>,
        targets: Vec<MetadataTarget>,
        timeout: Option<Duration>,
        reply: CallReply,
        now: Instant,
    ) -> Vec<RuntimeEffect> {
        let mut effects = Vec::new();
        let mut calls = Vec::with_capacity(targets.len());
        for target in targets {
            match target {
                MetadataTarget::Local(instance) => {
                    let (outcome, applied) = self.apply_metadata(&device_id, &instance, &action, &arguments);
                    effects.extend(applied);
                    calls.push(match outcome {
                        Ok(value) => CallHandle::resolved(value),
                        Err(e) => CallHandle::failed(e),
                    });
                }
                MetadataTarget::Remote(node) => {
                    let (handle, call_reply, _) = CallHandle::channel();
                    let call = OutboundCall {
                        target: node,
                        device_id: device_id.clone(),
                        action: action.clone(),
                        arguments: arguments.clone(),
                        timeout: timeout.or(self.config.default_call_timeout),
                        conversion: Conversion::identity(),
                        reply: call_reply,
                        progress: None,
                    };
                    effects.extend(self.start_remote_call(call, now));
                    calls.push(handle);
                }
            }
        }
        effects.push(RuntimeEffect::Collect { calls, reply });
        effects
    }

    fn start_remote_call(&mut self, call: OutboundCall, now: Instant) -> Vec<RuntimeEffect> {
        let (target, message) = self.calls.start(call, now);
        // No route: the call stays pending until its timeout or node loss.
        self.send(&target, message)
    }

    /// Apply a `metadata:*` action to one local registration, persist the
    /// change and announce the updated descriptor.
    fn apply_metadata(
        &mut self,
        id: &str,
        instance: &str,
        action: &str,
        arguments: &[Value],
    ) -> (Result<Value, CallError>, Vec<RuntimeEffect>) {
        let op = &action[METADATA_ACTION_PREFIX.len()..];
        let first = arguments.first();
        let updated = match op {
            "name" | "setName" => {
                let name = first.and_then(Value::as_str).map(String::from);
                self.registry.update_local(id, instance, |d| d.name = name)
            }
            "addTags" => {
                let tags = tag_list(first);
                self.registry.update_local(id, instance, |d| {
                    for tag in tags {
                        if !d.tags.contains(&tag) {
                            d.tags.push(tag);
                        }
                    }
                })
            }
            "removeTags" => {
                let tags = tag_list(first);
                self.registry
                    .update_local(id, instance, |d| d.tags.retain(|t| !tags.contains(t)))
            }
            _ => return (Err(CallError::failed("Unknown metadata function")), Vec::new()),
        };
        let Some((descriptor, event)) = updated else {
            return (Err(CallError::UnknownDevice), Vec::new());
        };

        self.persist_metadata(op, &descriptor);
        tracing::debug!(%id, %instance, op, "metadata updated");

        let mut effects = vec![RuntimeEffect::Emit(event.into())];
        effects.extend(self.broadcast(Message::DeviceAvailable(descriptor)));
        (Ok(Value::Null), effects)
    }

    fn persist_metadata(&self, op: &str, descriptor: &DeviceDescriptor) {
        let write = match op {
            "addTags" | "removeTags" => Some(("tags", json!(descriptor.tags))),
            _ if descriptor.capabilities.iter().any(|c| c == NAMEABLE) => Some(("name", json!(descriptor.name))),
            _ => None,
        };
        if let Some((field, value)) = write {
            if let Err(e) = self.store.put(&device_key(&descriptor.id, field), value) {
                tracing::warn!(id = %descriptor.id, field, "could not persist metadata: {e}");
            }
        }
    }

    // ── Routing glue ─────────────────────────────────────────────────────

    fn send(&mut self, target: &NodeId, message: Message) -> Vec<RuntimeEffect> {
        match self.router.send(target, message) {
            Some(action) => self.apply_routing(vec![action]),
            None => Vec::new(),
        }
    }

    fn broadcast(&mut self, message: Message) -> Vec<RuntimeEffect> {
        let actions = self.router.broadcast(&message);
        self.apply_routing(actions)
    }

    /// Turn router decisions into effects, dispatching delivered messages.
    fn apply_routing(&mut self, actions: Vec<RoutingAction>) -> Vec<RuntimeEffect> {
        let mut effects = Vec::new();
        for action in actions {
            match action {
                RoutingAction::Transmit { peer, frame } => effects.push(RuntimeEffect::SendFrame { peer, frame }),
                RoutingAction::Deliver { source, message } => effects.extend(self.dispatch(source, message)),
                RoutingAction::NodeConnected(node) => {
                    effects.push(RuntimeEffect::Emit(MeshEvent::NodeConnected(node.clone())));
                    effects.extend(self.send_device_list(&node));
                }
                RoutingAction::NodeDisconnected(node) => {
                    let rejected = self.calls.reject_node(&node);
                    let events = self.registry.remove_for_node(&node);
                    tracing::debug!(%node, rejected, devices = events.len(), "cleaned up after node loss");
                    effects.extend(events.into_iter().map(|e| RuntimeEffect::Emit(e.into())));
                    effects.push(RuntimeEffect::Emit(MeshEvent::NodeDisconnected(node)));
                }
                RoutingAction::ScheduleGossip => effects.push(RuntimeEffect::ScheduleGossip),
            }
        }
        effects
    }

    /// Tell a node that just became reachable about our devices.
    fn send_device_list(&mut self, node: &NodeId) -> Vec<RuntimeEffect> {
        let descriptors: Vec<DeviceDescriptor> = self.registry.local_descriptors();
        debug_assert!(descriptors.iter().all(|d| d.owner == self.local_id));
        if !descriptors.is_empty() {
            tracing::debug!(%node, count = descriptors.len(), "sending device list");
        }
        descriptors
            .into_iter()
            .flat_map(|d| self.send(node, Message::DeviceAvailable(d)))
            .collect()
    }

    // ── Inbound messages ─────────────────────────────────────────────────

    fn dispatch(&mut self, source: NodeId, message: Message) -> Vec<RuntimeEffect> {
        match message {
            Message::Routing(_) => Vec::new(),

            Message::DeviceAvailable(descriptor) => {
                let distance = self.router.distance(&descriptor.peer).unwrap_or(usize::MAX);
                self.registry
                    .add_remote(descriptor, distance)
                    .map(|event| RuntimeEffect::Emit(event.into()))
                    .into_iter()
                    .collect()
            }

            Message::DeviceUnavailable(device) => {
                let peer = self
                    .registry
                    .get(&device.id)
                    .and_then(|m| m.get(&device.instance))
                    .map(|r| r.descriptor().peer.clone());
                if let Some(peer) = peer {
                    self.calls.reject_device(&peer, &device.id);
                }
                self.registry
                    .remove_remote(&device.id, &device.instance)
                    .map(|event| RuntimeEffect::Emit(event.into()))
                    .into_iter()
                    .collect()
            }

            Message::DeviceEvent(event) => {
                if !self.registry.contains(&event.id) {
                    return Vec::new();
                }
                vec![RuntimeEffect::Emit(MeshEvent::DeviceEvent {
                    id: event.id,
                    event: event.event,
                    payload: event.payload,
                })]
            }

            Message::Invoke(request) => self.handle_remote_invoke(source, request),

            Message::InvokeProgress(progress) => {
                self.calls.handle_progress(&source, progress);
                Vec::new()
            }

            Message::InvokeResult(result) => {
                self.calls.handle_result(&source, result);
                Vec::new()
            }
        }
    }

    /// Serve a `device:invoke` from `source` with a local registration.
    fn handle_remote_invoke(&mut self, source: NodeId, request: InvokeRequest) -> Vec<RuntimeEffect> {
        let InvokeRequest {
            id,
            seq,
            action,
            arguments,
        } = request;

        let Some(merged) = self.registry.get(&id) else {
            return self.send(
                &source,
                Message::InvokeResult(InvokeResult::err(id, seq, CallError::UnknownDevice.to_string())),
            );
        };

        if action.starts_with(METADATA_ACTION_PREFIX) {
            let instance = merged
                .registrations()
                .iter()
                .find(|r| r.is_local())
                .map(|r| r.instance().to_string());
            let (outcome, mut effects) = match instance {
                Some(instance) => self.apply_metadata(&id, &instance, &action, &arguments),
                None => (Err(CallError::NoSuchAction(action)), Vec::new()),
            };
            let result = match outcome {
                Ok(value) => InvokeResult::ok(id, seq, value),
                Err(e) => InvokeResult::err(id, seq, e.to_string()),
            };
            effects.extend(self.send(&source, Message::InvokeResult(result)));
            return effects;
        }

        let local = match merged.first_local_capable(&action) {
            Some(Registration::Local { descriptor, device }) => Some((
                device.clone(),
                descriptor
                    .actions
                    .get(&action)
                    .cloned()
                    .unwrap_or_else(ActionSpec::unknown),
            )),
            _ => None,
        };

        match local {
            Some((device, spec)) => vec![RuntimeEffect::InvokeLocal(LocalInvocation {
                device,
                arguments: self.catalog.convert_arguments(&spec, arguments),
                action,
                origin: InvocationOrigin::Remote(RemoteInvocation { node: source, id, seq }),
                result_to_wire: self.catalog.create_to_wire(&spec.return_type),
            })],
            None => {
                let error = CallError::NoSuchAction(action).to_string();
                self.send(&source, Message::InvokeResult(InvokeResult::err(id, seq, error)))
            }
        }
    }
}

/// Tags argument of `metadata:addTags` / `removeTags`: a list or one tag.
fn tag_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect(),
        Some(Value::String(tag)) => vec![tag.clone()],
        _ => Vec::new(),
    }
}
