/// Device registry: logical device id → merged device.
///
/// Pure bookkeeping. The runtime feeds it local registrations and
/// `device:*` announcements and turns the returned events into
/// application notifications. A version counter is bumped on every
/// change so collections can tell when their cached view is stale.
mod merged;

use std::collections::BTreeMap;
use std::sync::Arc;

pub use merged::{DeviceInfo, MergedDevice, Registration};

use crate::device::{Device, DeviceDescriptor};
use crate::types::NodeId;

/// Change to the set of visible devices.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    /// A device id got its first registration.
    Available(DeviceInfo),
    /// A device gained, lost or changed a registration but is still there.
    Updated(DeviceInfo),
    /// The last registration of a device went away.
    Unavailable { id: String },
}

pub struct Registry {
    local_id: NodeId,
    devices: BTreeMap<String, MergedDevice>,
    version: u64,
}

impl Registry {
    pub fn new(local_id: NodeId) -> Self {
        Self {
            local_id,
            devices: BTreeMap::new(),
            version: 0,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn get(&self, id: &str) -> Option<&MergedDevice> {
        self.devices.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.devices.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn infos(&self) -> Vec<DeviceInfo> {
        self.devices.values().map(MergedDevice::info).collect()
    }

    /// Current devices, unless `known` already is the current version.
    pub fn snapshot_since(&self, known: Option<u64>) -> Option<(u64, Vec<DeviceInfo>)> {
        if known == Some(self.version) {
            return None;
        }
        Some((self.version, self.infos()))
    }

    /// Descriptors of every registration implemented in this process.
    pub fn local_descriptors(&self) -> Vec<DeviceDescriptor> {
        self.devices
            .values()
            .flat_map(|m| m.registrations())
            .filter(|r| r.is_local())
            .map(|r| r.descriptor().clone())
            .collect()
    }

    // ── Local registrations ───────────────────────────────────────────

    pub fn register_local(&mut self, descriptor: DeviceDescriptor, device: Arc<dyn Device>) -> RegistryEvent {
        tracing::debug!(id = %descriptor.id, instance = %descriptor.instance, "local registration");
        self.insert(Registration::Local { descriptor, device })
    }

    /// Remove a local registration. `None` if no such local registration.
    pub fn remove_local(&mut self, id: &str, instance: &str) -> Option<RegistryEvent> {
        let is_local = self
            .devices
            .get(id)
            .and_then(|m| m.get(instance))
            .is_some_and(Registration::is_local);
        if !is_local {
            return None;
        }
        self.remove(id, instance)
    }

    /// Edit the descriptor of a local registration in place.
    pub fn update_local(
        &mut self,
        id: &str,
        instance: &str,
        edit: impl FnOnce(&mut DeviceDescriptor),
    ) -> Option<(DeviceDescriptor, RegistryEvent)> {
        let merged = self.devices.get_mut(id)?;
        let Some(Registration::Local { descriptor, .. }) = merged.get_mut(instance) else {
            return None;
        };
        edit(descriptor);
        let updated = descriptor.clone();
        self.version += 1;
        Some((updated, RegistryEvent::Updated(merged.info())))
    }

    // ── Remote registrations ──────────────────────────────────────────

    /// Accept a `device:available` announcement reached at `distance` hops.
    ///
    /// Announcements are routed, never flooded, so each one arrives once and
    /// the latest copy of a registration always replaces the previous one.
    pub fn add_remote(&mut self, descriptor: DeviceDescriptor, distance: usize) -> Option<RegistryEvent> {
        if descriptor.owner == self.local_id {
            return None;
        }
        let is_local = self
            .devices
            .get(&descriptor.id)
            .and_then(|m| m.get(&descriptor.instance))
            .is_some_and(Registration::is_local);
        if is_local {
            return None;
        }
        Some(self.insert(Registration::Remote { descriptor, distance }))
    }

    /// Handle `device:unavailable`. Local registrations are never touched.
    pub fn remove_remote(&mut self, id: &str, instance: &str) -> Option<RegistryEvent> {
        let is_remote = self
            .devices
            .get(id)
            .and_then(|m| m.get(instance))
            .is_some_and(|r| !r.is_local());
        if !is_remote {
            return None;
        }
        self.remove(id, instance)
    }

    /// Drop every registration reachable through `node`.
    pub fn remove_for_node(&mut self, node: &NodeId) -> Vec<RegistryEvent> {
        let mut events = Vec::new();
        let mut emptied = Vec::new();
        let mut removed = 0usize;
        for (id, merged) in self.devices.iter_mut() {
            let gone = merged.remove_peer(node);
            if gone.is_empty() {
                continue;
            }
            removed += gone.len();
            if merged.is_empty() {
                emptied.push(id.clone());
            } else {
                events.push(RegistryEvent::Updated(merged.info()));
            }
        }
        for id in emptied {
            self.devices.remove(&id);
            tracing::info!(%id, "device unavailable");
            events.push(RegistryEvent::Unavailable { id });
        }
        if removed > 0 {
            self.version += 1;
            tracing::debug!(%node, removed, "removed registrations for node");
        }
        events
    }

    // ── Internals ─────────────────────────────────────────────────────

    fn insert(&mut self, registration: Registration) -> RegistryEvent {
        let id = registration.descriptor().id.clone();
        let is_new = !self.devices.contains_key(&id);
        let merged = self
            .devices
            .entry(id.clone())
            .or_insert_with(|| MergedDevice::new(id.clone()));
        merged.insert(registration);
        self.version += 1;

        let info = merged.info();
        if is_new {
            tracing::info!(%id, "device available");
            RegistryEvent::Available(info)
        } else {
            RegistryEvent::Updated(info)
        }
    }

    fn remove(&mut self, id: &str, instance: &str) -> Option<RegistryEvent> {
        let merged = self.devices.get_mut(id)?;
        merged.remove(instance)?;
        self.version += 1;

        if merged.is_empty() {
            self.devices.remove(id);
            tracing::info!(%id, "device unavailable");
            Some(RegistryEvent::Unavailable { id: id.to_string() })
        } else {
            Some(RegistryEvent::Updated(merged.info()))
        }
    }
}
