//! One logical device backed by any number of registrations.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::device::{derive_tags, ActionSpec, Device, DeviceDescriptor, TypeSpec};
use crate::types::NodeId;

// ── Registration ───────────────────────────────────────────────────────

/// One concrete backing of a merged device.
#[derive(Clone)]
pub enum Registration {
    /// Implemented in this process.
    Local {
        descriptor: DeviceDescriptor,
        device: Arc<dyn Device>,
    },
    /// Announced by another node. `distance` is the hop count to
    /// `descriptor.peer` when the announcement was accepted.
    Remote {
        descriptor: DeviceDescriptor,
        distance: usize,
    },
}

impl Registration {
    pub fn descriptor(&self) -> &DeviceDescriptor {
        match self {
            Registration::Local { descriptor, .. } | Registration::Remote { descriptor, .. } => descriptor,
        }
    }

    pub fn instance(&self) -> &str {
        &self.descriptor().instance
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Registration::Local { .. })
    }

    pub fn can_call(&self, action: &str) -> bool {
        self.descriptor().can_call(action)
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Registration::Local { descriptor, .. } => {
                write!(f, "Local[{} {}]", descriptor.id, descriptor.instance)
            }
            Registration::Remote { descriptor, distance } => write!(
                f,
                "Remote[{} {} via {} at {}]",
                descriptor.id, descriptor.instance, descriptor.peer, distance
            ),
        }
    }
}

// ── DeviceInfo ─────────────────────────────────────────────────────────

/// Visible metadata of a merged device.
///
/// Lists are the union of every registration's lists; maps and scalar
/// fields keep the first registration's value.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub id: String,
    pub name: Option<String>,
    pub types: Vec<String>,
    pub capabilities: Vec<String>,
    pub tags: Vec<String>,
    pub actions: BTreeMap<String, ActionSpec>,
    pub state: BTreeMap<String, TypeSpec>,
    pub events: BTreeMap<String, TypeSpec>,
    pub owner: Option<NodeId>,
    pub registrations: usize,
    pub local: bool,
}

impl DeviceInfo {
    /// Own tags plus `type:*`, `cap:*` and the id.
    pub fn derived_tags(&self) -> Vec<String> {
        derive_tags(&self.id, &self.tags, &self.types, &self.capabilities)
    }

    /// A tag matches if it is the id or one of the derived tags.
    pub fn matches_tag(&self, tag: &str) -> bool {
        tag == self.id || self.derived_tags().iter().any(|t| t == tag)
    }

    pub fn has_action(&self, action: &str) -> bool {
        self.actions.contains_key(action)
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}

// ── MergedDevice ───────────────────────────────────────────────────────

/// Registrations sharing one device id, in arrival order.
#[derive(Debug, Clone)]
pub struct MergedDevice {
    id: String,
    registrations: Vec<Registration>,
}

impl MergedDevice {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            registrations: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn registrations(&self) -> &[Registration] {
        &self.registrations
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    pub fn get(&self, instance: &str) -> Option<&Registration> {
        self.registrations.iter().find(|r| r.instance() == instance)
    }

    pub(crate) fn get_mut(&mut self, instance: &str) -> Option<&mut Registration> {
        self.registrations.iter_mut().find(|r| r.instance() == instance)
    }

    /// Add a registration, replacing one with the same instance in place.
    /// Returns the replaced registration.
    pub fn insert(&mut self, registration: Registration) -> Option<Registration> {
        match self
            .registrations
            .iter_mut()
            .find(|r| r.instance() == registration.instance())
        {
            Some(existing) => Some(std::mem::replace(existing, registration)),
            None => {
                self.registrations.push(registration);
                None
            }
        }
    }

    pub fn remove(&mut self, instance: &str) -> Option<Registration> {
        let idx = self.registrations.iter().position(|r| r.instance() == instance)?;
        Some(self.registrations.remove(idx))
    }

    /// Remove every remote registration reachable through `node`.
    pub fn remove_peer(&mut self, node: &NodeId) -> Vec<Registration> {
        let (gone, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.registrations)
            .into_iter()
            .partition(|r| !r.is_local() && &r.descriptor().peer == node);
        self.registrations = kept;
        gone
    }

    /// First registration able to serve `action`.
    pub fn first_capable(&self, action: &str) -> Option<&Registration> {
        self.registrations.iter().find(|r| r.can_call(action))
    }

    /// First local registration able to serve `action`.
    pub fn first_local_capable(&self, action: &str) -> Option<&Registration> {
        self.registrations
            .iter()
            .find(|r| r.is_local() && r.can_call(action))
    }

    pub fn info(&self) -> DeviceInfo {
        let mut info = DeviceInfo {
            id: self.id.clone(),
            name: None,
            types: Vec::new(),
            capabilities: Vec::new(),
            tags: Vec::new(),
            actions: BTreeMap::new(),
            state: BTreeMap::new(),
            events: BTreeMap::new(),
            owner: None,
            registrations: self.registrations.len(),
            local: self.registrations.iter().any(Registration::is_local),
        };
        for registration in &self.registrations {
            let d = registration.descriptor();
            if info.name.is_none() {
                info.name = d.name.clone();
            }
            if info.owner.is_none() {
                info.owner = Some(d.owner.clone());
            }
            merge_list(&mut info.types, &d.types);
            merge_list(&mut info.capabilities, &d.capabilities);
            merge_list(&mut info.tags, &d.tags);
            merge_map(&mut info.actions, &d.actions);
            merge_map(&mut info.state, &d.state);
            merge_map(&mut info.events, &d.events);
        }
        info
    }
}

fn merge_list(into: &mut Vec<String>, from: &[String]) {
    for item in from {
        if !into.contains(item) {
            into.push(item.clone());
        }
    }
}

fn merge_map<V: Clone>(into: &mut BTreeMap<String, V>, from: &BTreeMap<String, V>) {
    for (key, value) in from {
        into.entry(key.clone()).or_insert_with(|| value.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(instance: &str, peer: &str, name: Option<&str>, actions: &[&str], tags: &[&str]) -> DeviceDescriptor {
        let peer: NodeId = peer.parse().unwrap();
        DeviceDescriptor {
            id: "light:kitchen".into(),
            name: name.map(String::from),
            types: vec!["light".into()],
            capabilities: vec![],
            tags: tags.iter().map(|t| t.to_string()).collect(),
            actions: actions
                .iter()
                .map(|a| (a.to_string(), ActionSpec::unknown()))
                .collect(),
            state: BTreeMap::new(),
            events: BTreeMap::new(),
            owner: peer.clone(),
            peer,
            instance: instance.into(),
        }
    }

    fn remote(instance: &str, peer: &str, name: Option<&str>, actions: &[&str], tags: &[&str]) -> Registration {
        Registration::Remote {
            descriptor: descriptor(instance, peer, name, actions, tags),
            distance: 0,
        }
    }

    #[test]
    fn same_instance_replaces_in_place() {
        let mut merged = MergedDevice::new("light:kitchen");
        assert!(merged.insert(remote("i1", "a", None, &["turnOn"], &[])).is_none());
        assert!(merged.insert(remote("i2", "b", None, &[], &[])).is_none());
        assert!(merged
            .insert(remote("i1", "a", Some("Kitchen"), &["turnOn"], &[]))
            .is_some());

        assert_eq!(merged.registrations().len(), 2);
        assert_eq!(merged.registrations()[0].instance(), "i1");
        assert_eq!(merged.info().name.as_deref(), Some("Kitchen"));
    }

    #[test]
    fn info_unions_lists_first_writer_wins_scalars() {
        let mut merged = MergedDevice::new("light:kitchen");
        merged.insert(remote("i1", "a", Some("First"), &["turnOn"], &["x"]));
        merged.insert(remote("i2", "b", Some("Second"), &["dim"], &["x", "y"]));

        let info = merged.info();
        assert_eq!(info.name.as_deref(), Some("First"));
        assert_eq!(info.owner, Some("a".parse().unwrap()));
        assert_eq!(info.tags, vec!["x", "y"]);
        assert!(info.has_action("turnOn"));
        assert!(info.has_action("dim"));
        assert_eq!(info.registrations, 2);
        assert!(!info.local);
        assert!(info.matches_tag("type:light"));
        assert!(info.matches_tag("light:kitchen"));
        assert!(!info.matches_tag("type:sensor"));
    }

    #[test]
    fn dispatch_picks_first_capable() {
        let mut merged = MergedDevice::new("light:kitchen");
        merged.insert(remote("i1", "a", None, &["dim"], &[]));
        merged.insert(remote("i2", "b", None, &["turnOn"], &[]));

        assert_eq!(merged.first_capable("turnOn").unwrap().instance(), "i2");
        assert_eq!(merged.first_capable("metadata:name").unwrap().instance(), "i1");
        assert!(merged.first_capable("explode").is_none());
        assert!(merged.first_local_capable("dim").is_none());
    }

    #[test]
    fn remove_peer_takes_only_that_peer() {
        let mut merged = MergedDevice::new("light:kitchen");
        merged.insert(remote("i1", "a", None, &[], &[]));
        merged.insert(remote("i2", "b", None, &[], &[]));
        merged.insert(remote("i3", "a", None, &[], &[]));

        let gone = merged.remove_peer(&"a".parse().unwrap());
        assert_eq!(gone.len(), 2);
        assert_eq!(merged.registrations().len(), 1);
        assert_eq!(merged.registrations()[0].instance(), "i2");
        assert!(merged.remove("i2").is_some());
        assert!(merged.is_empty());
        assert!(merged.remove("i2").is_none());
    }
}
