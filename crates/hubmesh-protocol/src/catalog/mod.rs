/// Declarative catalog of value types, capabilities and device types.
///
/// Capabilities and device types are plain tables registered at startup.
/// `describe_device` expands what a local device declares into the full
/// action/state/event tables and refuses devices that do not implement
/// every action their types and capabilities require.
mod builtin;
mod values;

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;

pub use values::{Conversion, ValueType};

use crate::device::{ActionSpec, ArgumentSpec, DeviceDefinition, DeviceDescriptor, TypeSpec};
use crate::error::MeshError;
use crate::types::{NodeId, METADATA_ACTION_PREFIX};

// ── Definitions ────────────────────────────────────────────────────────

/// Contract of a capability: actions it brings, plus events and state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapabilityDef {
    pub name: String,
    pub required: Vec<String>,
    pub actions: BTreeMap<String, ActionSpec>,
    pub events: BTreeMap<String, TypeSpec>,
    pub state: BTreeMap<String, TypeSpec>,
}

impl CapabilityDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn requires(mut self, capability: impl Into<String>) -> Self {
        self.required.push(capability.into());
        self
    }

    pub fn action(mut self, name: impl Into<String>, arguments: Vec<ArgumentSpec>, returns: TypeSpec) -> Self {
        self.actions.insert(name.into(), ActionSpec::new(arguments, returns));
        self
    }

    pub fn event(mut self, name: impl Into<String>, spec: TypeSpec) -> Self {
        self.events.insert(name.into(), spec);
        self
    }

    pub fn state(mut self, name: impl Into<String>, spec: TypeSpec) -> Self {
        self.state.insert(name.into(), spec);
        self
    }
}

/// Contract of a device type. `local` capabilities only resolve for
/// devices of this type (a dimmable light, a temperature sensor).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceTypeDef {
    pub name: String,
    pub required: Vec<String>,
    pub actions: BTreeMap<String, ActionSpec>,
    pub events: BTreeMap<String, TypeSpec>,
    pub state: BTreeMap<String, TypeSpec>,
    pub local: BTreeMap<String, CapabilityDef>,
}

impl DeviceTypeDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn requires(mut self, capability: impl Into<String>) -> Self {
        self.required.push(capability.into());
        self
    }

    pub fn action(mut self, name: impl Into<String>, arguments: Vec<ArgumentSpec>, returns: TypeSpec) -> Self {
        self.actions.insert(name.into(), ActionSpec::new(arguments, returns));
        self
    }

    pub fn event(mut self, name: impl Into<String>, spec: TypeSpec) -> Self {
        self.events.insert(name.into(), spec);
        self
    }

    pub fn state(mut self, name: impl Into<String>, spec: TypeSpec) -> Self {
        self.state.insert(name.into(), spec);
        self
    }

    /// Add a capability that only exists for this type.
    pub fn when(mut self, capability: CapabilityDef) -> Self {
        self.local.insert(capability.name.clone(), capability);
        self
    }
}

/// Result of describing a local device, before it is bound to a node.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceDescription {
    pub id: String,
    pub name: Option<String>,
    pub types: Vec<String>,
    pub capabilities: Vec<String>,
    pub actions: BTreeMap<String, ActionSpec>,
    pub state: BTreeMap<String, TypeSpec>,
    pub events: BTreeMap<String, TypeSpec>,
}

impl DeviceDescription {
    /// Bind to the local node. `owner` and `peer` are both `local`.
    pub fn into_descriptor(self, local: &NodeId, instance: String, tags: Vec<String>) -> DeviceDescriptor {
        DeviceDescriptor {
            id: self.id,
            name: self.name,
            types: self.types,
            capabilities: self.capabilities,
            tags,
            actions: self.actions,
            state: self.state,
            events: self.events,
            owner: local.clone(),
            peer: local.clone(),
            instance,
        }
    }
}

// ── Catalog ────────────────────────────────────────────────────────────

pub struct Catalog {
    values: HashMap<String, ValueType>,
    capabilities: HashMap<String, CapabilityDef>,
    types: HashMap<String, DeviceTypeDef>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl Catalog {
    /// A catalog with nothing registered.
    pub fn empty() -> Self {
        Self {
            values: HashMap::new(),
            capabilities: HashMap::new(),
            types: HashMap::new(),
        }
    }

    /// The built-in value types, capabilities and device types.
    pub fn with_builtins() -> Self {
        let mut catalog = Self::empty();
        builtin::register(&mut catalog);
        catalog
    }

    pub fn register_value_type(&mut self, name: impl Into<String>, value_type: ValueType) {
        self.values.insert(name.into(), value_type);
    }

    pub fn register_capability(&mut self, def: CapabilityDef) {
        self.capabilities.insert(def.name.clone(), def);
    }

    pub fn register_device_type(&mut self, def: DeviceTypeDef) {
        self.types.insert(def.name.clone(), def);
    }

    pub fn device_type(&self, name: &str) -> Option<&DeviceTypeDef> {
        self.types.get(name)
    }

    /// Global capabilities first, then capabilities local to `types`.
    pub fn find_capability(&self, types: &[String], name: &str) -> Option<&CapabilityDef> {
        self.capabilities.get(name).or_else(|| {
            types
                .iter()
                .filter_map(|t| self.types.get(t))
                .find_map(|t| t.local.get(name))
        })
    }

    fn find_action(&self, action: &str, types: &[String], capabilities: &[String]) -> Option<&ActionSpec> {
        types
            .iter()
            .filter_map(|t| self.types.get(t))
            .find_map(|t| t.actions.get(action))
            .or_else(|| {
                capabilities
                    .iter()
                    .filter_map(|c| self.find_capability(types, c))
                    .find_map(|c| c.actions.get(action))
            })
    }

    /// Expand and validate what a local device declares.
    ///
    /// `implemented` lists the action names the device answers. Names
    /// starting with `_` or the metadata prefix are not published.
    pub fn describe_device(
        &self,
        id: &str,
        definition: &DeviceDefinition,
        implemented: &[String],
    ) -> Result<DeviceDescription, MeshError> {
        let types = definition.types.clone();
        let mut capabilities: Vec<String> = Vec::new();
        let mut events = definition.events.clone();
        let mut state = definition.state.clone();

        for t in &types {
            if let Some(def) = self.types.get(t) {
                merge_missing(&mut events, &def.events);
                merge_missing(&mut state, &def.state);
                self.add_capabilities(&types, &def.required, &mut capabilities, &mut events, &mut state);
            }
        }
        self.add_capabilities(
            &types,
            &definition.capabilities,
            &mut capabilities,
            &mut events,
            &mut state,
        );

        let actions: BTreeMap<String, ActionSpec> = implemented
            .iter()
            .filter(|name| !name.starts_with('_') && !name.starts_with(METADATA_ACTION_PREFIX))
            .map(|name| {
                let spec = self
                    .find_action(name, &types, &capabilities)
                    .cloned()
                    .unwrap_or_else(ActionSpec::unknown);
                (name.clone(), spec)
            })
            .collect();

        self.check_all_actions(&actions, &types, &capabilities)?;

        Ok(DeviceDescription {
            id: id.to_string(),
            name: definition.name.clone(),
            types,
            capabilities,
            actions,
            state,
            events,
        })
    }

    /// Add `wanted` and everything they require, depth first, merging
    /// events and state without overwriting earlier entries.
    fn add_capabilities(
        &self,
        types: &[String],
        wanted: &[String],
        capabilities: &mut Vec<String>,
        events: &mut BTreeMap<String, TypeSpec>,
        state: &mut BTreeMap<String, TypeSpec>,
    ) {
        for name in wanted {
            if capabilities.contains(name) {
                continue;
            }
            capabilities.push(name.clone());
            if let Some(cap) = self.find_capability(types, name) {
                self.add_capabilities(types, &cap.required, capabilities, events, state);
                merge_missing(events, &cap.events);
                merge_missing(state, &cap.state);
            }
        }
    }

    fn check_all_actions(
        &self,
        actions: &BTreeMap<String, ActionSpec>,
        types: &[String],
        capabilities: &[String],
    ) -> Result<(), MeshError> {
        for t in types {
            let Some(def) = self.types.get(t) else { continue };
            if let Some(missing) = def.actions.keys().find(|a| !actions.contains_key(*a)) {
                return Err(MeshError::MissingAction {
                    action: missing.clone(),
                    required_by: format!("type {t}"),
                });
            }
        }
        for c in capabilities {
            let Some(cap) = self.find_capability(types, c) else { continue };
            if let Some(missing) = cap.actions.keys().find(|a| !actions.contains_key(*a)) {
                return Err(MeshError::MissingAction {
                    action: missing.clone(),
                    required_by: format!("capability {c}"),
                });
            }
        }
        Ok(())
    }

    // ── Conversions ───────────────────────────────────────────────────

    /// Wire value → native value for `spec`. Unknown types pass through.
    pub fn create_conversion(&self, spec: &TypeSpec) -> Conversion {
        self.values
            .get(&spec.value_type)
            .map(|v| v.convert)
            .unwrap_or_else(Conversion::identity)
    }

    /// Native value → wire value for `spec`. Unknown types pass through.
    pub fn create_to_wire(&self, spec: &TypeSpec) -> Conversion {
        self.values
            .get(&spec.value_type)
            .map(|v| v.to_wire)
            .unwrap_or_else(Conversion::identity)
    }

    /// Coerce positional arguments; extra arguments pass through.
    pub fn convert_arguments(&self, action: &ActionSpec, args: Vec<Value>) -> Vec<Value> {
        self.map_arguments(action, args, |catalog, spec| catalog.create_conversion(spec))
    }

    /// Shape positional arguments for the wire; extra arguments pass through.
    pub fn arguments_to_wire(&self, action: &ActionSpec, args: Vec<Value>) -> Vec<Value> {
        self.map_arguments(action, args, |catalog, spec| catalog.create_to_wire(spec))
    }

    fn map_arguments(
        &self,
        action: &ActionSpec,
        args: Vec<Value>,
        pick: impl Fn(&Self, &TypeSpec) -> Conversion,
    ) -> Vec<Value> {
        args.into_iter()
            .enumerate()
            .map(|(idx, value)| match action.arguments.get(idx) {
                Some(arg) => pick(self, &TypeSpec::new(arg.value_type.clone())).apply(&value),
                None => value,
            })
            .collect()
    }
}

fn merge_missing(into: &mut BTreeMap<String, TypeSpec>, from: &BTreeMap<String, TypeSpec>) {
    for (key, spec) in from {
        into.entry(key.clone()).or_insert_with(|| spec.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    const LIGHT_ACTIONS: &[&str] = &["state", "power", "setPower", "turnOn", "turnOff"];

    #[test]
    fn light_pulls_in_required_capabilities() {
        let catalog = Catalog::with_builtins();
        let def = DeviceDefinition::new().with_type("light");
        let desc = catalog
            .describe_device("light:kitchen", &def, &names(LIGHT_ACTIONS))
            .unwrap();

        assert_eq!(desc.capabilities, names(&["state", "power"]));
        assert!(desc.events.contains_key("power"));
        assert!(desc.events.contains_key("state"));
        assert_eq!(desc.state["power"].value_type, "boolean");
        assert_eq!(desc.actions["setPower"].arguments[0].value_type, "boolean");
    }

    #[test]
    fn missing_action_names_capability() {
        let catalog = Catalog::with_builtins();
        let def = DeviceDefinition::new().with_type("light");
        let err = catalog
            .describe_device("light:kitchen", &def, &names(&["state", "power", "setPower", "turnOn"]))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Action turnOff needs to be implemented by device (from capability power)"
        );
    }

    #[test]
    fn missing_type_action_names_type() {
        let catalog = Catalog::with_builtins();
        let def = DeviceDefinition::new().with_type("sensor");
        let err = catalog.describe_device("sensor:hall", &def, &[]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Action values needs to be implemented by device (from type sensor)"
        );
    }

    #[test]
    fn local_capability_resolves_through_type() {
        let catalog = Catalog::with_builtins();
        let def = DeviceDefinition::new()
            .with_type("light")
            .with_capability("dimmable");
        let mut actions = names(LIGHT_ACTIONS);
        actions.push("setBrightness".into());
        let err = catalog
            .describe_device("light:desk", &def, &actions)
            .unwrap_err();
        assert!(matches!(err, MeshError::MissingAction { ref action, .. } if action == "decreaseBrightness"));

        actions.extend(names(&["increaseBrightness", "decreaseBrightness"]));
        let desc = catalog.describe_device("light:desk", &def, &actions).unwrap();
        assert_eq!(
            desc.actions["setBrightness"].arguments[0].value_type,
            "percentage"
        );
    }

    #[test]
    fn unknown_actions_get_mixed_spec_and_private_ones_are_hidden() {
        let catalog = Catalog::with_builtins();
        let def = DeviceDefinition::new().with_type("mystery");
        let desc = catalog
            .describe_device("x:y", &def, &names(&["wiggle", "_internal", "metadata:name"]))
            .unwrap();
        assert_eq!(desc.actions.len(), 1);
        assert_eq!(desc.actions["wiggle"], ActionSpec::unknown());
    }

    #[test]
    fn declared_state_wins_over_capability_state() {
        let catalog = Catalog::with_builtins();
        let def = DeviceDefinition::new()
            .with_capability("power")
            .with_state("power", TypeSpec::new("string"));
        let desc = catalog
            .describe_device("plug:1", &def, &names(LIGHT_ACTIONS))
            .unwrap();
        assert_eq!(desc.state["power"].value_type, "string");
    }

    #[test]
    fn conversions_follow_argument_specs() {
        let catalog = Catalog::with_builtins();
        let spec = ActionSpec::new(
            vec![ArgumentSpec::required("boolean"), ArgumentSpec::required("percentage")],
            TypeSpec::mixed(),
        );
        let converted = catalog.convert_arguments(&spec, vec![json!("yes"), json!("250"), json!("extra")]);
        assert_eq!(converted, vec![json!(true), json!(100.0), json!("extra")]);

        let to_wire = catalog.create_to_wire(&TypeSpec::new("unknown-type"));
        assert_eq!(to_wire.apply(&json!([1])), json!([1]));
        assert_eq!(
            catalog.create_conversion(&TypeSpec::new("number")).apply(&json!("7")),
            json!(7.0)
        );
    }

    #[test]
    fn into_descriptor_binds_local_node() {
        let catalog = Catalog::with_builtins();
        let local: NodeId = "n1".parse().unwrap();
        let desc = catalog
            .describe_device("x:y", &DeviceDefinition::new().named("Thing"), &[])
            .unwrap()
            .into_descriptor(&local, "inst".into(), vec!["t".into()]);
        assert_eq!(desc.owner, local);
        assert_eq!(desc.peer, local);
        assert_eq!(desc.name.as_deref(), Some("Thing"));
        assert_eq!(desc.tags, vec!["t"]);
    }
}
