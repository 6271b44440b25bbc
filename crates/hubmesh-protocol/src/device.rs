/// Device contracts: what a local implementation declares, and the
/// descriptor the mesh exchanges about each registration.
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::CallError;
use crate::types::{NodeId, METADATA_ACTION_PREFIX};

// ── Type specs ─────────────────────────────────────────────────────────

/// A value type reference (`boolean`, `percentage`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeSpec {
    #[serde(rename = "type")]
    pub value_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl TypeSpec {
    pub fn new(value_type: impl Into<String>) -> Self {
        Self {
            value_type: value_type.into(),
            description: None,
        }
    }

    /// The catch-all type: values pass through untouched.
    pub fn mixed() -> Self {
        Self::new("mixed")
    }

    pub fn described(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// One positional argument of an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgumentSpec {
    #[serde(rename = "type")]
    pub value_type: String,
    #[serde(default)]
    pub optional: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ArgumentSpec {
    pub fn required(value_type: impl Into<String>) -> Self {
        Self {
            value_type: value_type.into(),
            optional: false,
            description: None,
        }
    }

    pub fn optional(value_type: impl Into<String>) -> Self {
        Self {
            optional: true,
            ..Self::required(value_type)
        }
    }
}

/// Signature of an action as published in a descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionSpec {
    #[serde(default)]
    pub arguments: Vec<ArgumentSpec>,
    pub return_type: TypeSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ActionSpec {
    pub fn new(arguments: Vec<ArgumentSpec>, return_type: TypeSpec) -> Self {
        Self {
            arguments,
            return_type,
            description: None,
        }
    }

    /// Spec for an action no type or capability knows about.
    pub fn unknown() -> Self {
        Self::new(Vec::new(), TypeSpec::mixed())
    }
}

// ── Descriptor ─────────────────────────────────────────────────────────

/// Metadata of one registration, as broadcast in `device:available`.
///
/// `owner` is the node that created the device; `peer` is the node this
/// registration is reachable through. They diverge once a descriptor has
/// been relayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub types: Vec<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub actions: BTreeMap<String, ActionSpec>,
    #[serde(default)]
    pub state: BTreeMap<String, TypeSpec>,
    #[serde(default)]
    pub events: BTreeMap<String, TypeSpec>,
    pub owner: NodeId,
    pub peer: NodeId,
    pub instance: String,
}

impl DeviceDescriptor {
    /// Own tags plus `type:*`, `cap:*` and the id itself.
    pub fn derived_tags(&self) -> Vec<String> {
        derive_tags(&self.id, &self.tags, &self.types, &self.capabilities)
    }

    /// Whether this registration can serve `action`.
    pub fn can_call(&self, action: &str) -> bool {
        action.starts_with(METADATA_ACTION_PREFIX) || self.actions.contains_key(action)
    }
}

/// Build the visible tag list of a device.
pub fn derive_tags(id: &str, tags: &[String], types: &[String], capabilities: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(tags.len() + types.len() + capabilities.len() + 1);
    let mut push = |tag: String| {
        if !out.contains(&tag) {
            out.push(tag);
        }
    };
    for tag in tags {
        push(tag.clone());
    }
    for t in types {
        push(format!("type:{t}"));
    }
    for c in capabilities {
        push(format!("cap:{c}"));
    }
    push(id.to_string());
    out
}

// ── Local devices ──────────────────────────────────────────────────────

/// What a local implementation declares about itself.
///
/// The catalog expands this into a full [`DeviceDescriptor`] at
/// registration time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceDefinition {
    pub name: Option<String>,
    pub types: Vec<String>,
    pub capabilities: Vec<String>,
    pub state: BTreeMap<String, TypeSpec>,
    pub events: BTreeMap<String, TypeSpec>,
}

impl DeviceDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_type(mut self, t: impl Into<String>) -> Self {
        self.types.push(t.into());
        self
    }

    pub fn with_capability(mut self, c: impl Into<String>) -> Self {
        self.capabilities.push(c.into());
        self
    }

    pub fn with_state(mut self, name: impl Into<String>, spec: TypeSpec) -> Self {
        self.state.insert(name.into(), spec);
        self
    }

    pub fn with_event(mut self, name: impl Into<String>, spec: TypeSpec) -> Self {
        self.events.insert(name.into(), spec);
        self
    }
}

/// Progress channel handed to a running action.
///
/// Every value passed to [`notify`](Self::notify) reaches the caller in
/// order, before the final result.
#[derive(Clone, Default)]
pub struct Progress {
    tx: Option<mpsc::UnboundedSender<Value>>,
}

impl Progress {
    /// A sink that discards everything.
    pub fn none() -> Self {
        Self { tx: None }
    }

    pub(crate) fn new(tx: mpsc::UnboundedSender<Value>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn notify(&self, value: impl Into<Value>) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(value.into());
        }
    }
}

impl fmt::Debug for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Progress")
            .field("attached", &self.tx.is_some())
            .finish()
    }
}

/// A device implemented in this process.
///
/// `actions` lists the action names the implementation answers; the
/// catalog checks them against the declared types and capabilities.
#[async_trait::async_trait]
pub trait Device: Send + Sync + 'static {
    fn definition(&self) -> DeviceDefinition;

    fn actions(&self) -> Vec<String>;

    async fn call(&self, action: &str, args: Vec<Value>, progress: Progress) -> Result<Value, CallError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> DeviceDescriptor {
        let node: NodeId = "node-a".parse().unwrap();
        DeviceDescriptor {
            id: "light:kitchen".into(),
            name: None,
            types: vec!["light".into()],
            capabilities: vec!["power".into(), "state".into()],
            tags: vec!["downstairs".into()],
            actions: BTreeMap::from([("turnOn".to_string(), ActionSpec::unknown())]),
            state: BTreeMap::new(),
            events: BTreeMap::new(),
            owner: node.clone(),
            peer: node,
            instance: "i-1".into(),
        }
    }

    #[test]
    fn derived_tags_include_types_caps_and_id() {
        assert_eq!(
            descriptor().derived_tags(),
            vec![
                "downstairs",
                "type:light",
                "cap:power",
                "cap:state",
                "light:kitchen"
            ]
        );
    }

    #[test]
    fn derived_tags_are_deduplicated() {
        let tags = derive_tags("a:b", &["a:b".into(), "x".into()], &[], &[]);
        assert_eq!(tags, vec!["a:b", "x"]);
    }

    #[test]
    fn metadata_actions_always_callable() {
        let d = descriptor();
        assert!(d.can_call("turnOn"));
        assert!(d.can_call("metadata:name"));
        assert!(!d.can_call("turnOff"));
    }

    #[test]
    fn action_spec_uses_camel_case_on_the_wire() {
        let spec = ActionSpec::new(vec![ArgumentSpec::optional("boolean")], TypeSpec::new("boolean"));
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["returnType"]["type"], "boolean");
        assert_eq!(json["arguments"][0]["optional"], true);
    }

    #[test]
    fn progress_none_discards() {
        Progress::none().notify(1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        Progress::new(tx).notify("half");
        assert_eq!(rx.try_recv().unwrap(), Value::from("half"));
    }
}
