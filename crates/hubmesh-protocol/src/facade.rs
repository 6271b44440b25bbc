//! Application-facing handles: proxies for devices anywhere in the mesh and
//! handles for devices registered by this process.

use std::time::Duration;

use serde_json::{json, Value};

use crate::device::ActionSpec;
use crate::error::CallError;
use crate::registry::DeviceInfo;
use crate::rpc::CallHandle;
use crate::runtime::RuntimeHandle;

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Fail with [`CallError::TimedOut`] after this long. Falls back to
    /// `RuntimeConfig::default_call_timeout`.
    pub timeout: Option<Duration>,
}

impl CallOptions {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

// ── DeviceProxy ────────────────────────────────────────────────────────

/// A device addressed by id, wherever it is registered.
///
/// Holds no state of its own: every method goes through the runtime, so a
/// proxy stays valid while the device comes and goes.
#[derive(Clone)]
pub struct DeviceProxy {
    handle: RuntimeHandle,
    id: String,
}

impl DeviceProxy {
    pub(crate) fn new(handle: RuntimeHandle, id: String) -> Self {
        Self { handle, id }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Invoke `action` and wait for its result.
    pub async fn call(&self, action: &str, arguments: Vec<Value>) -> Result<Value, CallError> {
        self.handle.call(&self.id, action, arguments).await
    }

    /// Invoke `action`, returning a handle that also streams progress.
    pub async fn call_with(&self, action: &str, arguments: Vec<Value>, options: CallOptions) -> CallHandle {
        self.handle.start_call(&self.id, action, arguments, options).await
    }

    /// Current merged metadata, `None` while nothing backs the id.
    pub async fn metadata(&self) -> Option<DeviceInfo> {
        self.handle.device_info(&self.id).await
    }

    /// Typed handle for `name`, only if the device publishes that action.
    pub async fn action(&self, name: &str) -> Option<Action> {
        let info = self.metadata().await?;
        let spec = info.actions.get(name)?.clone();
        Some(Action {
            proxy: self.clone(),
            name: name.to_string(),
            spec,
        })
    }

    /// Rename every registration of this device.
    pub async fn set_name(&self, name: &str) -> Result<Value, CallError> {
        self.call("metadata:name", vec![json!(name)]).await
    }

    pub async fn add_tags(&self, tags: &[&str]) -> Result<Value, CallError> {
        self.call("metadata:addTags", vec![json!(tags)]).await
    }

    pub async fn remove_tags(&self, tags: &[&str]) -> Result<Value, CallError> {
        self.call("metadata:removeTags", vec![json!(tags)]).await
    }
}

impl std::fmt::Debug for DeviceProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DeviceProxy[{}]", self.id)
    }
}

/// One published action of a device.
#[derive(Debug, Clone)]
pub struct Action {
    proxy: DeviceProxy,
    name: String,
    spec: ActionSpec,
}

impl Action {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> &ActionSpec {
        &self.spec
    }

    pub async fn call(&self, arguments: Vec<Value>) -> Result<Value, CallError> {
        self.proxy.call(&self.name, arguments).await
    }
}

// ── Typed wrappers ─────────────────────────────────────────────────────

/// Calls of the `power` capability.
#[async_trait::async_trait]
pub trait PowerExt {
    async fn power(&self) -> Result<bool, CallError>;

    async fn set_power(&self, on: bool) -> Result<bool, CallError>;

    async fn turn_on(&self) -> Result<bool, CallError>;

    async fn turn_off(&self) -> Result<bool, CallError>;
}

#[async_trait::async_trait]
impl PowerExt for DeviceProxy {
    async fn power(&self) -> Result<bool, CallError> {
        expect_bool(self.call("power", vec![]).await?)
    }

    async fn set_power(&self, on: bool) -> Result<bool, CallError> {
        expect_bool(self.call("setPower", vec![json!(on)]).await?)
    }

    async fn turn_on(&self) -> Result<bool, CallError> {
        expect_bool(self.call("turnOn", vec![]).await?)
    }

    async fn turn_off(&self) -> Result<bool, CallError> {
        expect_bool(self.call("turnOff", vec![]).await?)
    }
}

fn expect_bool(value: Value) -> Result<bool, CallError> {
    value
        .as_bool()
        .ok_or_else(|| CallError::failed(format!("expected a boolean, got {value}")))
}

// ── DeviceHandle ───────────────────────────────────────────────────────

/// A registration owned by this process.
///
/// Dropping the handle keeps the device registered; call
/// [`remove`](Self::remove) to take it off the mesh.
#[derive(Clone)]
pub struct DeviceHandle {
    handle: RuntimeHandle,
    id: String,
    instance: String,
}

impl DeviceHandle {
    pub(crate) fn new(handle: RuntimeHandle, id: String, instance: String) -> Self {
        Self { handle, id, instance }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Identity of this registration among those sharing the id.
    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Unregister locally and tell every node.
    pub async fn remove(self) {
        self.handle.unregister(self.id, self.instance).await;
    }

    /// Publish `event` to local subscribers and every node.
    pub async fn emit_event(&self, event: &str, payload: impl Into<Value>) {
        self.handle
            .emit_event(self.id.clone(), self.instance.clone(), event.to_string(), payload.into())
            .await;
    }
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DeviceHandle[{} {}]", self.id, self.instance)
    }
}
