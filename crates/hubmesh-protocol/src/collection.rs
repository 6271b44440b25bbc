//! Live, filtered views over the merged devices.
//!
//! A collection caches its filtered list together with the registry version
//! it was computed from, and only re-filters when the version moved.

use std::cmp::Ordering;
use std::sync::Mutex;

use serde_json::Value;
use tokio::task::JoinSet;

use crate::error::CallError;
use crate::registry::DeviceInfo;
use crate::rpc::CallHandle;
use crate::runtime::RuntimeHandle;

/// Which devices a collection contains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    All,
    /// Devices matching every tag (see [`DeviceInfo::matches_tag`]).
    Tags(Vec<String>),
}

impl Filter {
    pub fn matches(&self, info: &DeviceInfo) -> bool {
        match self {
            Filter::All => true,
            Filter::Tags(tags) => tags.iter().all(|t| info.matches_tag(t)),
        }
    }
}

#[derive(Default)]
struct Cache {
    version: Option<u64>,
    devices: Vec<DeviceInfo>,
}

/// A live view of the devices matching a [`Filter`].
pub struct Collection {
    handle: RuntimeHandle,
    filter: Filter,
    cache: Mutex<Cache>,
}

impl Collection {
    pub(crate) fn new(handle: RuntimeHandle, filter: Filter) -> Self {
        Self {
            handle,
            filter,
            cache: Mutex::new(Cache::default()),
        }
    }

    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    /// Devices currently in the view, ordered by id.
    pub async fn devices(&self) -> Vec<DeviceInfo> {
        let known = self.lock().version;
        match self.handle.devices_since(known).await {
            Ok(Some((version, all))) => {
                let devices: Vec<DeviceInfo> = all.into_iter().filter(|d| self.filter.matches(d)).collect();
                let mut cache = self.lock();
                cache.version = Some(version);
                cache.devices = devices.clone();
                devices
            }
            Ok(None) => self.lock().devices.clone(),
            Err(e) => {
                tracing::debug!("collection refresh failed: {e}");
                self.lock().devices.clone()
            }
        }
    }

    pub async fn ids(&self) -> Vec<String> {
        self.devices().await.into_iter().map(|d| d.id).collect()
    }

    pub async fn len(&self) -> usize {
        self.devices().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.devices().await.is_empty()
    }

    /// Invoke `action` on every device in the view.
    ///
    /// Every call is queued with the runtime before any result is awaited,
    /// so slow devices do not hold up the others. Results are in id order.
    pub async fn call(&self, action: &str, arguments: Vec<Value>) -> MultiResult {
        let mut results = Vec::new();
        for (id, call) in self.start_calls(action, arguments).await {
            results.push((id, call.await));
        }
        MultiResult { results }
    }

    /// Invoke `action` on every device in the view and resolve with the first
    /// success. Fails with the first error in id order when every call fails,
    /// and with [`CallError::UnknownDevice`] when the view is empty.
    pub async fn call_any(&self, action: &str, arguments: Vec<Value>) -> Result<Value, CallError> {
        let mut errors = Vec::new();
        let mut running = JoinSet::new();
        for (index, (_, call)) in self.start_calls(action, arguments).await.into_iter().enumerate() {
            running.spawn(async move { (index, call.await) });
        }
        while let Some(joined) = running.join_next().await {
            match joined {
                Ok((_, Ok(value))) => return Ok(value),
                Ok((index, Err(e))) => errors.push((index, e)),
                Err(e) => tracing::debug!("collection call task failed: {e}"),
            }
        }
        errors.sort_by_key(|(index, _)| *index);
        Err(errors.into_iter().next().map_or(CallError::UnknownDevice, |(_, e)| e))
    }

    async fn start_calls(&self, action: &str, arguments: Vec<Value>) -> Vec<(String, CallHandle)> {
        let devices = self.devices().await;
        let mut pending = Vec::with_capacity(devices.len());
        for device in devices {
            let call = self
                .handle
                .start_call(&device.id, action, arguments.clone(), Default::default())
                .await;
            pending.push((device.id, call));
        }
        pending
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Cache> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection").field("filter", &self.filter).finish()
    }
}

/// Per-device outcomes of a collection call, in id order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MultiResult {
    results: Vec<(String, Result<Value, CallError>)>,
}

impl MultiResult {
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Result<Value, CallError>> {
        self.results.iter().find(|(d, _)| d == id).map(|(_, r)| r)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Result<Value, CallError>)> {
        self.results.iter().map(|(id, r)| (id.as_str(), r))
    }

    pub fn first_value(&self) -> Option<&Value> {
        self.results.iter().find_map(|(_, r)| r.as_ref().ok())
    }

    pub fn first_error(&self) -> Option<&CallError> {
        self.results.iter().find_map(|(_, r)| r.as_ref().err())
    }

    pub fn has_errors(&self) -> bool {
        self.first_error().is_some()
    }

    fn values(&self) -> impl Iterator<Item = &Value> {
        self.results.iter().filter_map(|(_, r)| r.as_ref().ok())
    }

    /// Largest successful value. Values that do not compare with the
    /// current best (a string against a number, say) are skipped.
    pub fn highest(&self) -> Option<&Value> {
        self.pick(Ordering::Greater)
    }

    /// Smallest successful value, with the same rules as [`highest`](Self::highest).
    pub fn lowest(&self) -> Option<&Value> {
        self.pick(Ordering::Less)
    }

    fn pick(&self, wanted: Ordering) -> Option<&Value> {
        let mut best: Option<&Value> = None;
        for value in self.values() {
            match best {
                None if compare(value, value).is_some() => best = Some(value),
                Some(current) if compare(value, current) == Some(wanted) => best = Some(value),
                _ => {}
            }
        }
        best
    }

    /// Each distinct successful value with how often it came back, in order
    /// of first appearance.
    pub fn distinct(&self) -> Vec<(&Value, usize)> {
        let mut counts: Vec<(&Value, usize)> = Vec::new();
        for value in self.values() {
            match counts.iter().position(|(v, _)| *v == value) {
                Some(i) => counts[i].1 += 1,
                None => counts.push((value, 1)),
            }
        }
        counts
    }

    fn count(&self, wanted: bool) -> usize {
        self.values().filter(|v| v.as_bool() == Some(wanted)).count()
    }

    pub fn any_true(&self) -> bool {
        self.count(true) > 0
    }

    pub fn any_false(&self) -> bool {
        self.count(false) > 0
    }

    /// More devices answered `true` than `false`.
    pub fn mostly_true(&self) -> bool {
        self.count(true) > self.count(false)
    }

    /// Not [`mostly_true`](Self::mostly_true). A tie counts as false.
    pub fn mostly_false(&self) -> bool {
        !self.mostly_true()
    }
}

/// Order of two values of the same kind. Numbers, strings and booleans
/// compare; anything else does not.
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}
