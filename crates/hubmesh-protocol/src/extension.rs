//! Automatic enhancement of every device matching a tag filter.
//!
//! An extension offers each matching device, present or future, to a
//! callback. When the callback returns a device, it is registered locally
//! under the same id and merges with the original.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

use crate::collection::Filter;
use crate::device::Device;
use crate::facade::DeviceHandle;
use crate::registry::DeviceInfo;
use crate::runtime::{MeshEvent, RuntimeHandle};

/// Callback deciding how to enhance one device. `None` leaves it alone.
pub type Enhance = dyn Fn(&DeviceInfo) -> Option<Arc<dyn Device>> + Send + Sync;

/// A running extension. Dropping it leaves it running for as long as the
/// runtime does; [`stop`](Self::stop) ends it and removes what it added.
pub struct Extension {
    stop: oneshot::Sender<()>,
    task: JoinHandle<usize>,
}

impl Extension {
    /// Offer every device currently matching `filter`, then keep offering
    /// devices as they appear or start to match.
    pub(crate) async fn start(handle: RuntimeHandle, filter: Filter, enhance: Arc<Enhance>) -> Self {
        // Subscribe before the scan so nothing registered meanwhile is missed.
        let events = handle.subscribe();
        let mut extender = Extender {
            handle,
            filter,
            enhance,
            seen: HashSet::new(),
            added: Vec::new(),
        };
        extender.scan().await;

        let (stop, stop_rx) = oneshot::channel();
        let task = tokio::spawn(extender.run(events, stop_rx));
        Self { stop, task }
    }

    /// Stop offering devices and remove every enhancement this extension
    /// registered. Returns how many were removed.
    pub async fn stop(self) -> usize {
        let _ = self.stop.send(());
        self.task.await.unwrap_or_default()
    }
}

impl std::fmt::Debug for Extension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extension").finish_non_exhaustive()
    }
}

struct Extender {
    handle: RuntimeHandle,
    filter: Filter,
    enhance: Arc<Enhance>,
    /// Ids already offered to the callback.
    seen: HashSet<String>,
    added: Vec<DeviceHandle>,
}

impl Extender {
    async fn run(mut self, mut events: broadcast::Receiver<MeshEvent>, stop: oneshot::Receiver<()>) -> usize {
        let mut stop = Some(stop);
        loop {
            tokio::select! {
                _ = stop_requested(&mut stop) => break,
                event = events.recv() => match event {
                    Ok(MeshEvent::DeviceAvailable(info) | MeshEvent::DeviceUpdated(info)) => self.offer(info).await,
                    Ok(MeshEvent::DeviceUnavailable(id)) => {
                        self.seen.remove(&id);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::debug!(missed, "extension lagged, rescanning");
                        self.scan().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        let removed = self.added.len();
        for device in self.added {
            device.remove().await;
        }
        removed
    }

    async fn scan(&mut self) {
        match self.handle.devices_since(None).await {
            Ok(Some((_, devices))) => {
                for info in devices {
                    self.offer(info).await;
                }
            }
            Ok(None) => {}
            Err(e) => tracing::debug!("extension scan failed: {e}"),
        }
    }

    async fn offer(&mut self, info: DeviceInfo) {
        if !self.filter.matches(&info) || self.seen.contains(&info.id) {
            return;
        }
        self.seen.insert(info.id.clone());
        let Some(device) = (self.enhance)(&info) else {
            return;
        };
        match self.handle.register_shared(info.id.clone(), device).await {
            Ok(handle) => {
                tracing::debug!(id = %info.id, "device extended");
                self.added.push(handle);
            }
            Err(e) => tracing::warn!(id = %info.id, "could not extend device: {e}"),
        }
    }
}

/// Resolves once a stop is requested. A dropped sender detaches instead.
async fn stop_requested(stop: &mut Option<oneshot::Receiver<()>>) {
    if let Some(rx) = stop.as_mut() {
        if rx.await.is_ok() {
            return;
        }
        *stop = None;
    }
    std::future::pending::<()>().await
}
