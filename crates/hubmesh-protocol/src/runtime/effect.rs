use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::catalog::Conversion;
use crate::device::Device;
use crate::envelope::Frame;
use crate::rpc::{CallHandle, CallReply};
use crate::types::{NodeId, PeerId};

use super::MeshEvent;

/// Side effect produced by the pure `RuntimeState`.
///
/// Every `handle_*` / `tick_*` method returns a `Vec<RuntimeEffect>`; the
/// executor is the only place that turns them into I/O.
#[derive(Debug)]
pub enum RuntimeEffect {
    /// Write a frame to one link.
    SendFrame { peer: PeerId, frame: Frame },

    /// Publish an event to application subscribers.
    Emit(MeshEvent),

    /// Routing changed: arm the gossip debounce if it is not already armed.
    ScheduleGossip,

    /// Run an action on a device implemented in this process.
    InvokeLocal(LocalInvocation),

    /// Wait for several calls and answer with the array of their results.
    /// Failed calls contribute `null`.
    Collect {
        calls: Vec<CallHandle>,
        reply: CallReply,
    },
}

/// Who asked for a local invocation and where its outcome goes.
pub enum InvocationOrigin {
    /// A caller in this process.
    Local {
        reply: CallReply,
        progress: mpsc::UnboundedSender<Value>,
    },
    /// A `device:invoke` from another node; answered over the mesh.
    Remote(RemoteInvocation),
}

/// Addressing of a `device:invoke` we are serving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteInvocation {
    pub node: NodeId,
    pub id: String,
    pub seq: u64,
}

pub struct LocalInvocation {
    pub device: Arc<dyn Device>,
    pub action: String,
    pub arguments: Vec<Value>,
    pub origin: InvocationOrigin,
    /// Applied to a successful result before it goes on the wire.
    pub result_to_wire: Conversion,
}

impl fmt::Debug for LocalInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let origin = match &self.origin {
            InvocationOrigin::Local { .. } => "local".to_string(),
            InvocationOrigin::Remote(r) => format!("{}#{}", r.node, r.seq),
        };
        f.debug_struct("LocalInvocation")
            .field("action", &self.action)
            .field("arguments", &self.arguments)
            .field("origin", &origin)
            .finish()
    }
}

impl fmt::Debug for InvocationOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvocationOrigin::Local { .. } => f.write_str("Local"),
            InvocationOrigin::Remote(r) => f.debug_tuple("Remote").field(r).finish(),
        }
    }
}
