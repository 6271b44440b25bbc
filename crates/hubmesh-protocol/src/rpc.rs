/// Call correlation: outbound invocations waiting for their answer.
///
/// Pending calls are keyed by `(target node, seq)`. `seq` comes from a
/// monotonically increasing counter, so two in-flight calls never share a
/// key, and a reply only matches if it comes from the node the call was
/// sent to.
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::catalog::Conversion;
use crate::envelope::{InvokeProgress, InvokeRequest, InvokeResult, Message};
use crate::error::CallError;
use crate::types::NodeId;

/// Where a call's final outcome goes.
pub type CallReply = oneshot::Sender<Result<Value, CallError>>;

// ── CallHandle (caller side) ───────────────────────────────────────────

/// Future of one device call.
///
/// Resolves exactly once. Progress notifications can be read with
/// [`progress`](Self::progress) before (or after) awaiting the result;
/// they arrive in the order the device sent them.
pub struct CallHandle {
    result: oneshot::Receiver<Result<Value, CallError>>,
    progress: mpsc::UnboundedReceiver<Value>,
}

impl CallHandle {
    pub(crate) fn channel() -> (Self, CallReply, mpsc::UnboundedSender<Value>) {
        let (reply_tx, reply_rx) = oneshot::channel();
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        (
            Self {
                result: reply_rx,
                progress: progress_rx,
            },
            reply_tx,
            progress_tx,
        )
    }

    /// A call that already failed.
    pub(crate) fn failed(error: CallError) -> Self {
        let (handle, reply, _) = Self::channel();
        let _ = reply.send(Err(error));
        handle
    }

    /// A call answered without leaving the runtime.
    pub(crate) fn resolved(value: Value) -> Self {
        let (handle, reply, _) = Self::channel();
        let _ = reply.send(Ok(value));
        handle
    }

    /// Next progress notification. `None` once the call has finished and
    /// every notification was read.
    pub async fn progress(&mut self) -> Option<Value> {
        self.progress.recv().await
    }

    /// Next buffered progress notification, without waiting.
    pub fn try_progress(&mut self) -> Option<Value> {
        self.progress.try_recv().ok()
    }
}

impl std::fmt::Debug for CallHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CallHandle")
    }
}

impl Future for CallHandle {
    type Output = Result<Value, CallError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.result)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(CallError::Shutdown)))
    }
}

// ── CallCorrelator ─────────────────────────────────────────────────────

/// A call about to be sent to `target`.
pub struct OutboundCall {
    pub target: NodeId,
    pub device_id: String,
    pub action: String,
    pub arguments: Vec<Value>,
    pub timeout: Option<Duration>,
    /// Applied to the result before it reaches the caller.
    pub conversion: Conversion,
    pub reply: CallReply,
    pub progress: Option<mpsc::UnboundedSender<Value>>,
}

struct PendingCall {
    device_id: String,
    action: String,
    reply: CallReply,
    progress: Option<mpsc::UnboundedSender<Value>>,
    deadline: Option<Instant>,
    conversion: Conversion,
}

impl PendingCall {
    fn finish(self, outcome: Result<Value, CallError>) {
        let _ = self.reply.send(outcome);
    }
}

/// Tracks outbound calls until they resolve, fail or time out.
#[derive(Default)]
pub struct CallCorrelator {
    next_seq: u64,
    pending: HashMap<(NodeId, u64), PendingCall>,
}

impl CallCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Register `call` and return the invoke message to route to its target.
    pub fn start(&mut self, call: OutboundCall, now: Instant) -> (NodeId, Message) {
        let seq = self.next_seq;
        self.next_seq += 1;

        let message = Message::Invoke(InvokeRequest {
            id: call.device_id.clone(),
            seq,
            action: call.action.clone(),
            arguments: call.arguments,
        });
        tracing::debug!(
            target_node = %call.target,
            device = %call.device_id,
            action = %call.action,
            seq,
            "call started"
        );
        self.pending.insert(
            (call.target.clone(), seq),
            PendingCall {
                device_id: call.device_id,
                action: call.action,
                reply: call.reply,
                progress: call.progress,
                deadline: call.timeout.map(|t| now + t),
                conversion: call.conversion,
            },
        );
        (call.target, message)
    }

    /// Resolve the matching call. Returns `false` if nothing was waiting.
    pub fn handle_result(&mut self, source: &NodeId, result: InvokeResult) -> bool {
        let Some(call) = self.pending.remove(&(source.clone(), result.seq)) else {
            tracing::debug!(%source, seq = result.seq, "result for no pending call");
            return false;
        };
        let outcome = match result.error {
            Some(error) => Err(CallError::Failed(error)),
            None => Ok(call
                .conversion
                .apply(&result.result.unwrap_or(Value::Null))),
        };
        call.finish(outcome);
        true
    }

    /// Forward a progress notification. The call stays pending.
    pub fn handle_progress(&mut self, source: &NodeId, progress: InvokeProgress) -> bool {
        match self.pending.get(&(source.clone(), progress.seq)) {
            Some(call) => {
                if let Some(tx) = &call.progress {
                    let _ = tx.send(progress.data);
                }
                true
            }
            None => false,
        }
    }

    /// Fail every call whose deadline has passed.
    pub fn expire(&mut self, now: Instant) -> usize {
        self.reject_where(CallError::TimedOut, |_, call| {
            call.deadline.is_some_and(|deadline| deadline <= now)
        })
    }

    /// Fail every call addressed to `node`.
    pub fn reject_node(&mut self, node: &NodeId) -> usize {
        self.reject_where(CallError::Unavailable, |(target, _), _| target == node)
    }

    /// Fail every call for `device_id` addressed to `node`.
    pub fn reject_device(&mut self, node: &NodeId, device_id: &str) -> usize {
        self.reject_where(CallError::Unavailable, |(target, _), call| {
            target == node && call.device_id == device_id
        })
    }

    /// Fail everything; used on shutdown.
    pub fn reject_all(&mut self, error: CallError) -> usize {
        self.reject_where(error, |_, _| true)
    }

    fn reject_where(
        &mut self,
        error: CallError,
        matches: impl Fn(&(NodeId, u64), &PendingCall) -> bool,
    ) -> usize {
        let keys: Vec<(NodeId, u64)> = self
            .pending
            .iter()
            .filter(|(key, call)| matches(*key, *call))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &keys {
            if let Some(call) = self.pending.remove(key) {
                tracing::debug!(
                    target_node = %key.0,
                    seq = key.1,
                    action = %call.action,
                    %error,
                    "call rejected"
                );
                call.finish(Err(error.clone()));
            }
        }
        keys.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(s: &str) -> NodeId {
        s.parse().unwrap()
    }

    fn outbound(target: &str, timeout: Option<Duration>) -> (OutboundCall, CallHandle) {
        let (handle, reply, progress) = CallHandle::channel();
        (
            OutboundCall {
                target: node(target),
                device_id: "light:kitchen".into(),
                action: "turnOn".into(),
                arguments: vec![],
                timeout,
                conversion: Conversion::identity(),
                reply,
                progress: Some(progress),
            },
            handle,
        )
    }

    #[tokio::test]
    async fn first_call_uses_seq_zero_and_resolves() {
        let mut calls = CallCorrelator::new();
        let (call, handle) = outbound("a", None);
        let (target, message) = calls.start(call, Instant::now());
        assert_eq!(target, node("a"));
        let Message::Invoke(req) = message else {
            panic!("expected invoke");
        };
        assert_eq!(req.seq, 0);
        assert_eq!(req.action, "turnOn");

        assert!(calls.handle_result(&node("a"), InvokeResult::ok(req.id, 0, json!(true))));
        assert_eq!(handle.await, Ok(json!(true)));
        assert!(calls.is_empty());
    }

    #[tokio::test]
    async fn progress_then_result_in_order() {
        let mut calls = CallCorrelator::new();
        let (call, mut handle) = outbound("a", None);
        calls.start(call, Instant::now());

        let progress = |data| InvokeProgress {
            id: "light:kitchen".into(),
            seq: 0,
            data,
        };
        assert!(calls.handle_progress(&node("a"), progress(json!(10))));
        assert!(calls.handle_progress(&node("a"), progress(json!(90))));
        assert_eq!(calls.len(), 1);
        calls.handle_result(&node("a"), InvokeResult::ok("light:kitchen".into(), 0, json!("done")));

        assert_eq!(handle.progress().await, Some(json!(10)));
        assert_eq!(handle.progress().await, Some(json!(90)));
        assert_eq!(handle.progress().await, None);
        assert_eq!(handle.await, Ok(json!("done")));
    }

    #[tokio::test]
    async fn error_string_is_passed_through() {
        let mut calls = CallCorrelator::new();
        let (call, handle) = outbound("a", None);
        calls.start(call, Instant::now());
        calls.handle_result(&node("a"), InvokeResult::err("light:kitchen".into(), 0, "bulb is broken"));
        assert_eq!(handle.await, Err(CallError::failed("bulb is broken")));
    }

    #[tokio::test]
    async fn reply_from_wrong_node_does_not_match() {
        let mut calls = CallCorrelator::new();
        let (call_a, _handle_a) = outbound("a", None);
        calls.start(call_a, Instant::now());

        assert!(!calls.handle_result(&node("b"), InvokeResult::ok("light:kitchen".into(), 0, json!(1))));
        assert!(!calls.handle_progress(
            &node("b"),
            InvokeProgress {
                id: "light:kitchen".into(),
                seq: 0,
                data: json!(1)
            }
        ));
        assert_eq!(calls.len(), 1);
    }

    #[tokio::test]
    async fn seq_never_repeats() {
        let mut calls = CallCorrelator::new();
        let mut seen = Vec::new();
        for _ in 0..3 {
            let (call, _handle) = outbound("a", None);
            let (_, message) = calls.start(call, Instant::now());
            if let Message::Invoke(req) = message {
                seen.push(req.seq);
            }
        }
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn timeout_rejects_and_late_reply_is_discarded() {
        let mut calls = CallCorrelator::new();
        let now = Instant::now();
        let (call, handle) = outbound("a", Some(Duration::from_millis(100)));
        calls.start(call, now);
        let (untimed, _untimed_handle) = outbound("a", None);
        calls.start(untimed, now);

        assert_eq!(calls.expire(now + Duration::from_millis(50)), 0);
        assert_eq!(calls.expire(now + Duration::from_millis(100)), 1);
        assert_eq!(handle.await, Err(CallError::TimedOut));

        assert!(!calls.handle_result(&node("a"), InvokeResult::ok("light:kitchen".into(), 0, json!(1))));
        assert_eq!(calls.len(), 1);
    }

    #[tokio::test]
    async fn node_loss_rejects_only_that_node() {
        let mut calls = CallCorrelator::new();
        let (to_a, handle_a) = outbound("a", None);
        let (to_b, _handle_b) = outbound("b", None);
        calls.start(to_a, Instant::now());
        calls.start(to_b, Instant::now());

        assert_eq!(calls.reject_node(&node("a")), 1);
        assert_eq!(handle_a.await, Err(CallError::Unavailable));
        assert_eq!(calls.len(), 1);
    }

    #[tokio::test]
    async fn device_loss_rejects_matching_device() {
        let mut calls = CallCorrelator::new();
        let (call, handle) = outbound("a", None);
        calls.start(call, Instant::now());
        assert_eq!(calls.reject_device(&node("a"), "light:other"), 0);
        assert_eq!(calls.reject_device(&node("a"), "light:kitchen"), 1);
        assert_eq!(handle.await, Err(CallError::Unavailable));
    }

    #[tokio::test]
    async fn dropped_reply_reads_as_shutdown() {
        let (handle, reply, _progress) = CallHandle::channel();
        drop(reply);
        assert_eq!(handle.await, Err(CallError::Shutdown));
        assert_eq!(CallHandle::failed(CallError::UnknownDevice).await, Err(CallError::UnknownDevice));
    }
}
