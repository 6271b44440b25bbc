//! Effect executor — the only place that touches I/O.
//!
//! Takes a list of RuntimeEffect and executes them concretely:
//! - SendFrame -> encode + transport.send_raw()
//! - Emit -> broadcast to subscribers
//! - InvokeLocal -> spawned task; outcome fed back as a command when remote
//! - Collect -> spawned task aggregating several calls
//! - ScheduleGossip -> reported to the loop, which owns the debounce timer

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use crate::device::Progress;
use crate::rpc::{CallHandle, CallReply};

use super::effect::{InvocationOrigin, LocalInvocation, RemoteInvocation, RuntimeEffect};
use super::transport::Transport;
use super::{MeshEvent, RuntimeCommand};

pub(super) struct Executor<T> {
    pub(super) transport: T,
    events: broadcast::Sender<MeshEvent>,
    commands: mpsc::WeakSender<RuntimeCommand>,
}

impl<T: Transport> Executor<T> {
    pub(super) fn new(
        transport: T,
        events: broadcast::Sender<MeshEvent>,
        commands: mpsc::WeakSender<RuntimeCommand>,
    ) -> Self {
        Self {
            transport,
            events,
            commands,
        }
    }

    /// Execute `effects` in order. Returns `true` if any of them asked for
    /// a routing advertisement.
    pub(super) async fn run(&self, effects: Vec<RuntimeEffect>) -> bool {
        let mut gossip = false;
        for effect in effects {
            match effect {
                RuntimeEffect::SendFrame { peer, frame } => match frame.to_bytes() {
                    Ok(bytes) => {
                        if let Err(e) = self.transport.send_raw(peer, Bytes::from(bytes)).await {
                            tracing::warn!(%peer, kind = frame.message().type_name(), "send failed: {e}");
                        }
                    }
                    Err(e) => tracing::warn!(%peer, "frame encoding failed: {e}"),
                },
                RuntimeEffect::Emit(event) => {
                    // Err only means nobody is subscribed.
                    let _ = self.events.send(event);
                }
                RuntimeEffect::ScheduleGossip => gossip = true,
                RuntimeEffect::InvokeLocal(invocation) => self.spawn_invocation(invocation),
                RuntimeEffect::Collect { calls, reply } => {
                    tokio::spawn(collect(calls, reply));
                }
            }
        }
        gossip
    }

    fn spawn_invocation(&self, invocation: LocalInvocation) {
        let LocalInvocation {
            device,
            action,
            arguments,
            origin,
            result_to_wire,
        } = invocation;

        match origin {
            InvocationOrigin::Local { reply, progress } => {
                tokio::spawn(async move {
                    let outcome = device.call(&action, arguments, Progress::new(progress)).await;
                    let _ = reply.send(outcome);
                });
            }
            InvocationOrigin::Remote(remote) => {
                let Some(commands) = self.commands.upgrade() else {
                    return;
                };
                tokio::spawn(async move {
                    let (tx, mut rx) = mpsc::unbounded_channel();
                    let call = device.call(&action, arguments, Progress::new(tx));
                    tokio::pin!(call);

                    let outcome = loop {
                        tokio::select! {
                            biased;
                            Some(data) = rx.recv() => forward_progress(&commands, &remote, data).await,
                            outcome = &mut call => break outcome,
                        }
                    };
                    while let Ok(data) = rx.try_recv() {
                        forward_progress(&commands, &remote, data).await;
                    }

                    let outcome = outcome.map(|value| result_to_wire.apply(&value));
                    let _ = commands
                        .send(RuntimeCommand::InvocationFinished {
                            origin: remote,
                            outcome,
                        })
                        .await;
                });
            }
        }
    }
}

async fn forward_progress(commands: &mpsc::Sender<RuntimeCommand>, origin: &RemoteInvocation, data: Value) {
    let _ = commands
        .send(RuntimeCommand::InvocationProgress {
            origin: origin.clone(),
            data,
        })
        .await;
}

async fn collect(calls: Vec<CallHandle>, reply: CallReply) {
    let mut results = Vec::with_capacity(calls.len());
    for call in calls {
        results.push(call.await.unwrap_or(Value::Null));
    }
    let _ = reply.send(Ok(Value::Array(results)));
}
