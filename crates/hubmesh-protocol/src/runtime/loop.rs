/// The mesh runtime event loop.
///
/// A single async task that owns all mutable mesh state and multiplexes
/// over transport events, application commands, and timers.
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use hubmesh_transport::PeerEvent;

use super::executor::Executor;
use super::state::RuntimeState;
use super::transport::PeerTable;
use super::{RuntimeCommand, RuntimeConfig};

/// Main event loop. Returns once the transport stream closes, every handle
/// is dropped, or a shutdown command arrives.
pub(super) async fn runtime_loop(
    mut state: RuntimeState,
    mut executor: Executor<PeerTable>,
    mut peer_events: mpsc::Receiver<PeerEvent>,
    mut cmd_rx: mpsc::Receiver<RuntimeCommand>,
) {
    let debounce = state.config.gossip_debounce;

    // ── Timers ──────────────────────────────────────────────────────
    let floor = RuntimeConfig::MIN_INTERVAL;
    let mut rebroadcast = tokio::time::interval(state.config.rebroadcast_interval.max(floor));
    let mut call_sweep = tokio::time::interval(state.config.call_sweep_interval.max(floor));
    rebroadcast.set_missed_tick_behavior(MissedTickBehavior::Delay);
    call_sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // Skip the immediate first tick on all intervals
    rebroadcast.tick().await;
    call_sweep.tick().await;

    // Armed by the first routing change, cleared when the round goes out.
    let mut gossip_at: Option<Instant> = None;

    tracing::info!(node = %state.local_id, "mesh runtime started");

    loop {
        let effects = tokio::select! {
            // ── Transport ───────────────────────────────────────────
            event = peer_events.recv() => match event {
                Some(PeerEvent::Connected(handle)) => {
                    let peer = handle.id();
                    let node_id = handle.node_id().clone();
                    executor.transport.insert(handle);
                    tracing::debug!(%peer, node = %node_id, "link up");
                    state.handle_peer_connected(peer, node_id)
                }
                Some(PeerEvent::Message { peer, data }) => state.handle_frame(peer, &data),
                Some(PeerEvent::Disconnected { peer }) => {
                    executor.transport.remove(peer);
                    tracing::debug!(%peer, "link down");
                    state.handle_peer_disconnected(peer)
                }
                None => {
                    tracing::info!("transport closed");
                    state.shutdown();
                    break;
                }
            },

            // ── Application commands ────────────────────────────────
            cmd = cmd_rx.recv() => match cmd {
                Some(RuntimeCommand::Shutdown) | None => {
                    state.shutdown();
                    break;
                }
                Some(cmd) => state.handle_command(cmd, Instant::now()),
            },

            // ── Timers ──────────────────────────────────────────────
            _ = sleep_until(gossip_at) => {
                gossip_at = None;
                state.tick_gossip()
            }

            _ = rebroadcast.tick() => state.tick_rebroadcast(),

            _ = call_sweep.tick() => state.tick_call_timeouts(Instant::now()),
        };

        if executor.run(effects).await {
            gossip_at.get_or_insert_with(|| Instant::now() + debounce);
        }
    }

    tracing::info!(node = %state.local_id, links = executor.transport.len(), "mesh runtime stopped");
}

/// Sleep until `deadline`, or forever when there is none.
async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
