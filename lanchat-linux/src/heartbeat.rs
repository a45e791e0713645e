//! Liveness: periodic heartbeats on every session and the stale-peer sweep.

use std::sync::Arc;
use std::time::Duration;

use lanchat_core::time::now_ms;
use lanchat_core::{DeviceRegistry, Envelope, PeerKey};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info};

use crate::engine::{shutdown_requested, Shared};
use crate::events::Event;
use crate::session::{self, SessionHandle, SessionTable};

pub(crate) async fn heartbeat_loop(shared: Arc<Shared>) {
    let period = shared.config.heartbeat_interval();
    let mut shutdown = shared.shutdown.clone();
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown_requested(&mut shutdown) => break,
            _ = ticker.tick() => {}
        }
        for handle in send_heartbeats(&shared.sessions, period).await {
            session::drop_session(&shared, &handle).await;
        }
    }
    debug!("heartbeat loop stopped");
}

/// One heartbeat per live session. Returns the sessions whose write failed or
/// was still blocked after `limit`.
pub async fn send_heartbeats(sessions: &SessionTable, limit: Duration) -> Vec<SessionHandle> {
    let mut failed = Vec::new();
    for handle in sessions.handles().await {
        match timeout(limit, handle.writer.send(&Envelope::Heartbeat)).await {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => debug!(peer = %handle.peer, error = %e, "heartbeat failed"),
            Err(_) => debug!(peer = %handle.peer, "heartbeat write stalled"),
        }
        failed.push(handle);
    }
    failed
}

pub(crate) async fn sweep_loop(shared: Arc<Shared>) {
    let mut shutdown = shared.shutdown.clone();
    let mut ticker = interval(shared.config.sweep_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown_requested(&mut shutdown) => break,
            _ = ticker.tick() => {}
        }
        for key in sweep(&shared.registry, shared.config.offline_timeout()) {
            shared.emit(Event::PeerRemoved(key));
        }
    }
    debug!("sweep loop stopped");
}

/// Drop every peer silent for longer than `window`.
pub fn sweep(registry: &DeviceRegistry, window: Duration) -> Vec<PeerKey> {
    let removed = registry.sweep_stale(now_ms(), window);
    for key in &removed {
        info!(peer = %key, "peer went offline");
    }
    removed
}
