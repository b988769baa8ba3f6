//! Periodic output health monitoring.
//!
//! A fixed-interval task asking the supervisor whether the HLS output is
//! still advancing. Degradation is reported asynchronously over the bridge
//! event channel and never blocks an in-flight request.

use crate::supervisor::BridgeSupervisor;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Spawn the health monitor. The task runs for the life of the process;
/// checks against an idle bridge are no-ops.
pub fn spawn_health_monitor(
    supervisor: Arc<BridgeSupervisor>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so a freshly started
        // bridge gets a full interval before its first check.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            supervisor.health_tick().await;
        }
    })
}
