//! Idle reaper: periodic sweep that stops Runs whose TTY has been silent in
//! both directions for too long.

use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

use crate::orchestrator::Orchestrator;

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Run the sweep loop until shutdown. A zero timeout disables the reaper
/// entirely.
pub async fn run_reaper(
    orchestrator: Orchestrator,
    idle_timeout_sec: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    if idle_timeout_sec == 0 {
        info!("idle reaper disabled (IDLE_TIMEOUT_SEC=0)");
        return;
    }

    let timeout = Duration::from_secs(idle_timeout_sec);
    info!(
        idle_timeout_sec,
        sweep_interval_sec = SWEEP_INTERVAL.as_secs(),
        "idle reaper started"
    );

    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it so a fresh daemon does not
    // sweep before anything can have gone idle.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                orchestrator.sweep_idle(timeout).await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("idle reaper shutting down");
                    return;
                }
            }
        }
    }
}
