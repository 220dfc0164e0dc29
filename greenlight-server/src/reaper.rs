//! Periodic eviction of idle clients
//!
//! The reaper wakes every `sweep_interval` and drops clients that have not
//! been seen for the throttle's eviction window. It lives exactly as long as
//! the serving session: it exits once the shutdown state reaches
//! [`ShutdownState::Stopped`] or the coordinator goes away.

use crate::shutdown::ShutdownState;
use greenlight::ClientThrottle;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Spawn the sweep loop for `throttle`
pub fn spawn_reaper(
    throttle: Arc<ClientThrottle>,
    mut shutdown: watch::Receiver<ShutdownState>,
) -> JoinHandle<()> {
    let interval = throttle.config().sweep_interval;

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let evicted = throttle.evict_idle(Instant::now().into_std());
                    tracing::debug!(evicted, remaining = throttle.len(), "reaper sweep");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() == ShutdownState::Stopped {
                        break;
                    }
                }
            }
        }

        tracing::debug!("reaper stopped");
    })
}
