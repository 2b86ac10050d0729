//! Periodic reconcilers
//!
//! Three timed loops that restore invariants broken by missed events: a
//! lost disconnect (heartbeat sweep), an unserviced queue (waiting drain)
//! and a stalled reply (timeout transfer). Each runs single-threaded
//! within itself, logs per-item failures and never takes the process
//! down; all state changes go through the lifecycle manager, which
//! carries its own synchronization.

pub mod drain;
pub mod heartbeat;
pub mod timeout;

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::config::Config;
use crate::lifecycle::Lifecycle;

/// Spawn the three reconciler loops
pub fn spawn_all(lifecycle: Arc<Lifecycle>, config: &Config) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    {
        let lifecycle = Arc::clone(&lifecycle);
        let period = config.heartbeat_sweep_period;
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                heartbeat::sweep(&lifecycle).await;
            }
        }));
    }

    {
        let lifecycle = Arc::clone(&lifecycle);
        let period = config.waiting_drain_period;
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                drain::sweep(&lifecycle).await;
            }
        }));
    }

    {
        let lifecycle = Arc::clone(&lifecycle);
        let period = config.timeout_sweep_period;
        let threshold_mins = config.timeout_threshold_mins;
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                timeout::sweep(&lifecycle, threshold_mins).await;
            }
        }));
    }

    handles
}
