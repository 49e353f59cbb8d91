//! Pool health monitor — probes every ACTIVE pool on its own timer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use botshard_core::{Clock, SharedClock};
use botshard_state::*;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::checker::{HealthTracker, PoolHealth, PoolProbe};

/// Fleet-level events published by the monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FleetEvent {
    /// A pool crossed the failure threshold and was marked DRAINING.
    PoolUnhealthy {
        pool_id: String,
        region: String,
        consecutive_failures: u32,
        at: u64,
    },
}

/// Probes pools and drains the ones that stop answering.
pub struct PoolHealthMonitor {
    state: StateStore,
    probe: Arc<dyn PoolProbe>,
    clock: SharedClock,
    unhealthy_threshold: u32,
    trackers: Mutex<HashMap<String, HealthTracker>>,
    events: broadcast::Sender<FleetEvent>,
}

impl PoolHealthMonitor {
    pub fn new(
        state: StateStore,
        probe: Arc<dyn PoolProbe>,
        clock: SharedClock,
        unhealthy_threshold: u32,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            state,
            probe,
            clock,
            unhealthy_threshold,
            trackers: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Subscribe to fleet events.
    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.events.subscribe()
    }

    /// Probe every ACTIVE pool once. Returns the ids of pools drained.
    pub async fn tick(&self) -> anyhow::Result<Vec<String>> {
        let pools: Vec<Pool> = self
            .state
            .list_pools(None)?
            .into_iter()
            .filter(|p| p.status == PoolStatus::Active)
            .collect();

        let mut drained = Vec::new();
        for pool in pools {
            let result = self.probe.probe(&pool.endpoint).await;
            let (health, failures) = {
                let mut trackers = self.trackers.lock().await;
                let tracker = trackers
                    .entry(pool.id.clone())
                    .or_insert_with(|| HealthTracker::new(self.unhealthy_threshold));
                (tracker.record(result), tracker.consecutive_failures())
            };
            debug!(pool = %pool.id, ?result, ?health, "pool probed");

            if health != PoolHealth::Unhealthy {
                continue;
            }
            match self.drain(&pool, failures).await {
                Ok(()) => drained.push(pool.id),
                Err(e) => warn!(pool = %pool.id, error = %e, "failed to drain unhealthy pool"),
            }
        }
        Ok(drained)
    }

    async fn drain(&self, pool: &Pool, failures: u32) -> anyhow::Result<()> {
        self.state.set_pool_status(&pool.id, PoolStatus::Draining)?;
        self.trackers.lock().await.remove(&pool.id);
        warn!(
            pool = %pool.id,
            region = %pool.region,
            endpoint = %pool.endpoint,
            failures,
            "pool unreachable, marked draining"
        );
        // No subscribers is fine.
        let _ = self.events.send(FleetEvent::PoolUnhealthy {
            pool_id: pool.id.clone(),
            region: pool.region.clone(),
            consecutive_failures: failures,
            at: self.clock.now_millis(),
        });
        Ok(())
    }

    /// Run the probe loop until `shutdown` changes.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "pool health monitor started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "pool health tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("pool health monitor shutting down");
                    break;
                }
            }
        }
    }
}
