//! Fleet snapshot collection and publication.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use botshard_core::{Clock, SharedClock};
use botshard_state::*;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Point-in-time view of the whole fleet.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetSnapshot {
    pub taken_at: u64,
    pub channels_active: u64,
    pub channels_scaling: u64,
    pub channels_draining: u64,
    pub pools_active: u64,
    pub pools_draining: u64,
    pub shards_used: u64,
    pub shards_total: u64,
    /// Agents on ACTIVE channels.
    pub current_agents: u64,
    /// Capacity of ACTIVE channels.
    pub max_agents: u64,
    pub utilization: f64,
    pub regions: Vec<RegionSnapshot>,
    pub queue: QueueStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionSnapshot {
    pub region: String,
    pub channels_active: u64,
    pub current_agents: u64,
    pub max_agents: u64,
    pub utilization: f64,
    pub pools: u64,
}

/// Destination for fleet snapshots.
pub trait MetricsSink: Send + Sync {
    fn publish(&self, snapshot: &FleetSnapshot) -> anyhow::Result<()>;
}

/// Emits each snapshot as one structured log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl MetricsSink for LogSink {
    fn publish(&self, s: &FleetSnapshot) -> anyhow::Result<()> {
        info!(
            channels_active = s.channels_active,
            channels_draining = s.channels_draining,
            pools_active = s.pools_active,
            pools_draining = s.pools_draining,
            agents = s.current_agents,
            capacity = s.max_agents,
            utilization = s.utilization,
            pending = s.queue.pending,
            processing = s.queue.processing,
            failed = s.queue.failed,
            regions = s.regions.len(),
            "fleet metrics"
        );
        for r in &s.regions {
            debug!(
                region = %r.region,
                channels = r.channels_active,
                agents = r.current_agents,
                capacity = r.max_agents,
                utilization = r.utilization,
                pools = r.pools,
                "region metrics"
            );
        }
        Ok(())
    }
}

fn ratio(current: u64, max: u64) -> f64 {
    if max == 0 { 0.0 } else { current as f64 / max as f64 }
}

/// Builds fleet snapshots from the state store and hands them to sinks.
pub struct MetricsCollector {
    state: StateStore,
    clock: SharedClock,
    interval: Duration,
    sinks: Vec<Arc<dyn MetricsSink>>,
    latest: RwLock<Option<FleetSnapshot>>,
}

impl MetricsCollector {
    pub fn new(state: StateStore, clock: SharedClock, interval: Duration) -> Self {
        Self {
            state,
            clock,
            interval,
            sinks: Vec::new(),
            latest: RwLock::new(None),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Aggregate the current fleet state.
    pub fn collect(&self) -> anyhow::Result<FleetSnapshot> {
        let now = self.clock.now_millis();
        let channels = self.state.list_channels(&ChannelFilter::default())?;
        let pools = self.state.list_pools(None)?;

        let mut snapshot = FleetSnapshot {
            taken_at: now,
            queue: self.state.queue_status(None, now)?,
            ..Default::default()
        };
        let mut regions: BTreeMap<String, RegionSnapshot> = BTreeMap::new();

        for c in &channels {
            let region = regions.entry(c.region.clone()).or_insert_with(|| RegionSnapshot {
                region: c.region.clone(),
                ..Default::default()
            });
            match c.status {
                ChannelStatus::Active => {
                    snapshot.channels_active += 1;
                    snapshot.current_agents += u64::from(c.current_agents);
                    snapshot.max_agents += u64::from(c.max_agents);
                    region.channels_active += 1;
                    region.current_agents += u64::from(c.current_agents);
                    region.max_agents += u64::from(c.max_agents);
                }
                ChannelStatus::Scaling => snapshot.channels_scaling += 1,
                ChannelStatus::Draining => snapshot.channels_draining += 1,
            }
        }

        for p in &pools {
            match p.status {
                PoolStatus::Active => snapshot.pools_active += 1,
                PoolStatus::Draining => snapshot.pools_draining += 1,
            }
            snapshot.shards_used += u64::from(p.used_shards);
            snapshot.shards_total += u64::from(p.total_shards);
            regions
                .entry(p.region.clone())
                .or_insert_with(|| RegionSnapshot {
                    region: p.region.clone(),
                    ..Default::default()
                })
                .pools += 1;
        }

        snapshot.utilization = ratio(snapshot.current_agents, snapshot.max_agents);
        snapshot.regions = regions
            .into_values()
            .map(|mut r| {
                r.utilization = ratio(r.current_agents, r.max_agents);
                r
            })
            .collect();
        Ok(snapshot)
    }

    /// Collect, publish to every sink and remember the snapshot.
    pub async fn snapshot(&self) -> anyhow::Result<FleetSnapshot> {
        let snapshot = self.collect()?;
        for sink in &self.sinks {
            if let Err(e) = sink.publish(&snapshot) {
                warn!(error = %e, "metrics sink failed");
            }
        }
        *self.latest.write().await = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// Most recent published snapshot, if any.
    pub async fn latest(&self) -> Option<FleetSnapshot> {
        self.latest.read().await.clone()
    }

    /// Run the emission loop until shutdown signal.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "metrics collector started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    if let Err(e) = self.snapshot().await {
                        tracing::error!(error = %e, "metrics snapshot failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("metrics collector shutting down");
                    break;
                }
            }
        }
    }
}
