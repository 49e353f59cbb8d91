//! Autoscaler — per-region channel scaling with explicit cooldown state.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use botshard_core::{Clock, SharedClock};
use botshard_placement::ChannelAssigner;
use botshard_state::*;
use tracing::{debug, info, warn};

/// Scaling phase of one region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionPhase {
    Normal,
    /// Scale actions are suppressed until the timestamp (epoch ms).
    Cooldown { until: u64 },
}

/// Outcome of evaluating one region on one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScaleDecision {
    ScaleUp { kind: ChannelKind, created: u32 },
    ScaleDown { drained: u32 },
    NoChange,
}

/// Aggregated load of a region's ACTIVE channels.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionUsage {
    pub current_agents: u64,
    pub max_agents: u64,
    /// Kind with the highest utilization; MAIN wins ties.
    pub hottest_kind: ChannelKind,
}

impl RegionUsage {
    pub fn utilization(&self) -> f64 {
        if self.max_agents == 0 {
            0.0
        } else {
            self.current_agents as f64 / self.max_agents as f64
        }
    }
}

/// Compute usage over the ACTIVE channels in `channels`.
///
/// Returns `None` when the region has no ACTIVE capacity.
pub fn region_usage(channels: &[Channel]) -> Option<RegionUsage> {
    let mut per_kind: HashMap<ChannelKind, (u64, u64)> = HashMap::new();
    for c in channels.iter().filter(|c| c.status == ChannelStatus::Active) {
        let entry = per_kind.entry(c.kind).or_default();
        entry.0 += u64::from(c.current_agents);
        entry.1 += u64::from(c.max_agents);
    }

    let current_agents: u64 = per_kind.values().map(|(cur, _)| cur).sum();
    let max_agents: u64 = per_kind.values().map(|(_, max)| max).sum();
    if max_agents == 0 {
        return None;
    }

    let mut hottest_kind = ChannelKind::Main;
    let mut hottest = -1.0_f64;
    // ALL is ordered MAIN first, so a strict comparison keeps MAIN on ties.
    for kind in ChannelKind::ALL {
        if let Some(&(cur, max)) = per_kind.get(&kind) {
            if max == 0 {
                continue;
            }
            let util = cur as f64 / max as f64;
            if util > hottest {
                hottest = util;
                hottest_kind = kind;
            }
        }
    }

    Some(RegionUsage {
        current_agents,
        max_agents,
        hottest_kind,
    })
}

/// Settings for [`ChannelScaler`].
#[derive(Debug, Clone)]
pub struct ScalerSettings {
    /// Regions evaluated even before they have channels.
    pub regions: Vec<String>,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    pub scale_up_batch: u32,
    pub cooldown: Duration,
}

/// Evaluates regional utilization and creates or drains channels.
pub struct ChannelScaler {
    state: StateStore,
    assigner: Arc<ChannelAssigner>,
    clock: SharedClock,
    settings: ScalerSettings,
    phases: Mutex<HashMap<String, RegionPhase>>,
}

impl ChannelScaler {
    pub fn new(
        state: StateStore,
        assigner: Arc<ChannelAssigner>,
        clock: SharedClock,
        settings: ScalerSettings,
    ) -> Self {
        Self {
            state,
            assigner,
            clock,
            settings,
            phases: Mutex::new(HashMap::new()),
        }
    }

    /// Current phase of a region. Unknown regions are NORMAL.
    pub fn phase(&self, region: &str) -> RegionPhase {
        self.lock_phases()
            .get(region)
            .copied()
            .unwrap_or(RegionPhase::Normal)
    }

    /// Evaluate every known region once.
    pub async fn tick(&self) -> anyhow::Result<Vec<(String, ScaleDecision)>> {
        let channels = self.state.list_channels(&ChannelFilter::default())?;

        let mut regions: BTreeSet<String> = self.settings.regions.iter().cloned().collect();
        regions.extend(channels.iter().map(|c| c.region.clone()));

        let mut decisions = Vec::new();
        for region in regions {
            let in_region: Vec<Channel> = channels
                .iter()
                .filter(|c| c.region == region)
                .cloned()
                .collect();
            match self.tick_region(&region, &in_region).await {
                Ok(decision) => decisions.push((region, decision)),
                Err(e) => {
                    warn!(%region, error = %e, "autoscale tick failed for region");
                }
            }
        }
        Ok(decisions)
    }

    async fn tick_region(
        &self,
        region: &str,
        channels: &[Channel],
    ) -> anyhow::Result<ScaleDecision> {
        let now = self.clock.now_millis();

        if let RegionPhase::Cooldown { until } = self.phase(region) {
            if now < until {
                debug!(%region, remaining_ms = until - now, "region in cooldown");
                return Ok(ScaleDecision::NoChange);
            }
            info!(%region, "cooldown elapsed, region back to normal");
            self.set_phase(region, RegionPhase::Normal);
        }

        let Some(usage) = region_usage(channels) else {
            debug!(%region, "region has no active capacity, skipping");
            return Ok(ScaleDecision::NoChange);
        };
        let utilization = usage.utilization();
        debug!(
            %region,
            current = usage.current_agents,
            max = usage.max_agents,
            utilization,
            "region utilization"
        );

        let decision = if utilization >= self.settings.scale_up_threshold {
            self.scale_up(region, &usage).await?
        } else if utilization < self.settings.scale_down_threshold {
            self.scale_down(region, channels)?
        } else {
            return Ok(ScaleDecision::NoChange);
        };

        let until = now + self.settings.cooldown.as_millis() as u64;
        self.set_phase(region, RegionPhase::Cooldown { until });
        self.assigner.invalidate_region(region).await;
        Ok(decision)
    }

    async fn scale_up(&self, region: &str, usage: &RegionUsage) -> anyhow::Result<ScaleDecision> {
        let kind = usage.hottest_kind;
        let created = self
            .assigner
            .create_channels(region, kind, self.settings.scale_up_batch, None)
            .await?;
        info!(
            %region,
            %kind,
            created = created.len(),
            utilization = usage.utilization(),
            "scaled up"
        );
        Ok(ScaleDecision::ScaleUp {
            kind,
            created: created.len() as u32,
        })
    }

    fn scale_down(&self, region: &str, channels: &[Channel]) -> anyhow::Result<ScaleDecision> {
        let mut drained = 0;
        for channel in channels
            .iter()
            .filter(|c| c.status == ChannelStatus::Active && c.can_drain())
        {
            match self.state.set_channel_status(&channel.name, ChannelStatus::Draining) {
                Ok(_) => drained += 1,
                // An agent joined since the snapshot; leave the channel alone.
                Err(StateError::InvalidTransition(reason)) => {
                    debug!(channel = %channel.name, %reason, "channel no longer drainable");
                }
                Err(e) => return Err(e.into()),
            }
        }
        info!(%region, drained, "scaled down");
        Ok(ScaleDecision::ScaleDown { drained })
    }

    /// Run the scaling loop until `shutdown` changes.
    pub async fn run(&self, interval: Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "autoscaler started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.tick().await {
                        tracing::error!(error = %e, "autoscaler tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("autoscaler shutting down");
                    break;
                }
            }
        }
    }

    fn set_phase(&self, region: &str, phase: RegionPhase) {
        self.lock_phases().insert(region.to_string(), phase);
    }

    fn lock_phases(&self) -> MutexGuard<'_, HashMap<String, RegionPhase>> {
        self.phases.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use botshard_core::config::PoolsConfig;
    use botshard_core::ManualClock;
    use botshard_placement::{AssignRequest, AssignerSettings, PoolProvisioner};
    use std::collections::BTreeMap;

    struct Fixture {
        state: StateStore,
        clock: Arc<ManualClock>,
        assigner: Arc<ChannelAssigner>,
        scaler: ChannelScaler,
    }

    fn fixture(batch: u32) -> Fixture {
        let state = StateStore::open_in_memory().unwrap();
        let clock = ManualClock::new(10_000_000);
        let provisioner = Arc::new(PoolProvisioner::new(
            state.clone(),
            clock.clone(),
            PoolsConfig::default(),
        ));
        let assigner = Arc::new(ChannelAssigner::new(
            state.clone(),
            provisioner,
            clock.clone(),
            AssignerSettings {
                default_region: "us".to_string(),
                channel_max_agents: 30,
                headroom_ratio: 0.8,
                cache_ttl: Duration::from_secs(30),
            },
        ));
        let scaler = ChannelScaler::new(
            state.clone(),
            Arc::clone(&assigner),
            clock.clone(),
            ScalerSettings {
                regions: vec!["us".to_string(), "eu".to_string()],
                scale_up_threshold: 0.8,
                scale_down_threshold: 0.2,
                scale_up_batch: batch,
                cooldown: Duration::from_secs(300),
            },
        );
        Fixture {
            state,
            clock,
            assigner,
            scaler,
        }
    }

    fn channel(name: &str, kind: ChannelKind, current: u32) -> Channel {
        Channel {
            name: name.to_string(),
            kind,
            status: ChannelStatus::Active,
            region: "us".to_string(),
            current_agents: current,
            max_agents: 30,
            shard_id: format!("seed:{name}"),
            metadata: BTreeMap::new(),
            created_at: 1,
        }
    }

    fn decision_for(decisions: &[(String, ScaleDecision)], region: &str) -> ScaleDecision {
        decisions
            .iter()
            .find(|(r, _)| r == region)
            .map(|(_, d)| d.clone())
            .unwrap()
    }

    fn main_channels(state: &StateStore) -> Vec<Channel> {
        state
            .list_channels(&ChannelFilter {
                region: Some("us".to_string()),
                kind: Some(ChannelKind::Main),
                status: None,
            })
            .unwrap()
    }

    #[test]
    fn usage_ignores_inactive_channels() {
        let mut draining = channel("d", ChannelKind::Vip, 0);
        draining.status = ChannelStatus::Draining;
        let usage = region_usage(&[channel("m", ChannelKind::Main, 15), draining]).unwrap();
        assert_eq!(usage.current_agents, 15);
        assert_eq!(usage.max_agents, 30);
        assert_eq!(usage.utilization(), 0.5);
    }

    #[test]
    fn usage_picks_hottest_kind() {
        let usage = region_usage(&[
            channel("m", ChannelKind::Main, 10),
            channel("v", ChannelKind::Vip, 29),
        ])
        .unwrap();
        assert_eq!(usage.hottest_kind, ChannelKind::Vip);

        let tied = region_usage(&[
            channel("m", ChannelKind::Main, 10),
            channel("t", ChannelKind::Test, 10),
        ])
        .unwrap();
        assert_eq!(tied.hottest_kind, ChannelKind::Main);
    }

    #[test]
    fn empty_region_has_no_usage() {
        assert!(region_usage(&[]).is_none());
    }

    #[tokio::test]
    async fn eighty_percent_main_triggers_scale_up() {
        let f = fixture(10);
        f.state.put_channel(&channel("main-1", ChannelKind::Main, 24)).unwrap();

        let decisions = f.scaler.tick().await.unwrap();
        assert_eq!(
            decision_for(&decisions, "us"),
            ScaleDecision::ScaleUp {
                kind: ChannelKind::Main,
                created: 10
            }
        );

        let mains = main_channels(&f.state);
        assert_eq!(mains.len(), 11);
        assert!(mains.iter().all(|c| c.region == "us"));
        assert!(matches!(f.scaler.phase("us"), RegionPhase::Cooldown { .. }));
    }

    #[tokio::test]
    async fn cooldown_suppresses_repeat_scale_up() {
        let f = fixture(2);
        f.state.put_channel(&channel("main-1", ChannelKind::Main, 24)).unwrap();
        f.scaler.tick().await.unwrap();

        // Refill the new channels so utilization stays above threshold.
        for c in main_channels(&f.state) {
            if c.current_agents == 0 {
                f.state.adjust_channel_agents(&c.name, 24).unwrap();
            }
        }

        f.clock.advance(Duration::from_secs(60));
        let decisions = f.scaler.tick().await.unwrap();
        assert_eq!(decision_for(&decisions, "us"), ScaleDecision::NoChange);
        assert_eq!(main_channels(&f.state).len(), 3);

        f.clock.advance(Duration::from_secs(300));
        let decisions = f.scaler.tick().await.unwrap();
        assert!(matches!(
            decision_for(&decisions, "us"),
            ScaleDecision::ScaleUp { created: 2, .. }
        ));
        assert_eq!(main_channels(&f.state).len(), 5);
    }

    #[tokio::test]
    async fn low_utilization_drains_empty_non_main_channels() {
        let f = fixture(10);
        f.state.put_channel(&channel("main-1", ChannelKind::Main, 1)).unwrap();
        f.state.put_channel(&channel("main-empty", ChannelKind::Main, 0)).unwrap();
        f.state.put_channel(&channel("vip-empty", ChannelKind::Vip, 0)).unwrap();
        f.state.put_channel(&channel("test-empty", ChannelKind::Test, 0)).unwrap();
        f.state.put_channel(&channel("vip-busy", ChannelKind::Vip, 1)).unwrap();

        let decisions = f.scaler.tick().await.unwrap();
        assert_eq!(decision_for(&decisions, "us"), ScaleDecision::ScaleDown { drained: 2 });

        let status = |name: &str| f.state.get_channel(name).unwrap().unwrap().status;
        assert_eq!(status("vip-empty"), ChannelStatus::Draining);
        assert_eq!(status("test-empty"), ChannelStatus::Draining);
        assert_eq!(status("main-empty"), ChannelStatus::Active);
        assert_eq!(status("vip-busy"), ChannelStatus::Active);
    }

    #[tokio::test]
    async fn failing_region_does_not_stop_the_others() {
        let f = fixture(3);
        // eu is hot but has used up its pool allowance.
        let mut hot_eu = channel("main-eu", ChannelKind::Main, 24);
        hot_eu.region = "eu".to_string();
        f.state.put_channel(&hot_eu).unwrap();
        for i in 0..PoolsConfig::default().max_pools_per_region {
            f.state
                .put_pool(&Pool {
                    id: format!("pool-eu-{i}"),
                    region: "eu".to_string(),
                    total_shards: 334,
                    used_shards: 0,
                    status: PoolStatus::Draining,
                    endpoint: "127.0.0.1:7700".to_string(),
                    created_at: 1,
                })
                .unwrap();
        }
        f.state.put_channel(&channel("main-1", ChannelKind::Main, 24)).unwrap();

        let decisions = f.scaler.tick().await.unwrap();
        assert!(decisions.iter().all(|(r, _)| r != "eu"));
        assert_eq!(f.scaler.phase("eu"), RegionPhase::Normal);
        assert_eq!(
            decision_for(&decisions, "us"),
            ScaleDecision::ScaleUp {
                kind: ChannelKind::Main,
                created: 3
            }
        );
        assert_eq!(main_channels(&f.state).len(), 4);
    }

    #[tokio::test]
    async fn moderate_utilization_is_left_alone() {
        let f = fixture(10);
        f.state.put_channel(&channel("main-1", ChannelKind::Main, 15)).unwrap();

        let decisions = f.scaler.tick().await.unwrap();
        assert_eq!(decision_for(&decisions, "us"), ScaleDecision::NoChange);
        assert_eq!(f.scaler.phase("us"), RegionPhase::Normal);
    }

    #[tokio::test]
    async fn regions_without_capacity_are_skipped() {
        let f = fixture(10);
        let decisions = f.scaler.tick().await.unwrap();
        assert_eq!(decision_for(&decisions, "eu"), ScaleDecision::NoChange);
        assert_eq!(f.scaler.phase("eu"), RegionPhase::Normal);
    }

    #[tokio::test]
    async fn scale_action_invalidates_assignment_cache() {
        let f = fixture(1);
        f.state.put_channel(&channel("main-1", ChannelKind::Main, 5)).unwrap();
        assert_eq!(f.assigner.assign(&AssignRequest::main()).await.unwrap(), "main-1");

        f.state.adjust_channel_agents("main-1", 19).unwrap();
        f.scaler.tick().await.unwrap();

        // The cached choice is gone; the fresh channel from the scale-up is chosen.
        let next = f.assigner.assign(&AssignRequest::main()).await.unwrap();
        assert_ne!(next, "main-1");
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let f = fixture(1);
        let (tx, rx) = tokio::sync::watch::channel(false);
        let scaler = Arc::new(f.scaler);
        let handle = {
            let scaler = Arc::clone(&scaler);
            tokio::spawn(async move { scaler.run(Duration::from_millis(10), rx).await })
        };
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
