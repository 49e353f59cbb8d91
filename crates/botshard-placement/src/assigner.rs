//! Channel assignment — picks the channel a new agent should join.
//!
//! Candidates are ACTIVE channels of the requested kind in the requested
//! region that are below `max_agents * headroom`. The least-loaded channel
//! wins; ties go to the most recently created channel. That tie-break is
//! carried over as-is and may be arbitrary rather than a load-balancing
//! policy.
//!
//! When nothing qualifies a channel is created synchronously; when creation
//! fails the region's default MAIN channel is used. Choices are cached per
//! `(region, agent type, kind)` for a short TTL to absorb bursts.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use botshard_core::{Clock, SharedClock};
use botshard_state::*;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{PlacementError, PlacementResult};
use crate::provisioner::PoolProvisioner;

/// Metadata key marking a region's default channel.
pub const DEFAULT_CHANNEL_KEY: &str = "default";

/// Metadata key recording the agent type a channel was created for.
pub const AGENT_TYPE_KEY: &str = "agent_type";

/// Parameters of one assignment request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AssignRequest {
    pub region: Option<String>,
    pub agent_type: Option<String>,
    pub kind: ChannelKind,
}

impl AssignRequest {
    pub fn main() -> Self {
        Self {
            region: None,
            agent_type: None,
            kind: ChannelKind::Main,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    region: String,
    agent_type: Option<String>,
    kind: ChannelKind,
}

#[derive(Debug, Clone)]
struct CachedChoice {
    channel: String,
    expires_at: u64,
}

/// Settings for [`ChannelAssigner`].
#[derive(Debug, Clone)]
pub struct AssignerSettings {
    pub default_region: String,
    pub channel_max_agents: u32,
    pub headroom_ratio: f64,
    pub cache_ttl: Duration,
}

/// Picks or creates channels for new agents.
pub struct ChannelAssigner {
    state: StateStore,
    provisioner: Arc<PoolProvisioner>,
    clock: SharedClock,
    settings: AssignerSettings,
    cache: RwLock<HashMap<CacheKey, CachedChoice>>,
    /// One creation lock per (region, kind).
    creation_locks: Mutex<HashMap<(String, ChannelKind), Arc<Mutex<()>>>>,
}

impl ChannelAssigner {
    pub fn new(
        state: StateStore,
        provisioner: Arc<PoolProvisioner>,
        clock: SharedClock,
        settings: AssignerSettings,
    ) -> Self {
        Self {
            state,
            provisioner,
            clock,
            settings,
            cache: RwLock::new(HashMap::new()),
            creation_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Return the name of the channel the agent should join.
    pub async fn assign(&self, req: &AssignRequest) -> PlacementResult<String> {
        let region = req
            .region
            .clone()
            .unwrap_or_else(|| self.settings.default_region.clone());
        let key = CacheKey {
            region: region.clone(),
            agent_type: req.agent_type.clone(),
            kind: req.kind,
        };

        let now = self.clock.now_millis();
        if let Some(hit) = self.cache.read().await.get(&key) {
            if hit.expires_at > now {
                debug!(%region, channel = %hit.channel, "assignment cache hit");
                return Ok(hit.channel.clone());
            }
        }

        let channel = match self.find_candidate(&region, req.kind)? {
            Some(channel) => channel.name,
            None => self.create_or_fallback(&region, req).await?,
        };

        let ttl = self.settings.cache_ttl.as_millis() as u64;
        self.cache.write().await.insert(
            key,
            CachedChoice {
                channel: channel.clone(),
                expires_at: self.clock.now_millis() + ttl,
            },
        );
        Ok(channel)
    }

    /// Create `count` channels of `kind` in `region`.
    ///
    /// Stops at the first provisioning failure. Returns what was created,
    /// or the error if nothing could be created.
    pub async fn create_channels(
        &self,
        region: &str,
        kind: ChannelKind,
        count: u32,
        agent_type: Option<&str>,
    ) -> PlacementResult<Vec<Channel>> {
        let mut created = Vec::new();
        for _ in 0..count {
            match self.create_channel(region, kind, agent_type).await {
                Ok(channel) => created.push(channel),
                Err(e) if created.is_empty() => return Err(e),
                Err(e) => {
                    warn!(
                        %region,
                        %kind,
                        requested = count,
                        created = created.len(),
                        error = %e,
                        "channel creation stopped early"
                    );
                    break;
                }
            }
        }
        info!(%region, %kind, count = created.len(), "channels created");
        Ok(created)
    }

    /// Make sure every region has its default MAIN channel.
    ///
    /// Returns the names of channels created by this call.
    pub async fn ensure_default_channels(
        &self,
        regions: &[String],
    ) -> PlacementResult<Vec<String>> {
        let mut created = Vec::new();
        for region in regions {
            let name = default_channel_name(region);
            let lock = self.creation_lock(region, ChannelKind::Main).await;
            let _guard = lock.lock().await;
            if self.state.get_channel(&name)?.is_some() {
                continue;
            }
            let (_, shard_id) = self.provisioner.allocate_in_region(region).await?;
            let mut metadata = BTreeMap::new();
            metadata.insert(DEFAULT_CHANNEL_KEY.to_string(), "true".to_string());
            let channel = Channel {
                name: name.clone(),
                kind: ChannelKind::Main,
                status: ChannelStatus::Active,
                region: region.clone(),
                current_agents: 0,
                max_agents: self.settings.channel_max_agents,
                shard_id,
                metadata,
                created_at: self.clock.now_millis(),
            };
            if self.state.insert_channel_if_absent(&channel)? {
                info!(%region, channel = %name, "default channel created");
                created.push(name);
            }
        }
        Ok(created)
    }

    /// Drop every cached choice for a region.
    pub async fn invalidate_region(&self, region: &str) {
        self.cache.write().await.retain(|k, _| k.region != region);
    }

    fn find_candidate(&self, region: &str, kind: ChannelKind) -> PlacementResult<Option<Channel>> {
        let filter = ChannelFilter {
            region: Some(region.to_string()),
            kind: Some(kind),
            status: Some(ChannelStatus::Active),
        };
        let channels = self.state.list_channels(&filter)?;
        Ok(select_candidate(channels, self.settings.headroom_ratio))
    }

    async fn create_or_fallback(
        &self,
        region: &str,
        req: &AssignRequest,
    ) -> PlacementResult<String> {
        let lock = self.creation_lock(region, req.kind).await;
        let _guard = lock.lock().await;

        // A concurrent request may have created a channel while we waited.
        if let Some(channel) = self.find_candidate(region, req.kind)? {
            return Ok(channel.name);
        }

        match self
            .create_channel(region, req.kind, req.agent_type.as_deref())
            .await
        {
            Ok(channel) => Ok(channel.name),
            Err(e) => {
                warn!(
                    %region,
                    kind = %req.kind,
                    error = %e,
                    "channel creation failed, trying default channel"
                );
                let name = default_channel_name(region);
                match self.state.get_channel(&name)? {
                    Some(channel)
                        if channel.status == ChannelStatus::Active && !channel.is_full() =>
                    {
                        Ok(channel.name)
                    }
                    _ => Err(PlacementError::CapacityExhausted(region.to_string())),
                }
            }
        }
    }

    async fn create_channel(
        &self,
        region: &str,
        kind: ChannelKind,
        agent_type: Option<&str>,
    ) -> PlacementResult<Channel> {
        let (pool, shard_id) = self.provisioner.allocate_in_region(region).await?;
        let mut metadata = BTreeMap::new();
        metadata.insert("pool".to_string(), pool.id.clone());
        if let Some(agent_type) = agent_type {
            metadata.insert(AGENT_TYPE_KEY.to_string(), agent_type.to_string());
        }

        let channel = Channel {
            name: format!("{kind}-{}", shard_id.replace(':', "-")),
            kind,
            status: ChannelStatus::Active,
            region: region.to_string(),
            current_agents: 0,
            max_agents: self.settings.channel_max_agents,
            shard_id,
            metadata,
            created_at: self.clock.now_millis(),
        };
        self.state.put_channel(&channel)?;
        debug!(channel = %channel.name, %region, %kind, "channel created");
        Ok(channel)
    }

    async fn creation_lock(&self, region: &str, kind: ChannelKind) -> Arc<Mutex<()>> {
        let mut locks = self.creation_locks.lock().await;
        Arc::clone(
            locks
                .entry((region.to_string(), kind))
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }
}

/// Name of a region's always-present MAIN channel.
pub fn default_channel_name(region: &str) -> String {
    format!("main-{region}-default")
}

/// Pick the least-loaded channel with headroom, newest first on ties.
pub fn select_candidate(channels: Vec<Channel>, headroom: f64) -> Option<Channel> {
    channels
        .into_iter()
        .filter(|c| c.has_headroom(headroom))
        .min_by(|a, b| {
            a.current_agents
                .cmp(&b.current_agents)
                .then_with(|| b.created_at.cmp(&a.created_at))
                .then_with(|| a.name.cmp(&b.name))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use botshard_core::config::PoolsConfig;
    use botshard_core::ManualClock;

    struct Fixture {
        state: StateStore,
        clock: Arc<ManualClock>,
        assigner: Arc<ChannelAssigner>,
    }

    fn fixture(max_pools: u32) -> Fixture {
        let state = StateStore::open_in_memory().unwrap();
        let clock = ManualClock::new(1_000_000);
        let provisioner = Arc::new(PoolProvisioner::new(
            state.clone(),
            clock.clone(),
            PoolsConfig {
                shards_per_pool: 334,
                fill_ratio: 0.9,
                endpoint_template: "127.0.0.1:7700".to_string(),
                max_pools_per_region: max_pools,
            },
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
        Fixture {
            state,
            clock,
            assigner,
        }
    }

    fn channel(name: &str, current: u32, created_at: u64) -> Channel {
        Channel {
            name: name.to_string(),
            kind: ChannelKind::Main,
            status: ChannelStatus::Active,
            region: "us".to_string(),
            current_agents: current,
            max_agents: 30,
            shard_id: format!("p:{name}"),
            metadata: BTreeMap::new(),
            created_at,
        }
    }

    #[test]
    fn select_prefers_least_loaded() {
        let picked = select_candidate(
            vec![channel("a", 10, 1), channel("b", 3, 1), channel("c", 7, 1)],
            0.8,
        );
        assert_eq!(picked.unwrap().name, "b");
    }

    #[test]
    fn select_breaks_ties_by_newest() {
        let picked = select_candidate(
            vec![channel("old", 2, 100), channel("new", 2, 200)],
            0.8,
        );
        assert_eq!(picked.unwrap().name, "new");
    }

    #[test]
    fn select_skips_channels_at_headroom() {
        assert!(select_candidate(vec![channel("full", 24, 1)], 0.8).is_none());
    }

    #[tokio::test]
    async fn assign_returns_existing_candidate() {
        let f = fixture(4);
        f.state.put_channel(&channel("busy", 20, 1)).unwrap();
        f.state.put_channel(&channel("quiet", 2, 1)).unwrap();
        let mut vip = channel("vip", 0, 1);
        vip.kind = ChannelKind::Vip;
        f.state.put_channel(&vip).unwrap();

        let name = f.assigner.assign(&AssignRequest::main()).await.unwrap();
        assert_eq!(name, "quiet");
    }

    #[tokio::test]
    async fn assign_creates_channel_when_none_qualifies() {
        let f = fixture(4);
        f.state.put_channel(&channel("full", 24, 1)).unwrap();

        let name = f.assigner.assign(&AssignRequest::main()).await.unwrap();
        assert_ne!(name, "full");

        let created = f.state.get_channel(&name).unwrap().unwrap();
        assert_eq!(created.kind, ChannelKind::Main);
        assert_eq!(created.region, "us");
        assert_eq!(created.max_agents, 30);
        assert_eq!(created.status, ChannelStatus::Active);
    }

    #[tokio::test]
    async fn assign_caches_until_ttl_expires() {
        let f = fixture(4);
        f.state.put_channel(&channel("a", 5, 1)).unwrap();
        assert_eq!(f.assigner.assign(&AssignRequest::main()).await.unwrap(), "a");

        // A better channel appears, but the cached choice still wins.
        f.state.put_channel(&channel("b", 0, 2)).unwrap();
        assert_eq!(f.assigner.assign(&AssignRequest::main()).await.unwrap(), "a");

        f.clock.advance(Duration::from_secs(31));
        assert_eq!(f.assigner.assign(&AssignRequest::main()).await.unwrap(), "b");
    }

    #[tokio::test]
    async fn invalidate_region_drops_cached_choice() {
        let f = fixture(4);
        f.state.put_channel(&channel("a", 5, 1)).unwrap();
        f.assigner.assign(&AssignRequest::main()).await.unwrap();

        f.state.put_channel(&channel("b", 0, 2)).unwrap();
        f.assigner.invalidate_region("us").await;
        assert_eq!(f.assigner.assign(&AssignRequest::main()).await.unwrap(), "b");
    }

    #[tokio::test]
    async fn falls_back_to_default_channel_when_creation_fails() {
        let f = fixture(1);
        f.assigner
            .ensure_default_channels(&["us".to_string()])
            .await
            .unwrap();
        // Fill the default channel past headroom and exhaust the only pool.
        f.state
            .adjust_channel_agents(&default_channel_name("us"), 25)
            .unwrap();
        let pool = f.state.list_pools(Some("us")).unwrap().remove(0);
        f.state
            .set_pool_status(&pool.id, PoolStatus::Draining)
            .unwrap();

        let name = f.assigner.assign(&AssignRequest::main()).await.unwrap();
        assert_eq!(name, "main-us-default");
    }

    #[tokio::test]
    async fn full_default_channel_is_not_a_fallback() {
        let f = fixture(1);
        f.assigner
            .ensure_default_channels(&["us".to_string()])
            .await
            .unwrap();
        f.state
            .adjust_channel_agents(&default_channel_name("us"), 30)
            .unwrap();
        let pool = f.state.list_pools(Some("us")).unwrap().remove(0);
        f.state
            .set_pool_status(&pool.id, PoolStatus::Draining)
            .unwrap();

        let err = f.assigner.assign(&AssignRequest::main()).await.unwrap_err();
        assert!(matches!(err, PlacementError::CapacityExhausted(r) if r == "us"));
    }

    #[tokio::test]
    async fn concurrent_bootstraps_allocate_one_shard() {
        let f = fixture(4);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let assigner = Arc::clone(&f.assigner);
                tokio::spawn(async move {
                    assigner
                        .ensure_default_channels(&["us".to_string()])
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut created = 0;
        for h in handles {
            created += h.await.unwrap().len();
        }
        assert_eq!(created, 1);
        let used: u32 = f
            .state
            .list_pools(Some("us"))
            .unwrap()
            .iter()
            .map(|p| p.used_shards)
            .sum();
        assert_eq!(used, 1);
    }

    #[tokio::test]
    async fn capacity_error_when_no_fallback_exists() {
        let f = fixture(0);
        let err = f
            .assigner
            .assign(&AssignRequest {
                region: Some("eu".to_string()),
                agent_type: None,
                kind: ChannelKind::Vip,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PlacementError::CapacityExhausted(r) if r == "eu"));
    }

    #[tokio::test]
    async fn concurrent_assignments_create_one_channel() {
        let f = fixture(4);
        let handles: Vec<_> = (0..20)
            .map(|i| {
                let assigner = Arc::clone(&f.assigner);
                tokio::spawn(async move {
                    // Distinct agent types defeat the cache so every request queries.
                    assigner
                        .assign(&AssignRequest {
                            region: Some("us".to_string()),
                            agent_type: Some(format!("type-{i}")),
                            kind: ChannelKind::Main,
                        })
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut names = Vec::new();
        for h in handles {
            names.push(h.await.unwrap());
        }
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 1);
        assert_eq!(f.state.list_channels(&ChannelFilter::default()).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn create_channels_records_agent_type() {
        let f = fixture(4);
        let created = f
            .assigner
            .create_channels("us", ChannelKind::Vip, 3, Some("poker"))
            .await
            .unwrap();
        assert_eq!(created.len(), 3);
        for c in &created {
            assert_eq!(c.kind, ChannelKind::Vip);
            assert!(c.name.starts_with("vip-pool-us-"));
            assert_eq!(c.metadata.get(AGENT_TYPE_KEY).map(String::as_str), Some("poker"));
        }
    }

    #[tokio::test]
    async fn ensure_default_channels_is_idempotent() {
        let f = fixture(4);
        let regions = vec!["us".to_string(), "eu".to_string()];
        let created = f.assigner.ensure_default_channels(&regions).await.unwrap();
        assert_eq!(created.len(), 2);

        let again = f.assigner.ensure_default_channels(&regions).await.unwrap();
        assert!(again.is_empty());

        let eu = f.state.get_channel("main-eu-default").unwrap().unwrap();
        assert_eq!(eu.kind, ChannelKind::Main);
        assert_eq!(eu.metadata.get(DEFAULT_CHANNEL_KEY).map(String::as_str), Some("true"));
    }
}
