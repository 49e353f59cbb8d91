//! Pool provisioner — backing deployments with fixed shard capacity.
//!
//! A pool is one simulation-engine deployment able to host
//! `shards_per_pool` shards. Pools are created lazily when no ACTIVE pool
//! in the region is below its fill ratio, and are never deleted.

use botshard_core::config::PoolsConfig;
use botshard_core::{Clock, SharedClock};
use botshard_state::*;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{PlacementError, PlacementResult};

/// Creates pools and hands out shard slots.
pub struct PoolProvisioner {
    state: StateStore,
    clock: SharedClock,
    config: PoolsConfig,
    /// Serializes pool creation so a burst does not provision duplicates.
    provision_lock: Mutex<()>,
}

impl PoolProvisioner {
    pub fn new(state: StateStore, clock: SharedClock, config: PoolsConfig) -> Self {
        Self {
            state,
            clock,
            config,
            provision_lock: Mutex::new(()),
        }
    }

    /// Return an ACTIVE pool in `region` with spare capacity, provisioning
    /// a new one if none exists.
    pub async fn acquire_pool(&self, region: &str) -> PlacementResult<Pool> {
        if let Some(pool) = self.find_spare_pool(region)? {
            return Ok(pool);
        }

        let _guard = self.provision_lock.lock().await;
        // Another caller may have provisioned while we waited.
        if let Some(pool) = self.find_spare_pool(region)? {
            return Ok(pool);
        }
        self.provision(region)
    }

    /// Take the next shard of `pool`. Returns `{pool_id}:{index}`.
    pub fn allocate_shard(&self, pool: &Pool) -> PlacementResult<String> {
        let (updated, index) = self.state.allocate_shard(&pool.id)?;
        debug!(
            pool = %updated.id,
            index,
            used = updated.used_shards,
            total = updated.total_shards,
            "shard allocated"
        );
        Ok(format!("{}:{index}", updated.id))
    }

    /// Acquire a pool and allocate a shard on it, retrying once if the
    /// chosen pool filled up between the two steps.
    pub async fn allocate_in_region(&self, region: &str) -> PlacementResult<(Pool, String)> {
        let pool = self.acquire_pool(region).await?;
        match self.allocate_shard(&pool) {
            Ok(shard_id) => Ok((pool, shard_id)),
            Err(PlacementError::State(StateError::CapacityExceeded(_)))
            | Err(PlacementError::State(StateError::InvalidTransition(_))) => {
                warn!(pool = %pool.id, %region, "pool filled during allocation, retrying");
                let pool = self.acquire_pool(region).await?;
                let shard_id = self.allocate_shard(&pool)?;
                Ok((pool, shard_id))
            }
            Err(e) => Err(e),
        }
    }

    pub fn list_pools(&self, region: Option<&str>) -> PlacementResult<Vec<Pool>> {
        Ok(self.state.list_pools(region)?)
    }

    /// Exclude a pool from future allocation. Existing shards keep running.
    pub fn mark_draining(&self, pool_id: &str) -> PlacementResult<Pool> {
        let pool = self.state.set_pool_status(pool_id, PoolStatus::Draining)?;
        info!(pool = %pool_id, region = %pool.region, "pool marked draining");
        Ok(pool)
    }

    fn find_spare_pool(&self, region: &str) -> PlacementResult<Option<Pool>> {
        let mut pools: Vec<Pool> = self
            .state
            .list_pools(Some(region))?
            .into_iter()
            .filter(|p| {
                p.status == PoolStatus::Active && p.has_spare_capacity(self.config.fill_ratio)
            })
            .collect();
        // Fill the fullest pool first so fresh pools stay empty as long as possible.
        pools.sort_by(|a, b| {
            b.used_shards
                .cmp(&a.used_shards)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        Ok(pools.into_iter().next())
    }

    fn provision(&self, region: &str) -> PlacementResult<Pool> {
        let existing = self.state.list_pools(Some(region))?.len() as u32;
        if existing >= self.config.max_pools_per_region {
            warn!(%region, existing, "pool limit reached, cannot provision");
            return Err(PlacementError::PoolLimitReached {
                region: region.to_string(),
                limit: self.config.max_pools_per_region,
            });
        }

        let short = uuid::Uuid::new_v4().simple().to_string();
        let id = format!("pool-{region}-{}", &short[..8]);
        let endpoint = self
            .config
            .endpoint_template
            .replace("{region}", region)
            .replace("{pool}", &id);

        let pool = Pool {
            id,
            region: region.to_string(),
            total_shards: self.config.shards_per_pool,
            used_shards: 0,
            status: PoolStatus::Active,
            endpoint,
            created_at: self.clock.now_millis(),
        };
        self.state.put_pool(&pool)?;
        info!(
            pool = %pool.id,
            %region,
            shards = pool.total_shards,
            endpoint = %pool.endpoint,
            "pool provisioned"
        );
        Ok(pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use botshard_core::ManualClock;
    use std::sync::Arc;

    fn test_config(shards: u32, max_pools: u32) -> PoolsConfig {
        PoolsConfig {
            shards_per_pool: shards,
            fill_ratio: 0.9,
            endpoint_template: "engine-{region}.internal:7700/{pool}".to_string(),
            max_pools_per_region: max_pools,
        }
    }

    fn provisioner(shards: u32, max_pools: u32) -> PoolProvisioner {
        PoolProvisioner::new(
            StateStore::open_in_memory().unwrap(),
            ManualClock::new(1_000),
            test_config(shards, max_pools),
        )
    }

    #[tokio::test]
    async fn provisions_first_pool_on_demand() {
        let prov = provisioner(334, 4);
        let pool = prov.acquire_pool("us").await.unwrap();

        assert_eq!(pool.region, "us");
        assert_eq!(pool.total_shards, 334);
        assert_eq!(pool.used_shards, 0);
        assert_eq!(pool.status, PoolStatus::Active);
        assert!(pool.endpoint.starts_with("engine-us.internal:7700/pool-us-"));
        assert_eq!(prov.list_pools(Some("us")).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reuses_pool_below_fill_ratio() {
        let prov = provisioner(10, 4);
        let first = prov.acquire_pool("us").await.unwrap();
        for _ in 0..8 {
            prov.allocate_shard(&first).unwrap();
        }
        // 8/10 < 90%: same pool.
        assert_eq!(prov.acquire_pool("us").await.unwrap().id, first.id);

        prov.allocate_shard(&first).unwrap();
        // 9/10 is at the fill ratio: a new pool is provisioned.
        let second = prov.acquire_pool("us").await.unwrap();
        assert_ne!(second.id, first.id);
    }

    #[tokio::test]
    async fn draining_pools_are_skipped() {
        let prov = provisioner(10, 4);
        let first = prov.acquire_pool("us").await.unwrap();
        prov.mark_draining(&first.id).unwrap();

        let next = prov.acquire_pool("us").await.unwrap();
        assert_ne!(next.id, first.id);
        assert!(prov.allocate_shard(&first).is_err());
    }

    #[tokio::test]
    async fn shard_ids_are_unique_and_counted() {
        let prov = provisioner(10, 4);
        let pool = prov.acquire_pool("us").await.unwrap();

        let a = prov.allocate_shard(&pool).unwrap();
        let b = prov.allocate_shard(&pool).unwrap();
        assert_eq!(a, format!("{}:0", pool.id));
        assert_eq!(b, format!("{}:1", pool.id));

        let stored = prov.list_pools(Some("us")).unwrap();
        assert_eq!(stored[0].used_shards, 2);
    }

    #[tokio::test]
    async fn pool_limit_surfaces_as_error() {
        let prov = provisioner(1, 1);
        let (pool, _) = prov.allocate_in_region("us").await.unwrap();
        assert_eq!(pool.used_shards, 0);

        let err = prov.allocate_in_region("us").await.unwrap_err();
        assert!(matches!(err, PlacementError::PoolLimitReached { limit: 1, .. }));
    }

    #[tokio::test]
    async fn concurrent_acquire_provisions_one_pool() {
        let prov = Arc::new(provisioner(334, 8));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let prov = Arc::clone(&prov);
                tokio::spawn(async move { prov.acquire_pool("eu").await.unwrap().id })
            })
            .collect();

        let mut ids = Vec::new();
        for h in handles {
            ids.push(h.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(prov.list_pools(Some("eu")).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn regions_are_independent() {
        let prov = provisioner(10, 1);
        prov.acquire_pool("us").await.unwrap();
        prov.acquire_pool("eu").await.unwrap();
        assert_eq!(prov.list_pools(None).unwrap().len(), 2);
    }
}
