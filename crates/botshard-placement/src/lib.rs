//! botshard-placement — where agents and shards land.
//!
//! ```text
//! ChannelAssigner
//!   ├── TTL cache keyed by (region, agent type, kind)
//!   ├── candidate query: ACTIVE, kind, region, below headroom
//!   │     ordered by load ascending, newest first on ties
//!   ├── create path (per-(region, kind) lock) ──► PoolProvisioner
//!   └── fallback: the region's default MAIN channel
//!
//! PoolProvisioner
//!   ├── acquire_pool(region): ACTIVE pool below fill ratio, else a new pool
//!   └── allocate_shard(pool): transactional used_shards increment
//! ```

pub mod assigner;
pub mod error;
pub mod provisioner;

pub use assigner::{
    default_channel_name, select_candidate, AssignRequest, AssignerSettings, ChannelAssigner,
};
pub use error::{PlacementError, PlacementResult};
pub use provisioner::PoolProvisioner;
