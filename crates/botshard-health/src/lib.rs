//! botshard-health — pool reachability checks.
//!
//! ```text
//! PoolHealthMonitor (own timer)
//!   ├── for each ACTIVE pool: PoolProbe::probe(endpoint) → ProbeResult
//!   ├── HealthTracker per pool (consecutive failures)
//!   └── at the unhealthy threshold:
//!         pool ACTIVE → DRAINING
//!         FleetEvent::PoolUnhealthy on the broadcast channel
//! ```
//!
//! Unhealthy pools are excluded from allocation but never deleted; their
//! shards and records stay in place for investigation.

pub mod checker;
pub mod monitor;

pub use checker::{http_probe, HealthTracker, HttpProbe, PoolHealth, PoolProbe, ProbeResult};
pub use monitor::{FleetEvent, PoolHealthMonitor};
