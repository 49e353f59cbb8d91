//! botshard-metrics — fleet observability.
//!
//! ```text
//! MetricsCollector (own timer)
//!   ├── collect() → FleetSnapshot
//!   │     channel counts by status, pool counts by status,
//!   │     utilization overall and per region, registration queue
//!   ├── MetricsSink::publish() for every configured sink
//!   └── keeps the latest snapshot for the API
//!
//! render_prometheus(snapshot) → text/plain for /metrics
//! ```
//!
//! Emission has no effect on scaling or placement; a failing sink is
//! logged and skipped.

pub mod collector;
pub mod prometheus;

pub use collector::{FleetSnapshot, LogSink, MetricsCollector, MetricsSink, RegionSnapshot};
pub use prometheus::render_prometheus;
