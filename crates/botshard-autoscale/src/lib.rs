//! botshard-autoscale — utilization-driven channel scaling.
//!
//! Each tick computes, per region, the utilization of ACTIVE channels and
//! drives a two-state machine:
//!
//! ```text
//! utilization = Σ current_agents / Σ max_agents   (ACTIVE channels only)
//!
//! COOLDOWN(until) ── now >= until ──► NORMAL
//!
//! NORMAL, utilization >= scale_up_threshold:
//!     create scale_up_batch channels of the hottest kind
//!     COOLDOWN(now + cooldown)
//!
//! NORMAL, utilization <  scale_down_threshold:
//!     mark every empty non-MAIN ACTIVE channel DRAINING
//!     COOLDOWN(now + cooldown)
//! ```
//!
//! Regions are independent: an error in one region is logged and the tick
//! moves on to the next.

pub mod scaler;

pub use scaler::{
    region_usage, ChannelScaler, RegionPhase, RegionUsage, ScaleDecision, ScalerSettings,
};
