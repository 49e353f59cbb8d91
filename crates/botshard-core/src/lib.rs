//! botshard-core — configuration and time sources shared by every
//! botshard subsystem.

pub mod clock;
pub mod config;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{duration_or, parse_duration, BotshardConfig};
