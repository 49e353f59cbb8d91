//! botshardd — assembly of the botshard control plane.
//!
//! The binary in `main.rs` parses flags and configuration, then hands
//! everything to [`services::Services`]. Integration tests drive the same
//! wiring in-process.

pub mod services;

pub use services::{build_engine, build_probe, watch_fleet_events, Services};
