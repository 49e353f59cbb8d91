//! botshard-state — embedded state store for botshard.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for channels, pools, registrations, and per-channel sequence
//! cursors.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Every mutation that must be atomic with respect to concurrent callers
//! (shard allocation, agent counters, batch claims, status transitions)
//! re-reads the row inside a single write transaction, so redb's
//! single-writer discipline gives per-row compare-and-set semantics.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
