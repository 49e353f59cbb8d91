//! botshard-engine — the boundary to the simulation engine.
//!
//! The engine is an opaque, single-threaded executor per shard. It consumes
//! commands strictly in increasing sequence order and publishes a result
//! per command asynchronously. botshard reaches it only through the
//! [`SimulationEngine`] trait:
//!
//! ```text
//! SimulationEngine
//!   ├── submit_command(shard, seq, name, args, submitted_at) → command ref
//!   ├── command_result(command ref) → Option<CommandResult>
//!   ├── engine_state(shard) → { next_seq, last_processed_seq, running, last_progress_at }
//!   ├── advance_next_seq(shard, next)
//!   ├── start(shard)
//!   └── kick(shard, max_duration_ms)
//! ```
//!
//! Two implementations ship here: [`HttpEngine`] for a remote engine
//! speaking JSON over HTTP/1.1, and [`MemoryEngine`], an in-process engine
//! with the same ordering semantics used by tests and local runs.

pub mod error;
pub mod http_engine;
pub mod memory;
pub mod types;

pub use error::{EngineError, EngineResult};
pub use http_engine::HttpEngine;
pub use memory::{CommandHandler, MemoryEngine, StoredCommand};
pub use types::*;

use async_trait::async_trait;

/// Client interface to the simulation engine.
#[async_trait]
pub trait SimulationEngine: Send + Sync {
    /// Append a command to a shard's log. Returns the command reference.
    async fn submit_command(&self, command: CommandSubmission) -> EngineResult<CommandRef>;

    /// Result of a command, or `None` while it has not been executed.
    async fn command_result(&self, command_ref: &str) -> EngineResult<Option<CommandResult>>;

    /// Current execution state of a shard.
    async fn engine_state(&self, shard_id: &str) -> EngineResult<EngineState>;

    /// Raise the shard's next-sequence counter. Never lowers it.
    async fn advance_next_seq(&self, shard_id: &str, next_seq: u64) -> EngineResult<()>;

    /// Start executing a shard's command log.
    async fn start(&self, shard_id: &str) -> EngineResult<()>;

    /// Resume a stalled shard for at most `max_duration_ms`.
    async fn kick(&self, shard_id: &str, max_duration_ms: u64) -> EngineResult<()>;
}
