//! botshard-inject — turns PENDING registrations into engine commands.
//!
//! ```text
//! inject_batch(channel, max)            (one writer per channel)
//!   1. claim up to `max` PENDING → PROCESSING, stamp processed_at
//!   2. read fresh EngineState for the channel's shard
//!   3. base = max(last_processed_seq + 1, next_seq, last_issued_seq + 1)
//!   4. submit base, base+1, … sharing one submitted_at
//!      store each command ref on its registration
//!   5. persist last_issued_seq, advance engine next_seq to base + count
//!   6. ensure the engine runs: start if stopped, kick if stalled
//! ```
//!
//! A command is never renumbered once written. A submission failure fails
//! the registrations that were not written; the tracker's stuck detection
//! covers commands that were written but never executed.

pub mod error;
pub mod pipeline;

pub use error::{InjectError, InjectResult};
pub use pipeline::{compute_base, EngineAction, InjectOutcome, InjectionPipeline, InjectionSettings};
