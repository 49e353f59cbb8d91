//! Engine client error types.

use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine unreachable: {0}")]
    Transport(String),

    #[error("engine returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed engine response: {0}")]
    Decode(String),

    #[error("engine request timed out")]
    Timeout,

    #[error("sequence {seq} already written on shard {shard_id}")]
    SequenceTaken { shard_id: String, seq: u64 },

    #[error("invalid command reference: {0}")]
    InvalidRef(String),
}
