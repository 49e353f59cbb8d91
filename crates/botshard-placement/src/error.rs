//! Placement error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlacementError {
    #[error("no channel capacity available in region {0}")]
    CapacityExhausted(String),

    #[error("region {region} already has {limit} pools")]
    PoolLimitReached { region: String, limit: u32 },

    #[error("state store error: {0}")]
    State(#[from] botshard_state::StateError),
}

pub type PlacementResult<T> = Result<T, PlacementError>;
