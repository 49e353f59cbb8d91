use botshard_engine::EngineError;
use botshard_state::StateError;
use thiserror::Error;

pub type TrackerResult<T> = Result<T, TrackerError>;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("registration not found: {0}")]
    RegistrationNotFound(String),

    #[error("channel not found: {0}")]
    ChannelNotFound(String),

    #[error("channel {channel} is not accepting agents: {reason}")]
    ChannelUnavailable { channel: String, reason: String },

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error(transparent)]
    State(#[from] StateError),
}
