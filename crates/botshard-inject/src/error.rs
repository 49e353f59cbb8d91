use botshard_engine::EngineError;
use botshard_state::StateError;
use thiserror::Error;

pub type InjectResult<T> = Result<T, InjectError>;

#[derive(Debug, Error)]
pub enum InjectError {
    #[error("channel not found: {0}")]
    ChannelNotFound(String),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error(transparent)]
    State(#[from] StateError),
}
