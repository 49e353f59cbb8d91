//! Wire types shared by every engine implementation.

use serde::{Deserialize, Serialize};

/// Opaque reference to a written command, `{shard_id}@{seq}`.
pub type CommandRef = String;

/// Build the reference for a command.
pub fn command_ref(shard_id: &str, seq: u64) -> CommandRef {
    format!("{shard_id}@{seq}")
}

/// Split a command reference back into `(shard_id, seq)`.
pub fn parse_command_ref(command_ref: &str) -> Option<(&str, u64)> {
    let (shard, seq) = command_ref.rsplit_once('@')?;
    if shard.is_empty() {
        return None;
    }
    Some((shard, seq.parse().ok()?))
}

/// A command to append to a shard's log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommandSubmission {
    pub shard_id: String,
    pub seq: u64,
    pub name: String,
    pub args: serde_json::Value,
    /// Shared by every command of one batch (Unix ms).
    pub submitted_at: u64,
}

/// Outcome the engine recorded for a command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CommandResult {
    Ok { value: serde_json::Value },
    Error { message: String },
}

/// Execution state of one shard.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EngineState {
    /// The engine's own next free sequence slot.
    pub next_seq: u64,
    /// Highest sequence number already executed.
    pub last_processed_seq: u64,
    pub running: bool,
    /// Unix ms of the last executed command, if any.
    pub last_progress_at: Option<u64>,
}
