//! In-process simulation engine.
//!
//! Mirrors the ordering contract of the real engine: commands execute in
//! increasing sequence order, and a command written at or below
//! `last_processed_seq` is accepted but never executed, so it never
//! produces a result. Used by tests and by `botshardd --engine memory`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use botshard_core::{Clock, SharedClock, SystemClock};
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::types::*;
use crate::SimulationEngine;

/// Produces the result for an executed command.
pub type CommandHandler = Arc<dyn Fn(&StoredCommand) -> CommandResult + Send + Sync>;

/// A command as held in a shard log.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredCommand {
    pub shard_id: String,
    pub seq: u64,
    pub name: String,
    pub args: serde_json::Value,
    pub submitted_at: u64,
    pub result: Option<CommandResult>,
    /// Written behind the execution cursor; the engine will never run it.
    pub ignored: bool,
}

#[derive(Debug, Default)]
struct ShardLog {
    commands: BTreeMap<u64, StoredCommand>,
    state: EngineState,
}

#[derive(Default)]
struct Calls {
    starts: Vec<String>,
    kicks: Vec<(String, u64)>,
}

/// In-memory engine with one command log per shard.
pub struct MemoryEngine {
    shards: Mutex<HashMap<String, ShardLog>>,
    calls: Mutex<Calls>,
    handler: CommandHandler,
    clock: SharedClock,
    /// Execute pending commands as soon as the shard is started or kicked.
    auto_run: bool,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self {
            shards: Mutex::new(HashMap::new()),
            calls: Mutex::new(Calls::default()),
            handler: Arc::new(default_handler),
            clock: SystemClock::shared(),
            auto_run: true,
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_handler(mut self, handler: CommandHandler) -> Self {
        self.handler = handler;
        self
    }

    /// Only execute commands when [`MemoryEngine::run_pending`] is called.
    pub fn manual(mut self) -> Self {
        self.auto_run = false;
        self
    }

    /// Overwrite a shard's execution state.
    pub fn set_state(&self, shard_id: &str, state: EngineState) {
        self.lock_shards()
            .entry(shard_id.to_string())
            .or_default()
            .state = state;
    }

    /// Execute every runnable command of a shard in sequence order.
    ///
    /// Returns the number of commands executed.
    pub fn run_pending(&self, shard_id: &str) -> usize {
        let now = self.clock.now_millis();
        let mut shards = self.lock_shards();
        let Some(log) = shards.get_mut(shard_id) else {
            return 0;
        };

        let mut executed = 0;
        let cursor = log.state.last_processed_seq;
        for (seq, cmd) in log.commands.range_mut(cursor + 1..) {
            if cmd.ignored || cmd.result.is_some() {
                continue;
            }
            cmd.result = Some((self.handler)(cmd));
            log.state.last_processed_seq = *seq;
            log.state.last_progress_at = Some(now);
            executed += 1;
        }
        if log.state.next_seq <= log.state.last_processed_seq {
            log.state.next_seq = log.state.last_processed_seq + 1;
        }
        debug!(%shard_id, executed, "memory engine ran pending commands");
        executed
    }

    /// Snapshot of a shard's log in sequence order.
    pub fn commands(&self, shard_id: &str) -> Vec<StoredCommand> {
        self.lock_shards()
            .get(shard_id)
            .map(|log| log.commands.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Shards that received a `start` call, in call order.
    pub fn starts(&self) -> Vec<String> {
        self.lock_calls().starts.clone()
    }

    /// `(shard, max_duration_ms)` of every `kick` call, in call order.
    pub fn kicks(&self) -> Vec<(String, u64)> {
        self.lock_calls().kicks.clone()
    }

    fn lock_shards(&self) -> MutexGuard<'_, HashMap<String, ShardLog>> {
        self.shards.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_calls(&self) -> MutexGuard<'_, Calls> {
        self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SimulationEngine for MemoryEngine {
    async fn submit_command(&self, command: CommandSubmission) -> EngineResult<CommandRef> {
        let mut shards = self.lock_shards();
        let log = shards.entry(command.shard_id.clone()).or_default();

        if log.commands.contains_key(&command.seq) {
            return Err(EngineError::SequenceTaken {
                shard_id: command.shard_id,
                seq: command.seq,
            });
        }

        let ignored = command.seq <= log.state.last_processed_seq;
        if ignored {
            debug!(
                shard_id = %command.shard_id,
                seq = command.seq,
                last_processed = log.state.last_processed_seq,
                "command behind execution cursor, it will never run"
            );
        }

        let reference = command_ref(&command.shard_id, command.seq);
        log.commands.insert(
            command.seq,
            StoredCommand {
                shard_id: command.shard_id,
                seq: command.seq,
                name: command.name,
                args: command.args,
                submitted_at: command.submitted_at,
                result: None,
                ignored,
            },
        );
        Ok(reference)
    }

    async fn command_result(&self, reference: &str) -> EngineResult<Option<CommandResult>> {
        let (shard_id, seq) =
            parse_command_ref(reference)
                .ok_or_else(|| EngineError::InvalidRef(reference.to_string()))?;
        Ok(self
            .lock_shards()
            .get(shard_id)
            .and_then(|log| log.commands.get(&seq))
            .and_then(|cmd| cmd.result.clone()))
    }

    async fn engine_state(&self, shard_id: &str) -> EngineResult<EngineState> {
        Ok(self
            .lock_shards()
            .get(shard_id)
            .map(|log| log.state.clone())
            .unwrap_or_default())
    }

    async fn advance_next_seq(&self, shard_id: &str, next_seq: u64) -> EngineResult<()> {
        let mut shards = self.lock_shards();
        let log = shards.entry(shard_id.to_string()).or_default();
        log.state.next_seq = log.state.next_seq.max(next_seq);
        Ok(())
    }

    async fn start(&self, shard_id: &str) -> EngineResult<()> {
        self.lock_calls().starts.push(shard_id.to_string());
        self.lock_shards()
            .entry(shard_id.to_string())
            .or_default()
            .state
            .running = true;
        if self.auto_run {
            self.run_pending(shard_id);
        }
        Ok(())
    }

    async fn kick(&self, shard_id: &str, max_duration_ms: u64) -> EngineResult<()> {
        self.lock_calls()
            .kicks
            .push((shard_id.to_string(), max_duration_ms));
        if self.auto_run {
            self.run_pending(shard_id);
        }
        Ok(())
    }
}

/// Echo the agent definition back as a created agent.
fn default_handler(cmd: &StoredCommand) -> CommandResult {
    let handle = cmd
        .args
        .get("handle")
        .or_else(|| cmd.args.get("name"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| format!("bot-{}", cmd.seq));
    CommandResult::Ok {
        value: serde_json::json!({
            "agentId": format!("{}-{}", cmd.shard_id, cmd.seq),
            "handle": handle,
        }),
    }
}
