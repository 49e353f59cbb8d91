//! Batch injection of agent-creation commands.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use botshard_core::{Clock, SharedClock};
use botshard_engine::{CommandSubmission, EngineState, SimulationEngine};
use botshard_state::*;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::error::{InjectError, InjectResult};

/// Engine command that creates one agent from a registration payload.
pub const CREATE_AGENT: &str = "create_agent";

/// Result of one `inject_batch` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InjectOutcome {
    /// Commands written to the engine.
    pub processed_count: usize,
    pub command_refs: Vec<String>,
    /// Claimed registrations failed because their command could not be written.
    pub failed_count: usize,
}

/// What `ensure_running` did to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineAction {
    Started,
    Kicked,
    None,
}

#[derive(Debug, Clone)]
pub struct InjectionSettings {
    pub max_batch_size: usize,
    /// A running engine with no progress for this long is kicked.
    pub stall_threshold: Duration,
    pub kick_duration: Duration,
}

/// First sequence number of the next batch.
///
/// Must exceed everything the engine executed, everything it reserved and
/// everything this pipeline ever wrote.
pub fn compute_base(engine: &EngineState, last_issued_seq: Option<u64>) -> u64 {
    let after_processed = engine.last_processed_seq + 1;
    let after_issued = last_issued_seq.map_or(0, |s| s + 1);
    after_processed.max(engine.next_seq).max(after_issued)
}

/// Claims pending registrations and writes them to the engine.
pub struct InjectionPipeline {
    state: StateStore,
    engine: Arc<dyn SimulationEngine>,
    clock: SharedClock,
    settings: InjectionSettings,
    /// Single writer per channel.
    channel_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl InjectionPipeline {
    pub fn new(
        state: StateStore,
        engine: Arc<dyn SimulationEngine>,
        clock: SharedClock,
        settings: InjectionSettings,
    ) -> Self {
        Self {
            state,
            engine,
            clock,
            settings,
            channel_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &InjectionSettings {
        &self.settings
    }

    /// Inject up to `max_batch_size` pending registrations of `channel`.
    pub async fn inject_batch(
        &self,
        channel: &str,
        max_batch_size: usize,
    ) -> InjectResult<InjectOutcome> {
        let lock = self.channel_lock(channel).await;
        let _guard = lock.lock().await;

        let shard_id = self
            .state
            .get_channel(channel)?
            .ok_or_else(|| InjectError::ChannelNotFound(channel.to_string()))?
            .shard_id;

        let now = self.clock.now_millis();
        let claimed = self.state.claim_pending(channel, max_batch_size, now)?;
        if claimed.is_empty() {
            return Ok(InjectOutcome::default());
        }

        // Always from fresh engine state, never cached.
        let engine_state = match self.engine.engine_state(&shard_id).await {
            Ok(s) => s,
            Err(e) => {
                self.fail_unsubmitted(&claimed, &format!("engine state unavailable: {e}"));
                return Err(e.into());
            }
        };
        let last_issued = match self.state.last_issued_seq(channel) {
            Ok(seq) => seq,
            Err(e) => {
                self.fail_unsubmitted(&claimed, &format!("sequence cursor unavailable: {e}"));
                return Err(e.into());
            }
        };
        let base = compute_base(&engine_state, last_issued);
        debug!(
            %channel,
            %shard_id,
            base,
            last_processed = engine_state.last_processed_seq,
            next_seq = engine_state.next_seq,
            ?last_issued,
            batch = claimed.len(),
            "computed sequence base"
        );

        let mut outcome = InjectOutcome::default();
        let mut aborted: Option<InjectError> = None;
        for (offset, reg) in claimed.iter().enumerate() {
            let seq = base + offset as u64;
            let submission = CommandSubmission {
                shard_id: shard_id.clone(),
                seq,
                name: CREATE_AGENT.to_string(),
                args: reg.payload.clone(),
                submitted_at: now,
            };
            let command_ref = match self.engine.submit_command(submission).await {
                Ok(command_ref) => command_ref,
                Err(e) => {
                    let rest = &claimed[offset..];
                    warn!(
                        %channel,
                        seq,
                        unsubmitted = rest.len(),
                        error = %e,
                        "command submission failed, failing rest of batch"
                    );
                    self.fail_unsubmitted(rest, &format!("submission failed: {e}"));
                    outcome.failed_count = rest.len();
                    if outcome.processed_count == 0 {
                        return Err(e.into());
                    }
                    break;
                }
            };

            outcome.command_refs.push(command_ref.clone());
            outcome.processed_count += 1;
            if let Err(e) = self.record_written(channel, &reg.id, seq, command_ref, now) {
                let rest = &claimed[offset + 1..];
                error!(
                    %channel,
                    seq,
                    registration = %reg.id,
                    unsubmitted = rest.len(),
                    error = %e,
                    "written command not recorded, failing rest of batch"
                );
                self.fail_unsubmitted(rest, &format!("batch aborted: {e}"));
                outcome.failed_count = rest.len();
                aborted = Some(e);
                break;
            }
        }

        let next_seq = base + outcome.processed_count as u64;
        if let Some(e) = aborted {
            // The engine already holds seqs up to next_seq - 1.
            if let Err(cursor_err) = self.state.record_issued_seq(channel, next_seq - 1, now) {
                error!(
                    %channel,
                    seq = next_seq - 1,
                    error = %cursor_err,
                    "sequence cursor not saved"
                );
            }
            if let Err(engine_err) = self.engine.advance_next_seq(&shard_id, next_seq).await {
                error!(%shard_id, next_seq, error = %engine_err, "engine next_seq not advanced");
            }
            return Err(e);
        }

        self.engine.advance_next_seq(&shard_id, next_seq).await?;
        let action = self.ensure_running(&shard_id).await?;

        info!(
            %channel,
            processed = outcome.processed_count,
            failed = outcome.failed_count,
            first_seq = base,
            next_seq,
            ?action,
            "batch injected"
        );
        Ok(outcome)
    }

    /// Run a batch for every channel with pending work.
    ///
    /// A failing channel is logged and skipped.
    pub async fn inject_all(
        &self,
        max_batch_size: usize,
    ) -> InjectResult<Vec<(String, InjectOutcome)>> {
        let mut results = Vec::new();
        for channel in self.state.pending_channels()? {
            match self.inject_batch(&channel, max_batch_size).await {
                Ok(outcome) => results.push((channel, outcome)),
                Err(e) => warn!(%channel, error = %e, "batch injection failed"),
            }
        }
        Ok(results)
    }

    /// Start the engine if stopped, kick it if stalled.
    pub async fn ensure_running(&self, shard_id: &str) -> InjectResult<EngineAction> {
        let state = self.engine.engine_state(shard_id).await?;
        if !state.running {
            self.engine.start(shard_id).await?;
            info!(%shard_id, "engine started");
            return Ok(EngineAction::Started);
        }

        let now = self.clock.now_millis();
        let stall_ms = self.settings.stall_threshold.as_millis() as u64;
        let stalled = match state.last_progress_at {
            Some(at) => now.saturating_sub(at) > stall_ms,
            None => true,
        };
        if stalled {
            let max_ms = self.settings.kick_duration.as_millis() as u64;
            self.engine.kick(shard_id, max_ms).await?;
            info!(
                %shard_id,
                last_progress_at = ?state.last_progress_at,
                max_ms,
                "engine stalled, kicked"
            );
            return Ok(EngineAction::Kicked);
        }
        Ok(EngineAction::None)
    }

    /// Run `inject_all` on a timer until `shutdown` changes.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = interval.as_millis() as u64,
            max_batch_size = self.settings.max_batch_size,
            "injection loop started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.inject_all(self.settings.max_batch_size).await {
                        error!(error = %e, "injection tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("injection loop shutting down");
                    break;
                }
            }
        }
    }

    /// Persist the cursor and the command reference of one written command.
    fn record_written(
        &self,
        channel: &str,
        id: &str,
        seq: u64,
        command_ref: String,
        now: u64,
    ) -> InjectResult<()> {
        self.state.record_issued_seq(channel, seq, now)?;
        let updated = self
            .state
            .transition_registration(id, RegistrationStatus::Processing, |r| {
                r.command_ref = Some(command_ref);
            })?;
        if updated.is_none() {
            warn!(registration = %id, seq, "registration settled before its command was recorded");
        }
        Ok(())
    }

    fn fail_unsubmitted(&self, regs: &[Registration], reason: &str) {
        for reg in regs {
            let result = self
                .state
                .transition_registration(&reg.id, RegistrationStatus::Processing, |r| {
                    r.status = RegistrationStatus::Failed;
                    r.error = Some(reason.to_string());
                    r.retry_count += 1;
                });
            if let Err(e) = result {
                warn!(registration = %reg.id, error = %e, "failed to record submission failure");
            }
        }
    }

    async fn channel_lock(&self, channel: &str) -> Arc<Mutex<()>> {
        let mut locks = self.channel_locks.lock().await;
        Arc::clone(
            locks
                .entry(channel.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }
}
