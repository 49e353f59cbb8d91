//! Registration tracker — intake, reconciliation and housekeeping.

use std::sync::Arc;
use std::time::Duration;

use botshard_core::{Clock, SharedClock};
use botshard_engine::{CommandResult, SimulationEngine};
use botshard_state::*;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{TrackerError, TrackerResult};
use crate::hook::{NoopHook, PostCreateHook};

const HOUR_MS: u64 = 3_600_000;

/// Counts from one `reconcile` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileOutcome {
    /// Registrations whose status changed.
    pub updated_count: u64,
    pub completed: u64,
    pub failed: u64,
    pub stuck: u64,
}

#[derive(Debug, Clone)]
pub struct TrackerSettings {
    /// PROCESSING longer than this is force-failed.
    pub stuck_timeout: Duration,
    pub max_retries: u32,
    /// Age after which COMPLETED registrations are deleted by the loop.
    pub cleanup_after_hours: u64,
}

/// Owns the registration lifecycle outside of injection.
pub struct RegistrationTracker {
    state: StateStore,
    engine: Arc<dyn SimulationEngine>,
    clock: SharedClock,
    settings: TrackerSettings,
    hook: Arc<dyn PostCreateHook>,
}

impl RegistrationTracker {
    pub fn new(
        state: StateStore,
        engine: Arc<dyn SimulationEngine>,
        clock: SharedClock,
        settings: TrackerSettings,
    ) -> Self {
        Self {
            state,
            engine,
            clock,
            settings,
            hook: Arc::new(NoopHook),
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn PostCreateHook>) -> Self {
        self.hook = hook;
        self
    }

    pub fn settings(&self) -> &TrackerSettings {
        &self.settings
    }

    // ── Intake and queries ────────────────────────────────────────

    /// Queue an agent for creation on `channel`.
    ///
    /// Every PENDING or PROCESSING registration holds one of the channel's
    /// slots until it completes or fails.
    pub fn register_agent(
        &self,
        channel: &str,
        payload: serde_json::Value,
    ) -> TrackerResult<Registration> {
        let id = uuid::Uuid::new_v4().to_string();
        let reg = Registration::new(id, channel, payload, self.clock.now_millis());
        match self.state.admit_registration(&reg) {
            Ok(()) => {}
            Err(StateError::NotFound(_)) => {
                return Err(TrackerError::ChannelNotFound(channel.to_string()));
            }
            Err(e @ (StateError::CapacityExceeded(_) | StateError::InvalidTransition(_))) => {
                return Err(TrackerError::ChannelUnavailable {
                    channel: channel.to_string(),
                    reason: e.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        }
        debug!(registration = %reg.id, %channel, "agent registration queued");
        Ok(reg)
    }

    pub fn registration(&self, id: &str) -> TrackerResult<Registration> {
        self.state
            .get_registration(id)?
            .ok_or_else(|| TrackerError::RegistrationNotFound(id.to_string()))
    }

    pub fn list(&self, filter: &RegistrationFilter) -> TrackerResult<Vec<Registration>> {
        Ok(self.state.list_registrations(filter)?)
    }

    pub fn queue_status(&self, channel: Option<&str>) -> TrackerResult<QueueStatus> {
        Ok(self.state.queue_status(channel, self.clock.now_millis())?)
    }

    /// Record that an agent left `channel`.
    pub fn remove_agent(&self, channel: &str) -> TrackerResult<Channel> {
        match self.state.adjust_channel_agents(channel, -1) {
            Ok(updated) => {
                debug!(%channel, current = updated.current_agents, "agent removed");
                Ok(updated)
            }
            Err(StateError::NotFound(_)) => Err(TrackerError::ChannelNotFound(channel.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    // ── Reconciliation ────────────────────────────────────────────

    /// Settle every PROCESSING registration against the engine.
    pub async fn reconcile(&self) -> TrackerResult<ReconcileOutcome> {
        let processing = self
            .state
            .list_registrations(&RegistrationFilter::with_status(RegistrationStatus::Processing))?;

        let mut outcome = ReconcileOutcome::default();
        for reg in processing {
            // A row deleted or settled concurrently must not abort the pass.
            if let Err(e) = self.reconcile_one(&reg, &mut outcome).await {
                warn!(registration = %reg.id, error = %e, "reconcile failed for registration");
            }
        }

        if outcome.updated_count > 0 {
            info!(
                updated = outcome.updated_count,
                completed = outcome.completed,
                failed = outcome.failed,
                stuck = outcome.stuck,
                "registrations reconciled"
            );
        }
        Ok(outcome)
    }

    async fn reconcile_one(
        &self,
        reg: &Registration,
        outcome: &mut ReconcileOutcome,
    ) -> TrackerResult<()> {
        let now = self.clock.now_millis();

        // Stuck detection runs before the result lookup so a late
        // result never resurrects a timed-out registration.
        let started = reg.processed_at.unwrap_or(reg.created_at);
        let stuck_ms = self.settings.stuck_timeout.as_millis() as u64;
        if now.saturating_sub(started) > stuck_ms {
            let reason = format!(
                "stuck: no result within {}s",
                self.settings.stuck_timeout.as_secs()
            );
            if self.fail(&reg.id, &reason)? {
                warn!(registration = %reg.id, channel = %reg.channel, "registration stuck, failed");
                outcome.stuck += 1;
                outcome.failed += 1;
                outcome.updated_count += 1;
            }
            return Ok(());
        }

        let Some(command_ref) = reg.command_ref.clone() else {
            // Claimed but not yet written.
            return Ok(());
        };
        let result = match self.engine.command_result(&command_ref).await {
            Ok(Some(result)) => result,
            Ok(None) => return Ok(()),
            Err(e) => {
                warn!(registration = %reg.id, %command_ref, error = %e, "result lookup failed");
                return Ok(());
            }
        };

        match result {
            CommandResult::Ok { value } => match agent_result(&value, &command_ref) {
                Some(agent) => {
                    if self.complete(reg, agent).await? {
                        outcome.completed += 1;
                        outcome.updated_count += 1;
                    }
                }
                None => {
                    if self.fail(&reg.id, "malformed result: missing agentId")? {
                        outcome.failed += 1;
                        outcome.updated_count += 1;
                    }
                }
            },
            CommandResult::Error { message } => {
                if self.fail(&reg.id, &message)? {
                    debug!(registration = %reg.id, %message, "agent creation failed");
                    outcome.failed += 1;
                    outcome.updated_count += 1;
                }
            }
        }
        Ok(())
    }

    async fn complete(&self, reg: &Registration, agent: AgentResult) -> TrackerResult<bool> {
        let now = self.clock.now_millis();
        let stored = agent.clone();
        let updated = self
            .state
            .transition_registration(&reg.id, RegistrationStatus::Processing, |r| {
                r.status = RegistrationStatus::Completed;
                r.result = Some(stored);
                r.completed_at = Some(now);
                r.error = None;
            })?;
        let Some(updated) = updated else {
            return Ok(false);
        };

        if let Err(e) = self.state.adjust_channel_agents(&updated.channel, 1) {
            warn!(
                channel = %updated.channel,
                registration = %updated.id,
                error = %e,
                "agent count not updated"
            );
        }
        if let Err(e) = self.hook.on_agent_created(&updated, &agent).await {
            warn!(
                registration = %updated.id,
                agent = %agent.agent_id,
                error = %e,
                "post-create hook failed"
            );
        }
        debug!(registration = %updated.id, agent = %agent.agent_id, "registration completed");
        Ok(true)
    }

    /// PROCESSING → FAILED. Returns whether this call made the change.
    fn fail(&self, id: &str, reason: &str) -> TrackerResult<bool> {
        let updated = self
            .state
            .transition_registration(id, RegistrationStatus::Processing, |r| {
                r.status = RegistrationStatus::Failed;
                r.error = Some(reason.to_string());
                r.retry_count += 1;
            })?;
        Ok(updated.is_some())
    }

    // ── Housekeeping ──────────────────────────────────────────────

    /// Re-queue FAILED registrations still under `max_retries`.
    pub fn retry_failed(&self, max_retries: u32) -> TrackerResult<u64> {
        let failed = self
            .state
            .list_registrations(&RegistrationFilter::with_status(RegistrationStatus::Failed))?;

        let mut requeued = 0;
        for reg in failed.into_iter().filter(|r| r.retry_count < max_retries) {
            match self.state.requeue_registration(&reg.id) {
                Ok(Some(_)) => requeued += 1,
                Ok(None) => {}
                // Stays FAILED until its channel has room again.
                Err(e @ (StateError::CapacityExceeded(_) | StateError::InvalidTransition(_))) => {
                    debug!(
                        registration = %reg.id,
                        channel = %reg.channel,
                        error = %e,
                        "retry deferred"
                    );
                }
                Err(StateError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        if requeued > 0 {
            info!(requeued, max_retries, "failed registrations re-queued");
        }
        Ok(requeued)
    }

    /// Delete COMPLETED registrations that completed more than `hours` ago.
    pub fn cleanup_older_than(&self, hours: u64) -> TrackerResult<u64> {
        let cutoff = self.clock.now_millis().saturating_sub(hours * HOUR_MS);
        let removed = self.state.delete_registrations_where(|r| {
            r.status == RegistrationStatus::Completed && r.completed_at.is_some_and(|t| t < cutoff)
        })?;
        if removed > 0 {
            info!(removed, hours, "completed registrations cleaned up");
        }
        Ok(removed)
    }

    /// Force-delete every PENDING and PROCESSING registration.
    pub fn clear_stuck(&self) -> TrackerResult<u64> {
        let removed = self.state.delete_registrations_where(|r| {
            matches!(
                r.status,
                RegistrationStatus::Pending | RegistrationStatus::Processing
            )
        })?;
        warn!(removed, "in-flight registrations force-cleared");
        Ok(removed)
    }

    /// Reconcile on `interval` and clean up hourly until `shutdown` changes.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = interval.as_millis() as u64,
            stuck_timeout_secs = self.settings.stuck_timeout.as_secs(),
            "registration tracker started"
        );
        let mut cleanup = tokio::time::interval(Duration::from_secs(3600));

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.reconcile().await {
                        error!(error = %e, "reconcile failed");
                    }
                }
                _ = cleanup.tick() => {
                    if let Err(e) = self.cleanup_older_than(self.settings.cleanup_after_hours) {
                        error!(error = %e, "registration cleanup failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("registration tracker shutting down");
                    break;
                }
            }
        }
    }
}

/// Pull the created agent's identifiers out of a success result.
fn agent_result(value: &serde_json::Value, command_ref: &str) -> Option<AgentResult> {
    let agent_id = value.get("agentId")?.as_str()?.to_string();
    let handle = value
        .get("handle")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    Some(AgentResult {
        agent_id,
        handle,
        command_ref: command_ref.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use botshard_core::ManualClock;
    use botshard_engine::{CommandSubmission, MemoryEngine, StoredCommand};
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    const SHARD: &str = "pool-us-a:0";

    #[derive(Default)]
    struct RecordingHook {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PostCreateHook for RecordingHook {
        async fn on_agent_created(
            &self,
            registration: &Registration,
            _agent: &AgentResult,
        ) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(registration.id.clone());
            Ok(())
        }
    }

    struct Fixture {
        state: StateStore,
        engine: Arc<MemoryEngine>,
        clock: Arc<ManualClock>,
        hook: Arc<RecordingHook>,
        tracker: RegistrationTracker,
    }

    fn fixture_with(engine: MemoryEngine) -> Fixture {
        let state = StateStore::open_in_memory().unwrap();
        let clock = ManualClock::new(50_000_000);
        let engine = Arc::new(engine.with_clock(clock.clone()).manual());
        let hook = Arc::new(RecordingHook::default());
        state
            .put_channel(&Channel {
                name: "main-1".to_string(),
                kind: ChannelKind::Main,
                status: ChannelStatus::Active,
                region: "us".to_string(),
                current_agents: 0,
                max_agents: 2,
                shard_id: SHARD.to_string(),
                metadata: BTreeMap::new(),
                created_at: 1,
            })
            .unwrap();
        let tracker = RegistrationTracker::new(
            state.clone(),
            engine.clone(),
            clock.clone(),
            TrackerSettings {
                stuck_timeout: Duration::from_secs(600),
                max_retries: 3,
                cleanup_after_hours: 24,
            },
        )
        .with_hook(hook.clone());
        Fixture {
            state,
            engine,
            clock,
            hook,
            tracker,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(MemoryEngine::new())
    }

    /// Register, claim and write one command, the way the pipeline does.
    async fn in_flight(f: &Fixture, seq: u64) -> String {
        let reg = f
            .tracker
            .register_agent("main-1", serde_json::json!({ "handle": format!("bot{seq}") }))
            .unwrap();
        let now = f.clock.now_millis();
        f.state.claim_pending("main-1", 1, now).unwrap();
        let command_ref = f
            .engine
            .submit_command(CommandSubmission {
                shard_id: SHARD.to_string(),
                seq,
                name: "create_agent".to_string(),
                args: reg.payload.clone(),
                submitted_at: now,
            })
            .await
            .unwrap();
        f.state
            .transition_registration(&reg.id, RegistrationStatus::Processing, |r| {
                r.command_ref = Some(command_ref)
            })
            .unwrap();
        reg.id
    }

    fn status(f: &Fixture, id: &str) -> RegistrationStatus {
        f.tracker.registration(id).unwrap().status
    }

    #[tokio::test]
    async fn register_rejects_unknown_and_draining_channels() {
        let f = fixture();
        assert!(matches!(
            f.tracker.register_agent("nope", serde_json::Value::Null),
            Err(TrackerError::ChannelNotFound(_))
        ));

        let mut vip = f.state.get_channel("main-1").unwrap().unwrap();
        vip.name = "vip-1".to_string();
        vip.kind = ChannelKind::Vip;
        f.state.put_channel(&vip).unwrap();
        f.state.set_channel_status("vip-1", ChannelStatus::Draining).unwrap();
        assert!(matches!(
            f.tracker.register_agent("vip-1", serde_json::Value::Null),
            Err(TrackerError::ChannelUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn in_flight_registrations_hold_channel_slots() {
        let f = fixture();
        in_flight(&f, 1).await;
        in_flight(&f, 2).await;

        // Both slots are held while the commands are in flight.
        assert!(matches!(
            f.tracker.register_agent("main-1", serde_json::Value::Null),
            Err(TrackerError::ChannelUnavailable { .. })
        ));

        f.engine.run_pending(SHARD);
        assert_eq!(f.tracker.reconcile().await.unwrap().completed, 2);
        let channel = f.state.get_channel("main-1").unwrap().unwrap();
        assert_eq!(channel.current_agents, channel.max_agents);
        assert_eq!(f.engine.commands(SHARD).len(), 2);
        assert!(f.tracker.register_agent("main-1", serde_json::Value::Null).is_err());

        // A departure frees exactly one slot.
        f.tracker.remove_agent("main-1").unwrap();
        f.tracker.register_agent("main-1", serde_json::Value::Null).unwrap();
        assert!(f.tracker.register_agent("main-1", serde_json::Value::Null).is_err());
    }

    #[tokio::test]
    async fn failed_registration_frees_its_slot_and_retry_waits_for_room() {
        let engine = MemoryEngine::new().with_handler(Arc::new(|_cmd: &StoredCommand| {
            CommandResult::Error {
                message: "boom".to_string(),
            }
        }));
        let f = fixture_with(engine);
        let failed = in_flight(&f, 1).await;
        f.engine.run_pending(SHARD);
        f.tracker.reconcile().await.unwrap();
        assert_eq!(status(&f, &failed), RegistrationStatus::Failed);

        f.tracker.register_agent("main-1", serde_json::Value::Null).unwrap();
        f.tracker.register_agent("main-1", serde_json::Value::Null).unwrap();

        // The channel is booked up, so the retry is deferred.
        assert_eq!(f.tracker.retry_failed(3).unwrap(), 0);
        assert_eq!(status(&f, &failed), RegistrationStatus::Failed);

        f.tracker.clear_stuck().unwrap();
        assert_eq!(f.tracker.retry_failed(3).unwrap(), 1);
        assert_eq!(status(&f, &failed), RegistrationStatus::Pending);
    }

    #[tokio::test]
    async fn new_registrations_are_pending() {
        let f = fixture();
        let reg = f.tracker.register_agent("main-1", serde_json::json!({"name": "a"})).unwrap();
        assert_eq!(reg.status, RegistrationStatus::Pending);
        assert_eq!(reg.retry_count, 0);
        assert_eq!(f.tracker.registration(&reg.id).unwrap(), reg);
    }

    #[tokio::test]
    async fn unexecuted_command_stays_processing() {
        let f = fixture();
        let id = in_flight(&f, 1).await;
        let outcome = f.tracker.reconcile().await.unwrap();
        assert_eq!(outcome.updated_count, 0);
        assert_eq!(status(&f, &id), RegistrationStatus::Processing);
    }

    #[tokio::test]
    async fn success_completes_once_and_counts_the_agent() {
        let f = fixture();
        let id = in_flight(&f, 1).await;
        f.engine.run_pending(SHARD);

        let outcome = f.tracker.reconcile().await.unwrap();
        assert_eq!(outcome.completed, 1);
        assert_eq!(outcome.updated_count, 1);

        let reg = f.tracker.registration(&id).unwrap();
        assert_eq!(reg.status, RegistrationStatus::Completed);
        assert_eq!(reg.completed_at, Some(f.clock.now_millis()));
        let agent = reg.result.unwrap();
        assert_eq!(agent.agent_id, format!("{SHARD}-1"));
        assert_eq!(agent.handle, "bot1");
        assert_eq!(agent.command_ref, format!("{SHARD}@1"));

        // A second pass neither re-runs the hook nor re-counts the agent.
        f.tracker.reconcile().await.unwrap();
        assert_eq!(*f.hook.calls.lock().unwrap(), vec![id]);
        assert_eq!(f.state.get_channel("main-1").unwrap().unwrap().current_agents, 1);
    }

    #[tokio::test]
    async fn error_result_fails_and_counts_retry() {
        let engine = MemoryEngine::new().with_handler(Arc::new(|_cmd: &StoredCommand| {
            CommandResult::Error {
                message: "name taken".to_string(),
            }
        }));
        let f = fixture_with(engine);
        let id = in_flight(&f, 1).await;
        f.engine.run_pending(SHARD);

        let outcome = f.tracker.reconcile().await.unwrap();
        assert_eq!(outcome.failed, 1);
        let reg = f.tracker.registration(&id).unwrap();
        assert_eq!(reg.status, RegistrationStatus::Failed);
        assert_eq!(reg.retry_count, 1);
        assert_eq!(reg.error.as_deref(), Some("name taken"));
        assert!(f.hook.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn result_without_agent_id_is_malformed() {
        let engine = MemoryEngine::new().with_handler(Arc::new(|_cmd: &StoredCommand| {
            CommandResult::Ok {
                value: serde_json::json!({ "handle": "x" }),
            }
        }));
        let f = fixture_with(engine);
        let id = in_flight(&f, 1).await;
        f.engine.run_pending(SHARD);

        f.tracker.reconcile().await.unwrap();
        let reg = f.tracker.registration(&id).unwrap();
        assert_eq!(reg.status, RegistrationStatus::Failed);
        assert!(reg.error.unwrap().contains("malformed"));
    }

    #[tokio::test]
    async fn stuck_registration_fails_even_if_result_arrives_late() {
        let f = fixture();
        let id = in_flight(&f, 1).await;

        f.clock.advance(Duration::from_secs(601));
        // The engine catches up right before the reconcile pass.
        f.engine.run_pending(SHARD);

        let outcome = f.tracker.reconcile().await.unwrap();
        assert_eq!(outcome.stuck, 1);
        let reg = f.tracker.registration(&id).unwrap();
        assert_eq!(reg.status, RegistrationStatus::Failed);
        assert!(reg.error.unwrap().starts_with("stuck"));
        assert_eq!(reg.retry_count, 1);

        // Later passes leave it failed.
        f.tracker.reconcile().await.unwrap();
        assert_eq!(status(&f, &id), RegistrationStatus::Failed);
        assert!(f.hook.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn retry_failed_respects_the_cap() {
        let f = fixture();
        let now = f.clock.now_millis();
        for (id, retries) in [("under", 2), ("at-cap", 3)] {
            let mut reg = Registration::new(id.to_string(), "main-1", serde_json::Value::Null, now);
            reg.status = RegistrationStatus::Failed;
            reg.retry_count = retries;
            reg.processed_at = Some(now);
            reg.command_ref = Some(format!("{SHARD}@9"));
            f.state.put_registration(&reg).unwrap();
        }

        assert_eq!(f.tracker.retry_failed(3).unwrap(), 1);
        let under = f.tracker.registration("under").unwrap();
        assert_eq!(under.status, RegistrationStatus::Pending);
        assert_eq!(under.processed_at, None);
        assert_eq!(under.command_ref, None);
        assert_eq!(under.retry_count, 2);

        assert_eq!(status(&f, "at-cap"), RegistrationStatus::Failed);
        assert_eq!(f.tracker.retry_failed(3).unwrap(), 0);
    }

    #[tokio::test]
    async fn retry_count_never_exceeds_max() {
        let engine = MemoryEngine::new().with_handler(Arc::new(|_cmd: &StoredCommand| {
            CommandResult::Error {
                message: "nope".to_string(),
            }
        }));
        let f = fixture_with(engine);
        let id = in_flight(&f, 1).await;
        let mut seq = 1;

        for _ in 0..10 {
            f.engine.run_pending(SHARD);
            f.tracker.reconcile().await.unwrap();
            if f.tracker.retry_failed(3).unwrap() == 0 {
                break;
            }
            // Re-inject the requeued registration.
            seq += 1;
            f.state.claim_pending("main-1", 1, f.clock.now_millis()).unwrap();
            let command_ref = f
                .engine
                .submit_command(CommandSubmission {
                    shard_id: SHARD.to_string(),
                    seq,
                    name: "create_agent".to_string(),
                    args: serde_json::Value::Null,
                    submitted_at: 0,
                })
                .await
                .unwrap();
            f.state
                .transition_registration(&id, RegistrationStatus::Processing, |r| {
                    r.command_ref = Some(command_ref)
                })
                .unwrap();
        }

        let reg = f.tracker.registration(&id).unwrap();
        assert_eq!(reg.status, RegistrationStatus::Failed);
        assert_eq!(reg.retry_count, 3);
    }

    #[tokio::test]
    async fn cleanup_only_removes_old_completed() {
        let f = fixture();
        let now = f.clock.now_millis();
        let two_hours_ago = now - 2 * HOUR_MS;
        let rows = [
            ("old-completed", RegistrationStatus::Completed, Some(two_hours_ago)),
            ("new-completed", RegistrationStatus::Completed, Some(now - 60_000)),
            ("old-pending", RegistrationStatus::Pending, None),
            ("old-processing", RegistrationStatus::Processing, None),
            ("old-failed", RegistrationStatus::Failed, Some(two_hours_ago)),
        ];
        for (id, status, completed_at) in rows {
            let mut reg =
                Registration::new(id.to_string(), "main-1", serde_json::Value::Null, two_hours_ago);
            reg.status = status;
            reg.completed_at = completed_at;
            f.state.put_registration(&reg).unwrap();
        }

        assert_eq!(f.tracker.cleanup_older_than(1).unwrap(), 1);
        assert!(f.state.get_registration("old-completed").unwrap().is_none());
        for id in ["new-completed", "old-pending", "old-processing", "old-failed"] {
            assert!(f.state.get_registration(id).unwrap().is_some(), "{id} was removed");
        }
    }

    #[tokio::test]
    async fn clear_stuck_removes_in_flight_only() {
        let f = fixture();
        let processing = in_flight(&f, 1).await;
        let pending = f.tracker.register_agent("main-1", serde_json::Value::Null).unwrap();
        let mut done = Registration::new("done".to_string(), "main-1", serde_json::Value::Null, 1);
        done.status = RegistrationStatus::Completed;
        f.state.put_registration(&done).unwrap();

        assert_eq!(f.tracker.clear_stuck().unwrap(), 2);
        assert!(f.state.get_registration(&pending.id).unwrap().is_none());
        assert!(f.state.get_registration(&processing).unwrap().is_none());
        assert!(f.state.get_registration("done").unwrap().is_some());
    }

    #[tokio::test]
    async fn queue_status_and_remove_agent() {
        let f = fixture();
        f.tracker.register_agent("main-1", serde_json::Value::Null).unwrap();
        f.clock.advance(Duration::from_secs(3));
        let q = f.tracker.queue_status(Some("main-1")).unwrap();
        assert_eq!(q.pending, 1);
        assert_eq!(q.oldest_pending_age_ms, Some(3_000));

        assert!(f.tracker.remove_agent("main-1").is_err());
        f.state.adjust_channel_agents("main-1", 1).unwrap();
        assert_eq!(f.tracker.remove_agent("main-1").unwrap().current_agents, 0);
        assert!(matches!(
            f.tracker.remove_agent("ghost"),
            Err(TrackerError::ChannelNotFound(_))
        ));
    }
}
