//! StateStore — redb-backed state persistence for botshard.
//!
//! Provides typed operations over channels, pools, registrations, and
//! sequence cursors. All values are JSON-serialized into redb's `&[u8]`
//! value columns. The store supports both on-disk and in-memory backends
//! (the latter for testing).

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(CHANNELS).map_err(map_err!(Table))?;
        txn.open_table(POOLS).map_err(map_err!(Table))?;
        txn.open_table(REGISTRATIONS).map_err(map_err!(Table))?;
        txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Channels ───────────────────────────────────────────────────

    /// Insert or update a channel.
    pub fn put_channel(&self, channel: &Channel) -> StateResult<()> {
        self.put_json(CHANNELS, &channel.name, channel)?;
        debug!(channel = %channel.name, "channel stored");
        Ok(())
    }

    /// Insert a channel unless one with the same name exists.
    ///
    /// Returns true if the channel was inserted.
    pub fn insert_channel_if_absent(&self, channel: &Channel) -> StateResult<bool> {
        self.modify(CHANNELS, &channel.name, |existing: Option<Channel>| {
            Ok(match existing {
                Some(_) => (None, false),
                None => (Some(channel.clone()), true),
            })
        })
    }

    /// Get a channel by name.
    pub fn get_channel(&self, name: &str) -> StateResult<Option<Channel>> {
        self.get_json(CHANNELS, name)
    }

    /// List channels matching the filter.
    pub fn list_channels(&self, filter: &ChannelFilter) -> StateResult<Vec<Channel>> {
        let all: Vec<Channel> = self.scan_json(CHANNELS)?;
        Ok(all.into_iter().filter(|c| filter.matches(c)).collect())
    }

    /// Change a channel's status.
    ///
    /// Moving to DRAINING is refused unless the channel is empty and not MAIN.
    pub fn set_channel_status(&self, name: &str, status: ChannelStatus) -> StateResult<Channel> {
        self.modify(CHANNELS, name, |existing: Option<Channel>| {
            let mut channel =
                existing.ok_or_else(|| StateError::NotFound(format!("channel {name}")))?;
            if status == ChannelStatus::Draining && !channel.can_drain() {
                return Err(StateError::InvalidTransition(format!(
                    "channel {name} cannot drain ({} agents, kind {})",
                    channel.current_agents, channel.kind
                )));
            }
            channel.status = status;
            Ok((Some(channel.clone()), channel))
        })
    }

    /// Add `delta` agents to a channel, keeping `0 <= current <= max`.
    pub fn adjust_channel_agents(&self, name: &str, delta: i64) -> StateResult<Channel> {
        self.modify(CHANNELS, name, |existing: Option<Channel>| {
            let mut channel =
                existing.ok_or_else(|| StateError::NotFound(format!("channel {name}")))?;
            let next = i64::from(channel.current_agents) + delta;
            if next < 0 {
                return Err(StateError::InvalidTransition(format!(
                    "channel {name} has no agents to remove"
                )));
            }
            if next > i64::from(channel.max_agents) {
                return Err(StateError::CapacityExceeded(format!(
                    "channel {name} is full ({}/{})",
                    channel.current_agents, channel.max_agents
                )));
            }
            channel.current_agents = next as u32;
            Ok((Some(channel.clone()), channel))
        })
    }

    // ── Pools ──────────────────────────────────────────────────────

    /// Insert or update a pool.
    pub fn put_pool(&self, pool: &Pool) -> StateResult<()> {
        self.put_json(POOLS, &pool.id, pool)?;
        debug!(pool = %pool.id, region = %pool.region, "pool stored");
        Ok(())
    }

    /// Get a pool by ID.
    pub fn get_pool(&self, pool_id: &str) -> StateResult<Option<Pool>> {
        self.get_json(POOLS, pool_id)
    }

    /// List pools, optionally restricted to one region.
    pub fn list_pools(&self, region: Option<&str>) -> StateResult<Vec<Pool>> {
        let all: Vec<Pool> = self.scan_json(POOLS)?;
        Ok(all
            .into_iter()
            .filter(|p| region.is_none_or(|r| r == p.region))
            .collect())
    }

    /// Atomically take the next shard slot of a pool.
    ///
    /// Returns the updated pool and the zero-based index of the new shard.
    pub fn allocate_shard(&self, pool_id: &str) -> StateResult<(Pool, u32)> {
        self.modify(POOLS, pool_id, |existing: Option<Pool>| {
            let mut pool =
                existing.ok_or_else(|| StateError::NotFound(format!("pool {pool_id}")))?;
            if pool.status != PoolStatus::Active {
                return Err(StateError::InvalidTransition(format!(
                    "pool {pool_id} is draining"
                )));
            }
            if pool.used_shards >= pool.total_shards {
                return Err(StateError::CapacityExceeded(format!(
                    "pool {pool_id} has no free shards"
                )));
            }
            let index = pool.used_shards;
            pool.used_shards += 1;
            Ok((Some(pool.clone()), (pool, index)))
        })
    }

    /// Change a pool's status.
    pub fn set_pool_status(&self, pool_id: &str, status: PoolStatus) -> StateResult<Pool> {
        self.modify(POOLS, pool_id, |existing: Option<Pool>| {
            let mut pool =
                existing.ok_or_else(|| StateError::NotFound(format!("pool {pool_id}")))?;
            pool.status = status;
            Ok((Some(pool.clone()), pool))
        })
    }

    // ── Registrations ──────────────────────────────────────────────

    /// Insert or update a registration.
    pub fn put_registration(&self, reg: &Registration) -> StateResult<()> {
        self.put_json(REGISTRATIONS, &reg.id, reg)
    }

    /// Insert a new registration if its channel has a free slot.
    ///
    /// Slots are `max_agents` minus current agents minus the channel's
    /// PENDING and PROCESSING rows. The check and the insert share one
    /// write transaction.
    pub fn admit_registration(&self, reg: &Registration) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let channels = txn.open_table(CHANNELS).map_err(map_err!(Table))?;
            let mut table = txn.open_table(REGISTRATIONS).map_err(map_err!(Table))?;
            check_free_slot(&channels, &table, &reg.channel)?;
            let value = serde_json::to_vec(reg).map_err(map_err!(Serialize))?;
            table
                .insert(reg.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Move a FAILED registration back to PENDING if its channel has a
    /// free slot.
    ///
    /// Returns `Ok(None)` when the registration is no longer FAILED.
    pub fn requeue_registration(&self, id: &str) -> StateResult<Option<Registration>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let requeued = {
            let channels = txn.open_table(CHANNELS).map_err(map_err!(Table))?;
            let mut table = txn.open_table(REGISTRATIONS).map_err(map_err!(Table))?;
            let current: Option<Registration> = match table.get(id).map_err(map_err!(Read))? {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };
            let mut reg =
                current.ok_or_else(|| StateError::NotFound(format!("registration {id}")))?;
            if reg.status != RegistrationStatus::Failed {
                None
            } else {
                check_free_slot(&channels, &table, &reg.channel)?;
                reg.status = RegistrationStatus::Pending;
                reg.command_ref = None;
                reg.error = None;
                reg.processed_at = None;
                reg.completed_at = None;
                let value = serde_json::to_vec(&reg).map_err(map_err!(Serialize))?;
                table
                    .insert(id, value.as_slice())
                    .map_err(map_err!(Write))?;
                Some(reg)
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(requeued)
    }

    /// Get a registration by ID.
    pub fn get_registration(&self, id: &str) -> StateResult<Option<Registration>> {
        self.get_json(REGISTRATIONS, id)
    }

    /// List registrations matching the filter, oldest first.
    pub fn list_registrations(
        &self,
        filter: &RegistrationFilter,
    ) -> StateResult<Vec<Registration>> {
        let all: Vec<Registration> = self.scan_json(REGISTRATIONS)?;
        let mut matching: Vec<Registration> =
            all.into_iter().filter(|r| filter.matches(r)).collect();
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(matching)
    }

    /// Claim up to `max` PENDING registrations of a channel for processing.
    ///
    /// Oldest registrations are claimed first. All claimed rows move to
    /// PROCESSING with `processed_at = now` in a single write transaction,
    /// so concurrent claimers never receive the same registration.
    pub fn claim_pending(
        &self,
        channel: &str,
        max: usize,
        now: u64,
    ) -> StateResult<Vec<Registration>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let claimed = {
            let mut table = txn.open_table(REGISTRATIONS).map_err(map_err!(Table))?;
            let mut pending = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (_, value) = entry.map_err(map_err!(Read))?;
                let reg: Registration =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if reg.channel == channel && reg.status == RegistrationStatus::Pending {
                    pending.push(reg);
                }
            }
            pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
            pending.truncate(max);

            for reg in &mut pending {
                reg.status = RegistrationStatus::Processing;
                reg.processed_at = Some(now);
                let value = serde_json::to_vec(&*reg).map_err(map_err!(Serialize))?;
                table
                    .insert(reg.id.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
            pending
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%channel, claimed = claimed.len(), "registrations claimed");
        Ok(claimed)
    }

    /// Apply `update` to a registration only if it is still in `expected`.
    ///
    /// Returns `Ok(None)` when the registration has moved on. The new status
    /// set by `update` must be a legal lifecycle edge from `expected`.
    pub fn transition_registration<F>(
        &self,
        id: &str,
        expected: RegistrationStatus,
        update: F,
    ) -> StateResult<Option<Registration>>
    where
        F: FnOnce(&mut Registration),
    {
        self.modify(REGISTRATIONS, id, |existing: Option<Registration>| {
            let mut reg =
                existing.ok_or_else(|| StateError::NotFound(format!("registration {id}")))?;
            if reg.status != expected {
                return Ok((None, None));
            }
            update(&mut reg);
            if !expected.can_transition_to(reg.status) {
                return Err(StateError::InvalidTransition(format!(
                    "registration {id}: {expected:?} -> {:?}",
                    reg.status
                )));
            }
            Ok((Some(reg.clone()), Some(reg)))
        })
    }

    /// Delete every registration matching `predicate`. Returns the count.
    pub fn delete_registrations_where<F>(&self, predicate: F) -> StateResult<u64>
    where
        F: Fn(&Registration) -> bool,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let count = {
            let mut table = txn.open_table(REGISTRATIONS).map_err(map_err!(Table))?;
            let mut doomed = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                let reg: Registration =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if predicate(&reg) {
                    doomed.push(key.value().to_string());
                }
            }
            for key in &doomed {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            doomed.len() as u64
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(count)
    }

    /// Channels that currently have at least one PENDING registration.
    pub fn pending_channels(&self) -> StateResult<Vec<String>> {
        let regs = self.list_registrations(&RegistrationFilter::with_status(
            RegistrationStatus::Pending,
        ))?;
        let channels: BTreeSet<String> = regs.into_iter().map(|r| r.channel).collect();
        Ok(channels.into_iter().collect())
    }

    /// Count registrations by status for one channel, or all channels.
    pub fn queue_status(&self, channel: Option<&str>, now: u64) -> StateResult<QueueStatus> {
        let filter = RegistrationFilter {
            channel: channel.map(str::to_string),
            status: None,
        };
        let mut status = QueueStatus::default();
        let mut oldest_pending: Option<u64> = None;
        for reg in self.list_registrations(&filter)? {
            match reg.status {
                RegistrationStatus::Pending => {
                    status.pending += 1;
                    oldest_pending =
                        Some(oldest_pending.map_or(reg.created_at, |o| o.min(reg.created_at)));
                }
                RegistrationStatus::Processing => status.processing += 1,
                RegistrationStatus::Completed => status.completed += 1,
                RegistrationStatus::Failed => status.failed += 1,
            }
        }
        status.oldest_pending_age_ms = oldest_pending.map(|t| now.saturating_sub(t));
        Ok(status)
    }

    // ── Sequence cursors ───────────────────────────────────────────

    /// Highest sequence number ever issued on a channel.
    pub fn last_issued_seq(&self, channel: &str) -> StateResult<Option<u64>> {
        let cursor: Option<SequenceCursor> = self.get_json(SEQUENCES, channel)?;
        Ok(cursor.map(|c| c.last_issued_seq))
    }

    /// Record that `seq` was issued. The cursor never moves backwards.
    ///
    /// Returns the stored cursor value.
    pub fn record_issued_seq(&self, channel: &str, seq: u64, now: u64) -> StateResult<u64> {
        self.modify(SEQUENCES, channel, |existing: Option<SequenceCursor>| {
            let last = existing.map_or(seq, |c| c.last_issued_seq.max(seq));
            let cursor = SequenceCursor {
                channel: channel.to_string(),
                last_issued_seq: last,
                updated_at: now,
            };
            Ok((Some(cursor), last))
        })
    }

    // ── Internal helpers ───────────────────────────────────────────

    fn put_json<T: Serialize>(&self, def: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, def: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn scan_json<T: DeserializeOwned>(&self, def: JsonTable) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let item: T = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(item);
        }
        Ok(results)
    }

    /// Read-modify-write one row inside a single write transaction.
    ///
    /// `f` receives the current value and returns the value to store (if
    /// any) plus the caller's result. An `Err` aborts the transaction.
    fn modify<T, R, F>(&self, def: JsonTable, key: &str, f: F) -> StateResult<R>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(Option<T>) -> StateResult<(Option<T>, R)>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let result = {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            let current: Option<T> = match table.get(key).map_err(map_err!(Read))? {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };
            let (next, result) = f(current)?;
            if let Some(next) = next {
                let bytes = serde_json::to_vec(&next).map_err(map_err!(Serialize))?;
                table
                    .insert(key, bytes.as_slice())
                    .map_err(map_err!(Write))?;
            }
            result
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(result)
    }
}

type JsonRows<'txn> = redb::Table<'txn, &'static str, &'static [u8]>;

/// Refuse unless `channel` is ACTIVE with a slot left after counting its
/// agents and its in-flight registrations.
fn check_free_slot(
    channels: &JsonRows<'_>,
    registrations: &JsonRows<'_>,
    channel: &str,
) -> StateResult<()> {
    let target: Channel = match channels.get(channel).map_err(map_err!(Read))? {
        Some(guard) => serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
        None => return Err(StateError::NotFound(format!("channel {channel}"))),
    };
    if target.status != ChannelStatus::Active {
        return Err(StateError::InvalidTransition(format!(
            "channel {channel} is {:?}",
            target.status
        )));
    }

    let mut in_flight = 0u32;
    for entry in registrations.iter().map_err(map_err!(Read))? {
        let (_, value) = entry.map_err(map_err!(Read))?;
        let reg: Registration =
            serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
        if reg.channel == channel
            && matches!(reg.status, RegistrationStatus::Pending | RegistrationStatus::Processing)
        {
            in_flight += 1;
        }
    }
    if target.current_agents.saturating_add(in_flight) >= target.max_agents {
        return Err(StateError::CapacityExceeded(format!(
            "channel {channel} is full ({} agents, {in_flight} in flight, max {})",
            target.current_agents, target.max_agents
        )));
    }
    Ok(())
}
