//! Domain types for the botshard state store.
//!
//! These types represent the persisted state of channels, pools,
//! registrations, and sequence cursors. All types are serializable
//! to/from JSON for storage in redb tables.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Unique channel name.
pub type ChannelName = String;

/// Unique identifier for a backing pool.
pub type PoolId = String;

/// Unique identifier for a registration.
pub type RegistrationId = String;

// ── Channel ───────────────────────────────────────────────────────

/// A capacity-bounded simulation shard that hosts agents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Channel {
    pub name: ChannelName,
    pub kind: ChannelKind,
    pub status: ChannelStatus,
    pub region: String,
    pub current_agents: u32,
    pub max_agents: u32,
    /// Shard identifier on the backing pool (`{pool_id}:{index}`).
    pub shard_id: String,
    pub metadata: BTreeMap<String, String>,
    /// Unix timestamp (milliseconds) when the channel was created.
    pub created_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelKind {
    Main,
    Vip,
    Test,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelStatus {
    Active,
    Scaling,
    Draining,
}

impl Channel {
    /// Whether another agent fits under `max_agents * headroom`.
    pub fn has_headroom(&self, headroom: f64) -> bool {
        (self.current_agents as f64) < (self.max_agents as f64) * headroom
    }

    pub fn is_full(&self) -> bool {
        self.current_agents >= self.max_agents
    }

    /// Empty, non-MAIN channels are the only ones that may drain.
    pub fn can_drain(&self) -> bool {
        self.current_agents == 0 && self.kind != ChannelKind::Main
    }
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 3] = [ChannelKind::Main, ChannelKind::Vip, ChannelKind::Test];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Main => "main",
            ChannelKind::Vip => "vip",
            ChannelKind::Test => "test",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ChannelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "main" => Ok(ChannelKind::Main),
            "vip" => Ok(ChannelKind::Vip),
            "test" => Ok(ChannelKind::Test),
            other => Err(format!("unknown channel kind: {other}")),
        }
    }
}

impl std::str::FromStr for ChannelStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "active" => Ok(ChannelStatus::Active),
            "scaling" => Ok(ChannelStatus::Scaling),
            "draining" => Ok(ChannelStatus::Draining),
            other => Err(format!("unknown channel status: {other}")),
        }
    }
}

/// Filter for channel listings. `None` fields match everything.
#[derive(Debug, Clone, Default)]
pub struct ChannelFilter {
    pub region: Option<String>,
    pub kind: Option<ChannelKind>,
    pub status: Option<ChannelStatus>,
}

impl ChannelFilter {
    pub fn matches(&self, channel: &Channel) -> bool {
        self.region.as_ref().is_none_or(|r| *r == channel.region)
            && self.kind.is_none_or(|k| k == channel.kind)
            && self.status.is_none_or(|s| s == channel.status)
    }
}

// ── Pool ──────────────────────────────────────────────────────────

/// One backing simulation-engine deployment with fixed shard capacity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Pool {
    pub id: PoolId,
    pub region: String,
    pub total_shards: u32,
    pub used_shards: u32,
    pub status: PoolStatus,
    /// Reachable address of the deployment (`host:port`).
    pub endpoint: String,
    pub created_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PoolStatus {
    Active,
    Draining,
}

impl Pool {
    /// Whether the pool is below `fill_ratio` of its shard capacity.
    pub fn has_spare_capacity(&self, fill_ratio: f64) -> bool {
        (self.used_shards as f64) < (self.total_shards as f64) * fill_ratio
    }
}

// ── Registration ──────────────────────────────────────────────────

/// A request to create one agent on one channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Registration {
    pub id: RegistrationId,
    pub channel: ChannelName,
    /// Agent definition, passed through to the engine as command args.
    pub payload: serde_json::Value,
    pub status: RegistrationStatus,
    /// Engine command reference, set once the command is written.
    pub command_ref: Option<String>,
    pub result: Option<AgentResult>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub created_at: u64,
    pub processed_at: Option<u64>,
    pub completed_at: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegistrationStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl RegistrationStatus {
    /// Allowed lifecycle edges. `Failed → Pending` is the retry edge.
    pub fn can_transition_to(self, next: RegistrationStatus) -> bool {
        use RegistrationStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Failed, Pending)
        ) || self == next
    }
}

impl std::str::FromStr for RegistrationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(RegistrationStatus::Pending),
            "processing" => Ok(RegistrationStatus::Processing),
            "completed" => Ok(RegistrationStatus::Completed),
            "failed" => Ok(RegistrationStatus::Failed),
            other => Err(format!("unknown registration status: {other}")),
        }
    }
}

/// Identifiers extracted from a successful agent-creation command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentResult {
    pub agent_id: String,
    pub handle: String,
    pub command_ref: String,
}

impl Registration {
    pub fn new(id: RegistrationId, channel: &str, payload: serde_json::Value, now: u64) -> Self {
        Self {
            id,
            channel: channel.to_string(),
            payload,
            status: RegistrationStatus::Pending,
            command_ref: None,
            result: None,
            error: None,
            retry_count: 0,
            created_at: now,
            processed_at: None,
            completed_at: None,
        }
    }
}

/// Filter for registration listings. `None` fields match everything.
#[derive(Debug, Clone, Default)]
pub struct RegistrationFilter {
    pub channel: Option<String>,
    pub status: Option<RegistrationStatus>,
}

impl RegistrationFilter {
    pub fn with_status(status: RegistrationStatus) -> Self {
        Self {
            channel: None,
            status: Some(status),
        }
    }

    pub fn matches(&self, reg: &Registration) -> bool {
        self.channel.as_ref().is_none_or(|c| *c == reg.channel)
            && self.status.is_none_or(|s| s == reg.status)
    }
}

/// Aggregate registration counts for one channel or the whole fleet.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QueueStatus {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    /// Age in milliseconds of the oldest PENDING registration.
    pub oldest_pending_age_ms: Option<u64>,
}

// ── Sequence cursor ───────────────────────────────────────────────

/// Highest sequence number ever written to a channel's command log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SequenceCursor {
    pub channel: ChannelName,
    pub last_issued_seq: u64,
    pub updated_at: u64,
}
