//! redb table definitions for the botshard state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Channels keyed by channel name.
pub const CHANNELS: TableDefinition<&str, &[u8]> = TableDefinition::new("channels");

/// Pools keyed by pool id.
pub const POOLS: TableDefinition<&str, &[u8]> = TableDefinition::new("pools");

/// Registrations keyed by registration id.
pub const REGISTRATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("registrations");

/// Per-channel sequence cursors keyed by channel name.
pub const SEQUENCES: TableDefinition<&str, &[u8]> = TableDefinition::new("sequences");
