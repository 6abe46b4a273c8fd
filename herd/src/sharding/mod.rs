//! Sharding engine: the shard index, mapping/table definitions, and the
//! online move/split/prune machinery.

pub mod definition;
pub mod error;
pub mod index;
pub mod key;
pub mod mover;
pub mod shards;
pub mod splitter;

pub use error::Error;
pub use index::{locate, prune_window, upper_bound_of, PruneWindow};
pub use key::{Bound, ShardingType};

use serde::Serialize;

/// A sharding definition: one sharding type, one global group, any number
/// of attached tables.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardMapping {
    pub id: u64,
    pub kind: ShardingType,
    pub global_group: String,
}

/// A (table, sharding column) attached to a mapping.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShardTable {
    pub mapping_id: u64,
    pub table: String,
    pub column: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardState {
    Enabled,
    Disabled,
}

impl ShardState {
    pub fn parse(s: &str) -> Result<Self, Error> {
        match s.to_ascii_uppercase().as_str() {
            "ENABLED" => Ok(ShardState::Enabled),
            "DISABLED" => Ok(ShardState::Disabled),
            other => Err(Error::InvalidState(other.into())),
        }
    }
}

impl std::fmt::Display for ShardState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShardState::Enabled => write!(f, "ENABLED"),
            ShardState::Disabled => write!(f, "DISABLED"),
        }
    }
}

/// A shard: a partition of every table in one mapping, hosted on exactly
/// one group.
#[derive(Debug, Clone, PartialEq)]
pub struct Shard {
    pub id: u64,
    pub group_id: String,
    pub state: ShardState,
}

impl Shard {
    pub fn enabled(&self) -> bool {
        self.state == ShardState::Enabled
    }
}

/// The persisted bound record placing a shard in its mapping's index.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeEntry {
    pub mapping_id: u64,
    pub lower_bound: Bound,
    pub shard_id: u64,
}
