use std::fmt::{self, Display};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Position of a record within a partition's log.
pub type Position = i64;

/// Index handed out by the replication module for an accepted append.
pub type LogIndex = i64;

pub type PartitionId = u16;

/// Marker for "no position": no record processed yet, or no causing record.
pub const UNSET_POSITION: Position = -1;

/// Key value signalling that the processor must assign a new key.
pub const UNKEYED: i64 = -1;

/// Commit notification from the replication module.
///
/// `index` is the replication index of the committed append, `position` the highest
/// record position contained in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Commit {
    pub index: LogIndex,
    pub position: Position,
}

impl Commit {
    pub fn new(index: LogIndex, position: Position) -> Self {
        Self { index, position }
    }
}

impl Display for Commit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "commit(index={}, position={})", self.index, self.position)
    }
}

/// Wall-clock milliseconds used to stamp written records.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
