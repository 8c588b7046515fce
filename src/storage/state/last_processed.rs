use crate::traits::StorageResult;
use crate::types::{Position, UNSET_POSITION};

use super::column_family::{ColumnFamily, TypedColumnFamily};
use super::transaction::Transaction;

const LAST_PROCESSED_KEY: &str = "LAST_PROCESSED_EVENT_KEY";

/// Position of the last record whose effects are committed to the state.
///
/// Written in the same transaction as the record's state changes, which is what
/// makes replay after a crash idempotent.
#[derive(Debug, Clone)]
pub struct LastProcessedPositionState {
    family: TypedColumnFamily<String, Position>,
    key: String,
}

impl Default for LastProcessedPositionState {
    fn default() -> Self {
        Self::new()
    }
}

impl LastProcessedPositionState {
    pub fn new() -> Self {
        Self {
            family: TypedColumnFamily::new(ColumnFamily::LastProcessedPosition),
            key: LAST_PROCESSED_KEY.to_string(),
        }
    }

    /// `UNSET_POSITION` if nothing was processed yet.
    pub fn get(&self, txn: &Transaction) -> StorageResult<Position> {
        Ok(self.family.get(txn, &self.key)?.unwrap_or(UNSET_POSITION))
    }

    pub fn mark_as_processed(
        &self,
        txn: &mut Transaction,
        position: Position,
    ) -> StorageResult<()> {
        self.family.upsert(txn, &self.key, &position)
    }
}
