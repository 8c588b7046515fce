use std::collections::BTreeMap;
use std::sync::Arc;

use crate::traits::StorageResult;

use super::db::{StateDb, WriteBatch, WriteOp};

/// Buffered writes over a [`StateDb`] with read-your-writes.
///
/// Nothing is visible to other readers until [`Transaction::commit`], which persists
/// all buffered writes as one batch. A transaction may be reused after commit or
/// rollback.
pub struct Transaction {
    db: Arc<StateDb>,
    /// `None` marks a pending delete
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl Transaction {
    pub(crate) fn new(db: Arc<StateDb>) -> Self {
        Self {
            db,
            writes: BTreeMap::new(),
        }
    }

    pub fn db(&self) -> &Arc<StateDb> {
        &self.db
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        match self.writes.get(key) {
            Some(pending) => pending.clone(),
            None => self.db.get(key),
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.writes.insert(key, Some(value));
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.writes.insert(key, None);
    }

    /// Entries under `prefix` as this transaction sees them, in key order.
    pub fn scan_prefix(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> =
            self.db.scan_prefix(prefix).into_iter().collect();

        for (key, pending) in self
            .writes
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
        {
            match pending {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }

        merged.into_iter().collect()
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.writes.is_empty()
    }

    /// Persist all buffered writes atomically.
    pub fn commit(&mut self) -> StorageResult<()> {
        let writes = std::mem::take(&mut self.writes);
        let batch = WriteBatch {
            ops: writes
                .into_iter()
                .map(|(key, value)| match value {
                    Some(value) => WriteOp::Put { key, value },
                    None => WriteOp::Delete { key },
                })
                .collect(),
        };
        self.db.write(batch)
    }

    pub fn rollback(&mut self) {
        self.writes.clear();
    }
}
