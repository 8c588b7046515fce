use crate::traits::StorageResult;
use crate::types::PartitionId;

use super::column_family::{ColumnFamily, TypedColumnFamily};
use super::transaction::Transaction;

/// Bits of a key holding the per-partition counter; the partition id sits above.
pub const KEY_BITS: u32 = 51;

const LATEST_KEY: &str = "LATEST_KEY";

/// Hands out keys that are unique across partitions.
///
/// The partition id occupies the bits above [`KEY_BITS`], so every key encodes the
/// partition that created it. The latest key is kept in the `Key` family and therefore
/// moves with the processing transaction.
#[derive(Debug, Clone)]
pub struct KeyGenerator {
    partition_id: PartitionId,
    initial_value: i64,
    family: TypedColumnFamily<String, i64>,
    key: String,
}

impl KeyGenerator {
    pub fn new(partition_id: PartitionId) -> Self {
        Self {
            partition_id,
            initial_value: start_key(partition_id),
            family: TypedColumnFamily::new(ColumnFamily::Key),
            key: LATEST_KEY.to_string(),
        }
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    /// Last key handed out, or the partition's start value if none was.
    pub fn current_key(&self, txn: &Transaction) -> StorageResult<i64> {
        Ok(self
            .family
            .get(txn, &self.key)?
            .unwrap_or(self.initial_value))
    }

    pub fn next_key(&self, txn: &mut Transaction) -> StorageResult<i64> {
        let next = self.current_key(txn)? + 1;
        self.family.upsert(txn, &self.key, &next)?;
        Ok(next)
    }

    /// Raise the latest key to `key` if it was created by this partition and is
    /// higher than the current one. Used while replaying.
    pub fn set_key_if_higher(&self, txn: &mut Transaction, key: i64) -> StorageResult<bool> {
        if key < 0 || decode_partition_id(key) != self.partition_id {
            return Ok(false);
        }
        if key <= self.current_key(txn)? {
            return Ok(false);
        }
        self.family.upsert(txn, &self.key, &key)?;
        Ok(true)
    }
}

pub fn start_key(partition_id: PartitionId) -> i64 {
    (partition_id as i64) << KEY_BITS
}

pub fn decode_partition_id(key: i64) -> PartitionId {
    (key >> KEY_BITS) as PartitionId
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::storage::state::{StateDb, StateDbOptions};

    #[test]
    fn test_keys_encode_partition() {
        let dir = TempDir::new().unwrap();
        let db = StateDb::open(StateDbOptions {
            dir: dir.path().to_path_buf(),
            sync_on_commit: false,
        })
        .unwrap();
        let mut txn = db.transaction();

        let generator = KeyGenerator::new(3);
        let first = generator.next_key(&mut txn).unwrap();
        let second = generator.next_key(&mut txn).unwrap();
        assert_eq!(first, start_key(3) + 1);
        assert_eq!(second, first + 1);
        assert_eq!(decode_partition_id(second), 3);

        txn.commit().unwrap();
        assert_eq!(generator.current_key(&db.transaction()).unwrap(), second);
    }

    #[test]
    fn test_set_key_if_higher_ignores_foreign_and_lower_keys() {
        let dir = TempDir::new().unwrap();
        let db = StateDb::open(StateDbOptions {
            dir: dir.path().to_path_buf(),
            sync_on_commit: false,
        })
        .unwrap();
        let mut txn = db.transaction();
        let generator = KeyGenerator::new(1);

        assert!(generator.set_key_if_higher(&mut txn, start_key(1) + 50).unwrap());
        assert!(!generator.set_key_if_higher(&mut txn, start_key(1) + 10).unwrap());
        assert!(!generator.set_key_if_higher(&mut txn, start_key(2) + 99).unwrap());
        assert!(!generator.set_key_if_higher(&mut txn, -1).unwrap());

        assert_eq!(generator.next_key(&mut txn).unwrap(), start_key(1) + 51);
    }
}
