use std::fmt;
use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::StorageError;
use crate::traits::StorageResult;

use super::key::DbKey;
use super::transaction::Transaction;

/// First id available to [`ColumnFamily::Custom`]; lower ids are reserved.
pub const FIRST_CUSTOM_COLUMN_FAMILY: u16 = 16;

/// Named key space inside a partition's state.
///
/// Keys of a family are stored behind its 2-byte big-endian id, so families never
/// overlap and iteration over one family is a prefix scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnFamily {
    Default,
    Key,
    LastProcessedPosition,
    /// Application family; ids below [`FIRST_CUSTOM_COLUMN_FAMILY`] are reserved
    Custom(u16),
}

impl ColumnFamily {
    pub fn id(self) -> u16 {
        match self {
            ColumnFamily::Default => 0,
            ColumnFamily::Key => 1,
            ColumnFamily::LastProcessedPosition => 2,
            ColumnFamily::Custom(id) => id,
        }
    }

    pub fn prefix(self) -> [u8; 2] {
        self.id().to_be_bytes()
    }
}

impl fmt::Display for ColumnFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnFamily::Default => write!(f, "DEFAULT"),
            ColumnFamily::Key => write!(f, "KEY"),
            ColumnFamily::LastProcessedPosition => write!(f, "LAST_PROCESSED_POSITION"),
            ColumnFamily::Custom(id) => write!(f, "CUSTOM_{}", id),
        }
    }
}

/// Typed view of one column family.
///
/// Holds no data itself; every access goes through the transaction passed in, so
/// reads see the transaction's own uncommitted writes.
pub struct TypedColumnFamily<K, V> {
    family: ColumnFamily,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> Clone for TypedColumnFamily<K, V> {
    fn clone(&self) -> Self {
        Self::new(self.family)
    }
}

impl<K, V> fmt::Debug for TypedColumnFamily<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedColumnFamily")
            .field("family", &self.family)
            .finish()
    }
}

impl<K, V> TypedColumnFamily<K, V> {
    pub fn new(family: ColumnFamily) -> Self {
        Self {
            family,
            _marker: PhantomData,
        }
    }

    pub fn family(&self) -> ColumnFamily {
        self.family
    }
}

impl<K: DbKey, V: Serialize + DeserializeOwned> TypedColumnFamily<K, V> {
    fn full_key(&self, key: &K) -> Vec<u8> {
        let mut out = self.family.prefix().to_vec();
        key.write_key(&mut out);
        out
    }

    fn encode_value(value: &V) -> StorageResult<Vec<u8>> {
        Ok(bincode::serde::encode_to_vec(
            value,
            bincode::config::standard(),
        )?)
    }

    fn decode_value(data: &[u8]) -> StorageResult<V> {
        let (value, _) = bincode::serde::decode_from_slice(data, bincode::config::standard())?;
        Ok(value)
    }

    fn decode_entry(&self, raw_key: &[u8], raw_value: &[u8]) -> StorageResult<(K, V)> {
        let key = K::decode_key(&raw_key[2..])?;
        Ok((key, Self::decode_value(raw_value)?))
    }

    pub fn get(&self, txn: &Transaction, key: &K) -> StorageResult<Option<V>> {
        txn.get(&self.full_key(key))
            .map(|raw| Self::decode_value(&raw))
            .transpose()
    }

    pub fn exists(&self, txn: &Transaction, key: &K) -> bool {
        txn.contains(&self.full_key(key))
    }

    /// Insert a new entry; fails if the key is already present.
    pub fn insert(&self, txn: &mut Transaction, key: &K, value: &V) -> StorageResult<()> {
        let full_key = self.full_key(key);
        if txn.contains(&full_key) {
            return Err(StorageError::KeyExists {
                column_family: self.family.to_string(),
                key: full_key,
            });
        }
        txn.put(full_key, Self::encode_value(value)?);
        Ok(())
    }

    /// Replace an existing entry; fails if the key is absent.
    pub fn update(&self, txn: &mut Transaction, key: &K, value: &V) -> StorageResult<()> {
        let full_key = self.full_key(key);
        if !txn.contains(&full_key) {
            return Err(StorageError::KeyNotFound {
                column_family: self.family.to_string(),
                key: full_key,
            });
        }
        txn.put(full_key, Self::encode_value(value)?);
        Ok(())
    }

    pub fn upsert(&self, txn: &mut Transaction, key: &K, value: &V) -> StorageResult<()> {
        txn.put(self.full_key(key), Self::encode_value(value)?);
        Ok(())
    }

    /// Delete an entry; fails if the key is absent.
    pub fn delete_existing(&self, txn: &mut Transaction, key: &K) -> StorageResult<()> {
        let full_key = self.full_key(key);
        if !txn.contains(&full_key) {
            return Err(StorageError::KeyNotFound {
                column_family: self.family.to_string(),
                key: full_key,
            });
        }
        txn.delete(full_key);
        Ok(())
    }

    /// Returns whether an entry was deleted.
    pub fn delete_if_exists(&self, txn: &mut Transaction, key: &K) -> bool {
        let full_key = self.full_key(key);
        let existed = txn.contains(&full_key);
        if existed {
            txn.delete(full_key);
        }
        existed
    }

    pub fn is_empty(&self, txn: &Transaction) -> bool {
        txn.scan_prefix(&self.family.prefix()).is_empty()
    }

    pub fn for_each<F>(&self, txn: &Transaction, mut visitor: F) -> StorageResult<()>
    where
        F: FnMut(K, V),
    {
        self.while_true(txn, |k, v| {
            visitor(k, v);
            true
        })
    }

    /// Visit entries in key order until `visitor` returns false.
    pub fn while_true<F>(&self, txn: &Transaction, visitor: F) -> StorageResult<()>
    where
        F: FnMut(K, V) -> bool,
    {
        self.visit_prefix(txn, self.family.prefix().to_vec(), visitor)
    }

    /// Visit, in key order, the entries whose key starts with `prefix` until
    /// `visitor` returns false.
    pub fn while_equal_prefix<P, F>(
        &self,
        txn: &Transaction,
        prefix: &P,
        visitor: F,
    ) -> StorageResult<()>
    where
        P: DbKey,
        F: FnMut(K, V) -> bool,
    {
        let mut full_prefix = self.family.prefix().to_vec();
        prefix.write_key(&mut full_prefix);
        self.visit_prefix(txn, full_prefix, visitor)
    }

    fn visit_prefix<F>(
        &self,
        txn: &Transaction,
        prefix: Vec<u8>,
        mut visitor: F,
    ) -> StorageResult<()>
    where
        F: FnMut(K, V) -> bool,
    {
        for (raw_key, raw_value) in txn.scan_prefix(&prefix) {
            let (key, value) = self.decode_entry(&raw_key, &raw_value)?;
            if !visitor(key, value) {
                break;
            }
        }
        Ok(())
    }
}
