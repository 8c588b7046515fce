//! Column-family state of a partition.
//!
//! # Layout
//!
//! ```text
//! {state_dir}/
//! └── state.log        # CRC-framed write batches, one per committed transaction
//! ```
//!
//! Every key is `family id (u16, big-endian) ++ DbKey encoding`, so each column
//! family is a contiguous, ordered range of the store.

mod column_family;
mod db;
mod key;
mod key_generator;
mod last_processed;
mod transaction;

#[cfg(test)]
mod tests;

pub use column_family::{ColumnFamily, FIRST_CUSTOM_COLUMN_FAMILY, TypedColumnFamily};
pub use db::{StateDb, StateDbOptions, WriteBatch, WriteOp};
pub use key::DbKey;
pub use key_generator::{KEY_BITS, KeyGenerator, decode_partition_id, start_key};
pub use last_processed::LastProcessedPositionState;
pub use transaction::Transaction;
