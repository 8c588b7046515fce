use std::fmt;

use crate::codec::{Record, RecordMetadata, RecordType};
use crate::storage::state::{KeyGenerator, Transaction};
use crate::traits::{CodecResult, StorageResult};
use crate::types::PartitionId;

/// Side effect run once the transaction of its command has committed.
pub type PostCommitTask = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

/// What a record processor sees while handling one record.
///
/// All state access goes through the transaction of the record being handled, so
/// nothing becomes visible unless the whole record is processed.
pub struct ProcessingContext<'a> {
    partition_id: PartitionId,
    txn: &'a mut Transaction,
    key_generator: &'a KeyGenerator,
}

impl<'a> ProcessingContext<'a> {
    pub(crate) fn new(
        partition_id: PartitionId,
        txn: &'a mut Transaction,
        key_generator: &'a KeyGenerator,
    ) -> Self {
        Self {
            partition_id,
            txn,
            key_generator,
        }
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    pub fn transaction(&self) -> &Transaction {
        &*self.txn
    }

    pub fn transaction_mut(&mut self) -> &mut Transaction {
        &mut *self.txn
    }

    /// Allocate a new entity key for this partition.
    pub fn next_key(&mut self) -> StorageResult<i64> {
        self.key_generator.next_key(&mut *self.txn)
    }
}

/// A record produced while processing a command, not yet written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowUpRecord {
    pub key: i64,
    pub metadata: RecordMetadata,
    pub value: Vec<u8>,
}

impl FollowUpRecord {
    pub fn to_record(&self) -> CodecResult<Record> {
        Record::with_metadata(self.key, &self.metadata, self.value.clone())
    }
}

/// Collects the output of processing one command: follow-up records and
/// post-commit tasks.
#[derive(Default)]
pub struct ProcessingResultBuilder {
    records: Vec<FollowUpRecord>,
    post_commit_tasks: Vec<PostCommitTask>,
}

impl fmt::Debug for ProcessingResultBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessingResultBuilder")
            .field("records", &self.records)
            .field("post_commit_tasks", &self.post_commit_tasks.len())
            .finish()
    }
}

impl ProcessingResultBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_record(&mut self, key: i64, metadata: RecordMetadata, value: impl Into<Vec<u8>>) {
        self.records.push(FollowUpRecord {
            key,
            metadata,
            value: value.into(),
        });
    }

    pub fn append_command(
        &mut self,
        key: i64,
        value_type: u16,
        intent: u8,
        value: impl Into<Vec<u8>>,
    ) {
        self.append_record(key, RecordMetadata::command(value_type, intent), value);
    }

    pub fn append_event(
        &mut self,
        key: i64,
        value_type: u16,
        intent: u8,
        value: impl Into<Vec<u8>>,
    ) {
        self.append_record(key, RecordMetadata::event(value_type, intent), value);
    }

    pub fn append_rejection(
        &mut self,
        key: i64,
        value_type: u16,
        intent: u8,
        reason: impl Into<String>,
        value: impl Into<Vec<u8>>,
    ) {
        self.append_record(
            key,
            RecordMetadata::rejection(value_type, intent, reason),
            value,
        );
    }

    pub fn append_post_commit_task<F>(&mut self, task: F)
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.post_commit_tasks.push(Box::new(task));
    }

    pub fn records(&self) -> &[FollowUpRecord] {
        &self.records
    }

    pub(crate) fn record_mut(&mut self, index: usize) -> Option<&mut FollowUpRecord> {
        self.records.get_mut(index)
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.post_commit_tasks.is_empty()
    }

    pub fn events(&self) -> impl Iterator<Item = &FollowUpRecord> {
        self.records
            .iter()
            .filter(|r| r.metadata.record_type == RecordType::Event)
    }

    pub(crate) fn reset(&mut self) {
        self.records.clear();
        self.post_commit_tasks.clear();
    }

    pub(crate) fn take(&mut self) -> (Vec<FollowUpRecord>, Vec<PostCommitTask>) {
        (
            std::mem::take(&mut self.records),
            std::mem::take(&mut self.post_commit_tasks),
        )
    }
}
