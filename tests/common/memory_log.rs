use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use stream_broker::codec::{Record, SequencedBatch, deserialize_batch, serialize_batch};
use stream_broker::error::{ReplicationError, StorageError};
use stream_broker::{
    Commit, CommitListenerRegistry, LogAppendStorage, LogCompactionStorage, LogIndex,
    LogReadStorage, LoggedEntry, Position, ReplicationResult, StorageResult, UNSET_POSITION,
};

pub type AppendCall = (Position, Position, Vec<u8>);

struct StoredBatch {
    index: LogIndex,
    lowest_position: Position,
    highest_position: Position,
}

#[derive(Default)]
struct Inner {
    batches: Vec<StoredBatch>,
    entries: Vec<LoggedEntry>,
    calls: Vec<AppendCall>,
    commit_position: Position,
}

/// In-memory replication module.
///
/// Scripted replies are returned (one per call) before appends start succeeding,
/// which is how transient failures and negative indexes are simulated. Accepted
/// appends commit immediately and notify the registry.
pub struct MemoryLog {
    registry: Arc<CommitListenerRegistry>,
    inner: Mutex<Inner>,
    script: Mutex<VecDeque<ReplicationResult<LogIndex>>>,
    leader: AtomicBool,
}

impl MemoryLog {
    pub fn new(registry: Arc<CommitListenerRegistry>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            inner: Mutex::new(Inner {
                commit_position: UNSET_POSITION,
                ..Default::default()
            }),
            script: Mutex::new(VecDeque::new()),
            leader: AtomicBool::new(true),
        })
    }

    pub fn script(&self, replies: Vec<ReplicationResult<LogIndex>>) {
        self.script.lock().extend(replies);
    }

    pub fn set_leader(&self, leader: bool) {
        self.leader.store(leader, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<AppendCall> {
        self.inner.lock().calls.clone()
    }

    pub fn entries(&self) -> Vec<LoggedEntry> {
        self.inner.lock().entries.clone()
    }

    /// Write a batch straight into the log, bypassing sequencer and appender.
    pub fn write_raw(
        &self,
        first_position: Position,
        source_position: Position,
        records: Vec<Record>,
    ) -> Position {
        let batch = SequencedBatch::new(first_position, source_position, 1, records);
        let highest = batch.highest_position();
        let data = serialize_batch(&batch).unwrap();
        let commit = self.store(first_position, highest, &data).unwrap();
        self.registry.notify_commit(commit);
        highest
    }

    fn store(&self, lowest: Position, highest: Position, data: &[u8]) -> ReplicationResult<Commit> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner
            .batches
            .iter()
            .find(|b| b.lowest_position == lowest && b.highest_position == highest)
        {
            return Ok(Commit::new(existing.index, highest));
        }

        let entries =
            deserialize_batch(data).map_err(|e| ReplicationError::InvalidEntry(e.to_string()))?;
        let index = inner.batches.len() as LogIndex + 1;
        inner.batches.push(StoredBatch {
            index,
            lowest_position: lowest,
            highest_position: highest,
        });
        inner.entries.extend(entries);
        inner.commit_position = highest;
        Ok(Commit::new(index, highest))
    }
}

#[async_trait]
impl LogAppendStorage for MemoryLog {
    async fn append(
        &self,
        lowest_position: Position,
        highest_position: Position,
        data: Vec<u8>,
    ) -> ReplicationResult<LogIndex> {
        self.inner
            .lock()
            .calls
            .push((lowest_position, highest_position, data.clone()));

        if let Some(reply) = self.script.lock().pop_front() {
            return reply;
        }
        if !self.is_leader() {
            return Err(ReplicationError::NotLeader);
        }

        let commit = self.store(lowest_position, highest_position, &data)?;
        self.registry.notify_commit(commit);
        Ok(commit.index)
    }

    async fn last_written_position(&self) -> ReplicationResult<Position> {
        Ok(self
            .inner
            .lock()
            .batches
            .last()
            .map(|b| b.highest_position)
            .unwrap_or(UNSET_POSITION))
    }

    fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LogReadStorage for MemoryLog {
    async fn read_from(
        &self,
        from_position: Position,
        max_entries: usize,
    ) -> StorageResult<Vec<LoggedEntry>> {
        let inner = self.inner.lock();
        Ok(inner
            .entries
            .iter()
            .filter(|e| e.position >= from_position && e.position <= inner.commit_position)
            .take(max_entries)
            .cloned()
            .collect())
    }

    fn commit_position(&self) -> Position {
        self.inner.lock().commit_position
    }
}

#[async_trait]
impl LogCompactionStorage for MemoryLog {
    async fn delete_before(&self, bound: Position) -> StorageResult<usize> {
        if bound < 0 {
            return Err(StorageError::Internal(format!("invalid bound {}", bound)));
        }
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|e| e.position >= bound);
        Ok(before - inner.entries.len())
    }
}
