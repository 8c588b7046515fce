use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

use crate::codec::{LoggedEntry, deserialize_batch};
use crate::commit::CommitListenerRegistry;
use crate::error::{ReplicationError, StorageError};
use crate::traits::{
    LogAppendStorage, LogCompactionStorage, LogReadStorage, ReplicationResult, StorageResult,
};
use crate::types::{Commit, LogIndex, PartitionId, Position, UNSET_POSITION};

use super::entry::BatchRecord;
use super::manager::{DiskStats, SegmentManager, SegmentManagerOptions};

fn internal(e: anyhow::Error) -> StorageError {
    StorageError::Internal(format!("{:#}", e))
}

/// Single-node replication over local segments.
///
/// Every accepted append is written to the active segment and committed at once
/// (a quorum of one), after which the commit listener registry is notified.
pub struct SegmentedLogStorage {
    partition_id: PartitionId,
    manager: Arc<SegmentManager>,
    registry: Arc<CommitListenerRegistry>,
    leader: AtomicBool,
    closed: AtomicBool,
    /// Serializes appends; held across the blocking write
    write_lock: Mutex<()>,
    next_index: AtomicI64,
    commit_position: AtomicI64,
}

impl SegmentedLogStorage {
    pub fn open(
        partition_id: PartitionId,
        options: SegmentManagerOptions,
        registry: Arc<CommitListenerRegistry>,
    ) -> StorageResult<Self> {
        let manager = SegmentManager::new(options).map_err(internal)?;

        let (next_index, commit_position) = match manager.last_batch() {
            Some(last) => (last.index + 1, last.highest_position),
            None => (1, UNSET_POSITION),
        };

        info!(
            "Opened log of partition {}: next_index={}, commit_position={}, {}",
            partition_id,
            next_index,
            commit_position,
            manager.get_disk_stats().to_human_readable()
        );

        Ok(Self {
            partition_id,
            manager: Arc::new(manager),
            registry,
            leader: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            write_lock: Mutex::new(()),
            next_index: AtomicI64::new(next_index),
            commit_position: AtomicI64::new(commit_position),
        })
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    pub fn registry(&self) -> &Arc<CommitListenerRegistry> {
        &self.registry
    }

    pub fn step_down(&self) {
        if self.leader.swap(false, Ordering::SeqCst) {
            info!("Partition {} stepped down", self.partition_id);
        }
    }

    pub fn become_leader(&self) {
        if !self.leader.swap(true, Ordering::SeqCst) {
            info!("Partition {} became leader", self.partition_id);
        }
    }

    /// Lowest position still held by the log.
    pub fn first_position(&self) -> Option<Position> {
        self.manager.first_position()
    }

    pub fn disk_stats(&self) -> DiskStats {
        self.manager.get_disk_stats()
    }

    pub fn segment_count(&self) -> usize {
        self.manager.segment_count()
    }

    /// Flush and refuse further appends.
    pub fn close(&self) -> StorageResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.manager.sync_all().map_err(internal)?;
        info!("Closed log of partition {}", self.partition_id);
        Ok(())
    }
}

#[async_trait]
impl LogAppendStorage for SegmentedLogStorage {
    async fn append(
        &self,
        lowest_position: Position,
        highest_position: Position,
        data: Vec<u8>,
    ) -> ReplicationResult<LogIndex> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ReplicationError::Closed);
        }
        if !self.is_leader() {
            return Err(ReplicationError::NotLeader);
        }
        if data.is_empty() || lowest_position < 0 || highest_position < lowest_position {
            return Err(ReplicationError::InvalidEntry(format!(
                "invalid range [{}, {}] with {} bytes",
                lowest_position,
                highest_position,
                data.len()
            )));
        }

        let _guard = self.write_lock.lock().await;

        // A retry of an append that already made it to disk resolves to the same index
        if let Some(existing) = self.manager.find_batch(lowest_position, highest_position) {
            debug!(
                "Partition {}: range [{}, {}] already written at index {}",
                self.partition_id, lowest_position, highest_position, existing.index
            );
            return Ok(existing.index);
        }

        let last_position = self.commit_position.load(Ordering::Acquire);
        if last_position != UNSET_POSITION && lowest_position != last_position + 1 {
            return Err(ReplicationError::InvalidEntry(format!(
                "range [{}, {}] does not follow last position {}",
                lowest_position, highest_position, last_position
            )));
        }

        let index = self.next_index.load(Ordering::Acquire);
        let record = BatchRecord {
            index,
            lowest_position,
            highest_position,
            data,
        };

        let manager = self.manager.clone();
        tokio::task::spawn_blocking(move || manager.write_batch(&record))
            .await
            .map_err(|e| ReplicationError::Io(format!("write task failed: {}", e)))?
            .map_err(|e| {
                warn!(
                    "Partition {}: failed to write [{}, {}]: {:#}",
                    self.partition_id, lowest_position, highest_position, e
                );
                ReplicationError::Io(format!("{:#}", e))
            })?;

        self.next_index.store(index + 1, Ordering::Release);
        self.commit_position
            .store(highest_position, Ordering::Release);
        trace!(
            "Partition {} committed [{}, {}] at index {}",
            self.partition_id, lowest_position, highest_position, index
        );

        self.registry
            .notify_commit(Commit::new(index, highest_position));
        Ok(index)
    }

    async fn last_written_position(&self) -> ReplicationResult<Position> {
        Ok(self
            .manager
            .last_batch()
            .map(|b| b.highest_position)
            .unwrap_or(UNSET_POSITION))
    }

    fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LogReadStorage for SegmentedLogStorage {
    async fn read_from(
        &self,
        from_position: Position,
        max_entries: usize,
    ) -> StorageResult<Vec<LoggedEntry>> {
        let commit_position = self.commit_position();
        if from_position > commit_position || max_entries == 0 {
            return Ok(Vec::new());
        }

        let batches = self
            .manager
            .read_batches(from_position, commit_position, max_entries)
            .await
            .map_err(internal)?;

        let mut entries = Vec::new();
        'batches: for batch in batches {
            for entry in deserialize_batch(&batch.data)? {
                if entry.position < from_position || entry.position > commit_position {
                    continue;
                }
                if entries.len() == max_entries {
                    break 'batches;
                }
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    fn commit_position(&self) -> Position {
        self.commit_position.load(Ordering::Acquire)
    }
}

#[async_trait]
impl LogCompactionStorage for SegmentedLogStorage {
    async fn delete_before(&self, bound: Position) -> StorageResult<usize> {
        let manager = self.manager.clone();
        let removed = tokio::task::spawn_blocking(move || manager.delete_before(bound))
            .await
            .map_err(|e| StorageError::Internal(format!("delete task failed: {}", e)))?
            .map_err(internal)?;

        if removed > 0 {
            info!(
                "Partition {}: deleted {} segment(s) below position {}",
                self.partition_id, removed, bound
            );
        }
        Ok(removed)
    }
}
