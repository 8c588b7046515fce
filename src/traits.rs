use async_trait::async_trait;

use crate::codec::{LoggedEntry, Record};
use crate::error::{
    AppendError, BrokerError, CodecError, ProcessingError, ReplicationError, StorageError,
};
use crate::storage::snapshot::PersistedSnapshot;
use crate::types::{Commit, LogIndex, Position};

// Result aliases
pub type BrokerResult<T> = Result<T, BrokerError>;
pub type CodecResult<T> = Result<T, CodecError>;
pub type AppendResult<T> = Result<T, AppendError>;
pub type ReplicationResult<T> = Result<T, ReplicationError>;
pub type StorageResult<T> = Result<T, StorageError>;
pub type ProcessingResult<T> = Result<T, ProcessingError>;

/// Append primitive of the replication module.
///
/// `append` resolves to the replication index assigned to the bytes once they are
/// accepted locally. A negative index means the module rejected the append; callers
/// retry the very same range and bytes.
#[async_trait]
pub trait LogAppendStorage: Send + Sync {
    async fn append(
        &self,
        lowest_position: Position,
        highest_position: Position,
        data: Vec<u8>,
    ) -> ReplicationResult<LogIndex>;

    /// Highest record position durably written, `UNSET_POSITION` for an empty log.
    async fn last_written_position(&self) -> ReplicationResult<Position>;

    fn is_leader(&self) -> bool;
}

/// Read side of the log used by the stream processor.
#[async_trait]
pub trait LogReadStorage: Send + Sync {
    /// Read committed entries with `position >= from_position`, in position order.
    async fn read_from(
        &self,
        from_position: Position,
        max_entries: usize,
    ) -> StorageResult<Vec<LoggedEntry>>;

    /// Highest committed record position.
    fn commit_position(&self) -> Position;
}

#[async_trait]
pub trait LogCompactionStorage: Send + Sync {
    /// Delete log data strictly below `bound`; returns the number of segments removed.
    async fn delete_before(&self, bound: Position) -> StorageResult<usize>;
}

/// Everything a partition needs from its log.
pub trait LogStorage: LogAppendStorage + LogReadStorage + LogCompactionStorage {}

impl<T> LogStorage for T where T: LogAppendStorage + LogReadStorage + LogCompactionStorage {}

/// Receives commit notifications from the replication module.
pub trait CommitListener: Send + Sync {
    fn on_commit(&self, commit: Commit);

    fn on_commit_error(&self, _index: LogIndex, _error: &ReplicationError) {}
}

/// Per-append notifications. Lives for exactly one in-flight append.
pub trait AppendListener: Send + Sync {
    fn on_write(&self, _index: LogIndex) {}

    fn on_write_error(&self, _error: &AppendError) {}

    fn on_commit(&self, _index: LogIndex) {}

    fn on_commit_error(&self, _index: LogIndex, _error: &ReplicationError) {}
}

/// Notified once a snapshot has been durably persisted.
pub trait PersistedSnapshotListener: Send + Sync {
    fn on_new_snapshot(&self, snapshot: &PersistedSnapshot);
}

/// Writer used by record processors to emit follow-up records.
pub trait LogStreamWriter: Send + Sync {
    /// Sequence `records` as one batch and return the position of the first record.
    fn write(&self, records: Vec<Record>, source_position: Position) -> AppendResult<Position>;
}
