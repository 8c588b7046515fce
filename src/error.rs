use thiserror::Error;
use tracing::{error, info, warn};

use crate::types::{PartitionId, Position};

/// Top-level error of the broker core
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Append error: {0}")]
    Append(#[from] AppendError),

    #[error("Replication error: {0}")]
    Replication(#[from] ReplicationError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Processing error: {0}")]
    Processing(#[from] ProcessingError),
}

/// Errors raised while encoding or decoding log records
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Buffer too small: required {required} bytes, available {available}")]
    BufferTooSmall { required: usize, available: usize },

    #[error("Truncated record at offset {offset}: needed {needed} more bytes")]
    Truncated { offset: usize, needed: usize },

    #[error("Invalid record metadata: {0}")]
    Metadata(String),
}

/// Outcome of a failed write through the sequencer / appender.
///
/// Only `NotLeader`, `InvalidRequest` and `Closed` ever reach the original caller;
/// `TransientIo` is absorbed by the appender's retry loop and only shows up in
/// listener notifications and logs.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AppendError {
    #[error("Transient I/O failure: {0}")]
    TransientIo(String),

    #[error("Not leader")]
    NotLeader,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Appender closed")]
    Closed,
}

impl From<CodecError> for AppendError {
    fn from(err: CodecError) -> Self {
        AppendError::InvalidRequest(err.to_string())
    }
}

/// Errors reported by the replication module we append to
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReplicationError {
    #[error("Replication I/O error: {0}")]
    Io(String),

    #[error("Not leader")]
    NotLeader,

    #[error("Invalid entry: {0}")]
    InvalidEntry(String),

    #[error("Replication module closed")]
    Closed,
}

impl From<ReplicationError> for AppendError {
    fn from(err: ReplicationError) -> Self {
        match err {
            ReplicationError::Io(msg) => AppendError::TransientIo(msg),
            ReplicationError::NotLeader => AppendError::NotLeader,
            ReplicationError::InvalidEntry(msg) => AppendError::InvalidRequest(msg),
            ReplicationError::Closed => AppendError::Closed,
        }
    }
}

/// Log, state and snapshot storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupted data: {0}")]
    DataCorruption(String),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Key already exists in column family {column_family}: {key:?}")]
    KeyExists { column_family: String, key: Vec<u8> },

    #[error("Key not found in column family {column_family}: {key:?}")]
    KeyNotFound { column_family: String, key: Vec<u8> },

    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("Storage closed")]
    Closed,

    #[error("Internal storage error: {0}")]
    Internal(String),
}

impl From<bincode::error::EncodeError> for StorageError {
    fn from(err: bincode::error::EncodeError) -> Self {
        StorageError::Encoding(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for StorageError {
    fn from(err: bincode::error::DecodeError) -> Self {
        StorageError::Encoding(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Encoding(err.to_string())
    }
}

/// Errors that halt a partition's stream processor
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("State error: {0}")]
    Storage(#[from] StorageError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Failed to write follow-up records: {0}")]
    Write(#[from] AppendError),

    #[error("No processor accepts value type {value_type} of record at position {position}")]
    NoProcessor { value_type: u16, position: Position },

    #[error("Handler failed: {0}")]
    Handler(#[from] anyhow::Error),

    #[error("Stream processor of partition {0} is closed")]
    Closed(PartitionId),
}

// === error classification ===
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Stops forward progress of the affected partition
    Fatal,
    /// May be retried at the layer that observed it
    Recoverable,
    /// Logged only
    Ignorable,
}

pub trait ErrorHandler {
    fn severity(&self) -> ErrorSeverity;
    fn context(&self) -> String;
}

impl ErrorHandler for ReplicationError {
    fn severity(&self) -> ErrorSeverity {
        match self {
            ReplicationError::Io(_) => ErrorSeverity::Recoverable,
            ReplicationError::NotLeader => ErrorSeverity::Fatal,
            ReplicationError::InvalidEntry(_) => ErrorSeverity::Fatal,
            ReplicationError::Closed => ErrorSeverity::Fatal,
        }
    }

    fn context(&self) -> String {
        match self {
            ReplicationError::Io(msg) => format!("replication I/O error: {}", msg),
            ReplicationError::NotLeader => "partition is not leader".to_string(),
            ReplicationError::InvalidEntry(msg) => format!("entry rejected as invalid: {}", msg),
            ReplicationError::Closed => "replication module closed".to_string(),
        }
    }
}

impl ErrorHandler for AppendError {
    fn severity(&self) -> ErrorSeverity {
        match self {
            AppendError::TransientIo(_) => ErrorSeverity::Recoverable,
            AppendError::NotLeader => ErrorSeverity::Fatal,
            AppendError::InvalidRequest(_) => ErrorSeverity::Ignorable,
            AppendError::Closed => ErrorSeverity::Fatal,
        }
    }

    fn context(&self) -> String {
        match self {
            AppendError::TransientIo(msg) => format!("transient append failure: {}", msg),
            AppendError::NotLeader => "not leader".to_string(),
            AppendError::InvalidRequest(msg) => format!("invalid write request: {}", msg),
            AppendError::Closed => "appender closed".to_string(),
        }
    }
}

impl ErrorHandler for StorageError {
    fn severity(&self) -> ErrorSeverity {
        match self {
            StorageError::Io(_) => ErrorSeverity::Fatal,
            StorageError::DataCorruption(_) => ErrorSeverity::Fatal,
            StorageError::Codec(_) => ErrorSeverity::Fatal,
            StorageError::Encoding(_) => ErrorSeverity::Fatal,
            StorageError::KeyExists { .. } => ErrorSeverity::Fatal,
            StorageError::KeyNotFound { .. } => ErrorSeverity::Fatal,
            StorageError::SnapshotNotFound(_) => ErrorSeverity::Recoverable,
            StorageError::Closed => ErrorSeverity::Fatal,
            StorageError::Internal(_) => ErrorSeverity::Fatal,
        }
    }

    fn context(&self) -> String {
        self.to_string()
    }
}

impl ErrorHandler for ProcessingError {
    fn severity(&self) -> ErrorSeverity {
        match self {
            ProcessingError::Storage(e) => e.severity(),
            ProcessingError::Closed(_) => ErrorSeverity::Ignorable,
            _ => ErrorSeverity::Fatal,
        }
    }

    fn context(&self) -> String {
        match self {
            ProcessingError::NoProcessor {
                value_type,
                position,
            } => format!(
                "no record processor for value type {} at position {}",
                value_type, position
            ),
            other => other.to_string(),
        }
    }
}

/// Log an error at the level matching its severity.
pub fn log_error<E: ErrorHandler>(error: &E, operation: &str, partition_id: PartitionId) {
    match error.severity() {
        ErrorSeverity::Fatal => {
            error!(
                "[FATAL] {} on partition {} failed: {}",
                operation,
                partition_id,
                error.context()
            );
        }
        ErrorSeverity::Recoverable => {
            warn!(
                "[RECOVERABLE] {} on partition {} failed: {} - will retry",
                operation,
                partition_id,
                error.context()
            );
        }
        ErrorSeverity::Ignorable => {
            info!(
                "[IGNORABLE] {} on partition {} failed: {}",
                operation,
                partition_id,
                error.context()
            );
        }
    }
}
