//! Partitioned log and stream-processing core of a workflow broker.
//!
//! Per partition, records are sequenced into batches with monotonic positions,
//! appended to the replication module with transparent retry, and, once committed,
//! applied by a single stream processor to the column-family state. Snapshots of
//! that state bound how much log must be kept.

pub mod appender;
pub mod codec;
pub mod commit;
pub mod compactor;
pub mod config;
pub mod error;
pub mod partition;
pub mod processor;
pub mod sequencer;
pub mod storage;
pub mod traits;
pub mod types;

pub use appender::{AppenderOptions, LogAppender};
pub use codec::{LoggedEntry, Record, RecordMetadata, RecordType, SequencedBatch};
pub use commit::{CommitListenerRegistry, ListenerId};
pub use compactor::LogDeletionService;
pub use config::PartitionConfig;
pub use error::{
    AppendError, BrokerError, CodecError, ErrorHandler, ErrorSeverity, ProcessingError,
    ReplicationError, StorageError,
};
pub use partition::Partition;
pub use processor::{
    ErrorHandling, Phase, ProcessingContext, ProcessingResultBuilder, ProcessorOptions,
    RecordProcessor, StreamProcessorBuilder, StreamProcessorHandle, TypedRecord,
};
pub use sequencer::{Sequencer, SequencerOptions};
pub use traits::*;
pub use types::{Commit, LogIndex, PartitionId, Position, UNKEYED, UNSET_POSITION};
