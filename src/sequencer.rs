use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use crate::codec::{Record, SequencedBatch, serialize_batch, serialized_length};
use crate::error::AppendError;
use crate::traits::{
    AppendListener, AppendResult, LogAppendStorage, LogStreamWriter, ReplicationResult,
};
use crate::types::{PartitionId, Position, now_millis};

/// Default upper bound for the serialized size of one batch (4MB)
pub const DEFAULT_MAX_BATCH_BYTES: usize = 4 * 1024 * 1024;

pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

#[derive(Clone)]
pub struct SequencerOptions {
    pub max_batch_bytes: usize,
    /// Source of record timestamps
    pub clock: Clock,
}

impl Default for SequencerOptions {
    fn default() -> Self {
        Self {
            max_batch_bytes: DEFAULT_MAX_BATCH_BYTES,
            clock: Arc::new(now_millis),
        }
    }
}

impl fmt::Debug for SequencerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SequencerOptions")
            .field("max_batch_bytes", &self.max_batch_bytes)
            .finish()
    }
}

/// A sequenced batch ready for the appender.
pub struct SerializedBatch {
    pub lowest_position: Position,
    pub highest_position: Position,
    pub data: Vec<u8>,
    pub listener: Option<Arc<dyn AppendListener>>,
}

impl fmt::Debug for SerializedBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerializedBatch")
            .field("lowest_position", &self.lowest_position)
            .field("highest_position", &self.highest_position)
            .field("bytes", &self.data.len())
            .finish()
    }
}

struct SequencerState {
    last_position: Position,
}

/// Single point of position assignment for a partition.
///
/// Positions are reserved under one lock together with the hand-off to the appender
/// channel, so batches reach the appender in position order and a position is only
/// consumed once its batch has been handed off.
pub struct Sequencer {
    partition_id: PartitionId,
    storage: Arc<dyn LogAppendStorage>,
    options: SequencerOptions,
    state: Mutex<SequencerState>,
    sink: mpsc::UnboundedSender<SerializedBatch>,
}

impl Sequencer {
    /// Recover the last written position and open the sequencer.
    pub async fn open(
        partition_id: PartitionId,
        storage: Arc<dyn LogAppendStorage>,
        options: SequencerOptions,
    ) -> ReplicationResult<(Self, mpsc::UnboundedReceiver<SerializedBatch>)> {
        let last_position = storage.last_written_position().await?;
        info!(
            "Sequencer for partition {} opened at last position {}",
            partition_id, last_position
        );

        let (sink, rx) = mpsc::unbounded_channel();
        Ok((
            Self {
                partition_id,
                storage,
                options,
                state: Mutex::new(SequencerState {
                    last_position: last_position.max(0),
                }),
                sink,
            },
            rx,
        ))
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    /// Position of the most recently sequenced record, 0 before the first write.
    pub fn last_position(&self) -> Position {
        self.state.lock().last_position
    }

    pub fn is_closed(&self) -> bool {
        self.sink.is_closed()
    }

    /// Sequence `records` as one batch and return the first assigned position.
    pub fn write_with_listener(
        &self,
        records: Vec<Record>,
        source_position: Position,
        listener: Option<Arc<dyn AppendListener>>,
    ) -> AppendResult<Position> {
        if records.is_empty() {
            return Err(AppendError::InvalidRequest(
                "expected at least one record".to_string(),
            ));
        }

        let batch_bytes: usize = records.iter().map(serialized_length).sum();
        if batch_bytes > self.options.max_batch_bytes {
            return Err(AppendError::InvalidRequest(format!(
                "batch of {} bytes exceeds limit of {} bytes",
                batch_bytes, self.options.max_batch_bytes
            )));
        }

        let mut state = self.state.lock();

        // A sink closed by leader loss still reports the lost leadership
        if !self.storage.is_leader() {
            debug!(
                "Rejecting write on partition {}: not leader",
                self.partition_id
            );
            return Err(AppendError::NotLeader);
        }
        if self.sink.is_closed() {
            return Err(AppendError::Closed);
        }

        let first_position = state.last_position + 1;
        let batch = SequencedBatch::new(
            first_position,
            source_position,
            (self.options.clock)(),
            records,
        );
        let data = serialize_batch(&batch)?;
        let highest_position = batch.highest_position();

        self.sink
            .send(SerializedBatch {
                lowest_position: first_position,
                highest_position,
                data,
                listener,
            })
            .map_err(|_| AppendError::Closed)?;

        state.last_position = highest_position;
        trace!(
            "Partition {} sequenced positions [{}, {}] (source {})",
            self.partition_id, first_position, highest_position, source_position
        );

        Ok(first_position)
    }
}

impl LogStreamWriter for Sequencer {
    fn write(&self, records: Vec<Record>, source_position: Position) -> AppendResult<Position> {
        self.write_with_listener(records, source_position, None)
    }
}
