use crate::error::ProcessingError;
use crate::types::{PartitionId, Position};

use super::record::TypedRecord;

/// Observes individual records flowing through a stream processor.
pub trait StreamProcessorListener: Send + Sync {
    /// A command was processed and its transaction committed.
    fn on_processed(&self, _record: &TypedRecord) {}

    /// A logged entry was passed over without processing.
    fn on_skipped(&self, _position: Position) {}

    /// An event was applied while replaying.
    fn on_replayed(&self, _record: &TypedRecord) {}
}

/// Lifecycle hooks of a stream processor.
pub trait StreamProcessorLifecycleAware: Send + Sync {
    /// Replay finished; `last_processed_position` is where processing resumes from.
    fn on_recovered(&self, _partition_id: PartitionId, _last_processed_position: Position) {}

    fn on_paused(&self, _partition_id: PartitionId) {}

    fn on_resumed(&self, _partition_id: PartitionId) {}

    /// Processing halted on `error` at `position`.
    fn on_failed(
        &self,
        _partition_id: PartitionId,
        _position: Position,
        _error: &ProcessingError,
    ) {
    }

    fn on_close(&self, _partition_id: PartitionId) {}
}
