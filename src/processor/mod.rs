//! Stream processor: applies committed records to a partition's state.
//!
//! One actor task per partition owns the state transaction, the record processors
//! and the read cursor. It moves through
//!
//! ```text
//! Initializing -> Replaying -> Processing <-> Paused
//!                                  |
//!                                Error -> (resume) Replaying
//! any -> Closing -> Closed
//! ```
//!
//! Commands are handed to the [`RecordProcessor`] accepting their value type.
//! Processors decide and emit events; state changes are made when an event is
//! applied through [`RecordProcessor::replay`], both while processing and while
//! replaying the log after a restart, so the two paths cannot diverge.

mod context;
mod listener;
mod record;
mod stream_processor;

use serde::{Deserialize, Serialize};

use crate::error::ProcessingError;

pub use context::{FollowUpRecord, PostCommitTask, ProcessingContext, ProcessingResultBuilder};
pub use listener::{StreamProcessorLifecycleAware, StreamProcessorListener};
pub use record::TypedRecord;
pub use stream_processor::{StateSnapshot, StreamProcessorBuilder, StreamProcessorHandle};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorOptions {
    /// Commands processed in one transaction, the triggering command included
    pub max_commands_in_batch: usize,
    /// Entries read (and committed) per step while replaying
    pub replay_batch_size: usize,
    /// Entries read per step while processing
    pub read_batch_size: usize,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            max_commands_in_batch: 100,
            replay_batch_size: 1_000,
            read_batch_size: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Initializing,
    Replaying,
    Processing,
    Paused,
    /// Halted on a processing failure until resumed
    Error,
    Closing,
    Closed,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Initializing => "INITIALIZING",
            Phase::Replaying => "REPLAYING",
            Phase::Processing => "PROCESSING",
            Phase::Paused => "PAUSED",
            Phase::Error => "ERROR",
            Phase::Closing => "CLOSING",
            Phase::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// Outcome of [`RecordProcessor::on_processing_error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorHandling {
    /// The processor wrote its own outcome (typically a rejection); processing continues
    Handled,
    /// Processing halts in [`Phase::Error`]
    Unhandled,
}

/// Domain logic for a set of value types.
///
/// `process` runs for commands only and must not change state directly: it emits
/// events (and follow-up commands, rejections, post-commit tasks) through the
/// result builder. Each emitted event is applied right away through `replay`, which
/// is also what runs for logged events after a restart.
pub trait RecordProcessor: Send {
    fn accepts(&self, value_type: u16) -> bool;

    /// Called once before replay.
    fn init(&mut self, _ctx: &mut ProcessingContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    fn process(
        &mut self,
        record: &TypedRecord,
        ctx: &mut ProcessingContext<'_>,
        result: &mut ProcessingResultBuilder,
    ) -> anyhow::Result<()>;

    /// Apply the state change of an event.
    fn replay(
        &mut self,
        record: &TypedRecord,
        ctx: &mut ProcessingContext<'_>,
    ) -> anyhow::Result<()>;

    /// Called with a fresh transaction and result after `process` failed.
    fn on_processing_error(
        &mut self,
        _error: &ProcessingError,
        _record: &TypedRecord,
        _ctx: &mut ProcessingContext<'_>,
        _result: &mut ProcessingResultBuilder,
    ) -> ErrorHandling {
        ErrorHandling::Unhandled
    }
}
