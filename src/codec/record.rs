use bincode::{Decode, Encode};

use crate::error::CodecError;
use crate::traits::CodecResult;
use crate::types::{Position, UNKEYED};

/// Kind of a record as seen by the stream processor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode)]
pub enum RecordType {
    Command,
    Event,
    CommandRejection,
}

/// Structured content of a record's metadata bytes.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct RecordMetadata {
    pub record_type: RecordType,
    pub value_type: u16,
    pub intent: u8,
    pub request_id: Option<u64>,
    pub rejection_reason: Option<String>,
    /// Follow-up command that was already processed inline with its cause.
    pub processed: bool,
}

impl RecordMetadata {
    pub fn new(record_type: RecordType, value_type: u16, intent: u8) -> Self {
        Self {
            record_type,
            value_type,
            intent,
            request_id: None,
            rejection_reason: None,
            processed: false,
        }
    }

    pub fn command(value_type: u16, intent: u8) -> Self {
        Self::new(RecordType::Command, value_type, intent)
    }

    pub fn event(value_type: u16, intent: u8) -> Self {
        Self::new(RecordType::Event, value_type, intent)
    }

    pub fn rejection(value_type: u16, intent: u8, reason: impl Into<String>) -> Self {
        Self {
            rejection_reason: Some(reason.into()),
            ..Self::new(RecordType::CommandRejection, value_type, intent)
        }
    }

    pub fn with_request_id(mut self, request_id: u64) -> Self {
        self.request_id = Some(request_id);
        self
    }

    pub fn encode(&self) -> CodecResult<Vec<u8>> {
        bincode::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CodecError::Metadata(e.to_string()))
    }

    pub fn decode(data: &[u8]) -> CodecResult<Self> {
        let (metadata, _) = bincode::decode_from_slice(data, bincode::config::standard())
            .map_err(|e| CodecError::Metadata(e.to_string()))?;
        Ok(metadata)
    }
}

/// A record handed to the sequencer. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Entity key, or `UNKEYED` when a new key must be assigned
    pub key: i64,
    /// Opaque metadata bytes, empty when absent
    pub metadata: Vec<u8>,
    pub value: Vec<u8>,
}

impl Record {
    pub fn new(key: i64, metadata: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            key,
            metadata,
            value,
        }
    }

    pub fn unkeyed(value: impl Into<Vec<u8>>) -> Self {
        Self::new(UNKEYED, Vec::new(), value.into())
    }

    pub fn with_metadata(
        key: i64,
        metadata: &RecordMetadata,
        value: impl Into<Vec<u8>>,
    ) -> CodecResult<Self> {
        Ok(Self::new(key, metadata.encode()?, value.into()))
    }

    pub fn command(
        key: i64,
        value_type: u16,
        intent: u8,
        value: impl Into<Vec<u8>>,
    ) -> CodecResult<Self> {
        Self::with_metadata(key, &RecordMetadata::command(value_type, intent), value)
    }

    pub fn event(
        key: i64,
        value_type: u16,
        intent: u8,
        value: impl Into<Vec<u8>>,
    ) -> CodecResult<Self> {
        Self::with_metadata(key, &RecordMetadata::event(value_type, intent), value)
    }

    pub fn is_unkeyed(&self) -> bool {
        self.key == UNKEYED
    }
}

/// On-disk / replicated form of a [`Record`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedEntry {
    pub position: Position,
    pub source_position: Position,
    pub timestamp: i64,
    pub key: i64,
    pub metadata: Vec<u8>,
    pub value: Vec<u8>,
}

impl LoggedEntry {
    pub fn has_metadata(&self) -> bool {
        !self.metadata.is_empty()
    }

    /// Decode the metadata, `None` if the record was written without any.
    pub fn read_metadata(&self) -> CodecResult<Option<RecordMetadata>> {
        if self.metadata.is_empty() {
            return Ok(None);
        }
        RecordMetadata::decode(&self.metadata).map(Some)
    }
}

/// Records sequenced into one write, sharing a source position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencedBatch {
    pub first_position: Position,
    pub source_position: Position,
    pub timestamp: i64,
    pub records: Vec<Record>,
}

impl SequencedBatch {
    pub fn new(
        first_position: Position,
        source_position: Position,
        timestamp: i64,
        records: Vec<Record>,
    ) -> Self {
        Self {
            first_position,
            source_position,
            timestamp,
            records,
        }
    }

    /// Position of the last record, `first_position - 1` for an (invalid) empty batch.
    pub fn highest_position(&self) -> Position {
        self.first_position + self.records.len() as i64 - 1
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
