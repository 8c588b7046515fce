use crate::codec::{LoggedEntry, RecordMetadata, RecordType};
use crate::traits::CodecResult;
use crate::types::{Position, UNSET_POSITION};

/// A logged record together with its decoded metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypedRecord {
    pub position: Position,
    pub source_position: Position,
    pub timestamp: i64,
    pub key: i64,
    pub metadata: RecordMetadata,
    pub value: Vec<u8>,
}

impl TypedRecord {
    /// `None` for entries written without metadata.
    pub fn from_entry(entry: &LoggedEntry) -> CodecResult<Option<Self>> {
        Ok(entry.read_metadata()?.map(|metadata| Self {
            position: entry.position,
            source_position: entry.source_position,
            timestamp: entry.timestamp,
            key: entry.key,
            metadata,
            value: entry.value.clone(),
        }))
    }

    /// A follow-up command processed inline, before it has a position of its own.
    pub(crate) fn inline(
        source_position: Position,
        timestamp: i64,
        key: i64,
        metadata: RecordMetadata,
        value: Vec<u8>,
    ) -> Self {
        Self {
            position: UNSET_POSITION,
            source_position,
            timestamp,
            key,
            metadata,
            value,
        }
    }

    pub fn record_type(&self) -> RecordType {
        self.metadata.record_type
    }

    pub fn value_type(&self) -> u16 {
        self.metadata.value_type
    }

    pub fn intent(&self) -> u8 {
        self.metadata.intent
    }

    pub fn is_command(&self) -> bool {
        self.metadata.record_type == RecordType::Command
    }

    pub fn is_event(&self) -> bool {
        self.metadata.record_type == RecordType::Event
    }

    /// Whether the record was written as a follow-up of a processed command.
    pub fn has_source(&self) -> bool {
        self.source_position >= 0
    }
}
