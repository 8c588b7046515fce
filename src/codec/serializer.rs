//! Fixed binary layout of a logged record.
//!
//! ```text
//! | position i64 | source_position i64 | timestamp i64 | key i64 |
//! | metadata_length u16 | value_length u32 | metadata ... | value ... |
//! ```
//!
//! All integers are little endian. A zero metadata length means "no metadata".

use crate::error::CodecError;
use crate::traits::CodecResult;
use crate::types::Position;

use super::record::{LoggedEntry, Record, SequencedBatch};

const POSITION_OFFSET: usize = 0;
const SOURCE_POSITION_OFFSET: usize = 8;
const TIMESTAMP_OFFSET: usize = 16;
const KEY_OFFSET: usize = 24;
const METADATA_LENGTH_OFFSET: usize = 32;
const VALUE_LENGTH_OFFSET: usize = 34;

/// Size of the fixed record header in bytes
pub const HEADER_LENGTH: usize = 38;

/// Number of bytes `record` occupies once serialized.
pub fn serialized_length(record: &Record) -> usize {
    HEADER_LENGTH + record.metadata.len() + record.value.len()
}

fn validate(record: &Record, position: Position, timestamp: i64) -> CodecResult<()> {
    if record.value.is_empty() {
        return Err(CodecError::InvalidArgument(
            "record value must not be empty".to_string(),
        ));
    }
    if timestamp < 0 {
        return Err(CodecError::InvalidArgument(format!(
            "timestamp must be >= 0, got {}",
            timestamp
        )));
    }
    if position < 0 {
        return Err(CodecError::InvalidArgument(format!(
            "position must be >= 0, got {}",
            position
        )));
    }
    if record.metadata.len() > u16::MAX as usize {
        return Err(CodecError::InvalidArgument(format!(
            "metadata length {} exceeds {}",
            record.metadata.len(),
            u16::MAX
        )));
    }
    if record.value.len() > u32::MAX as usize {
        return Err(CodecError::InvalidArgument(format!(
            "value length {} exceeds {}",
            record.value.len(),
            u32::MAX
        )));
    }
    Ok(())
}

/// Write `record` into `buffer` at `offset`, returning the number of bytes written.
pub fn serialize(
    buffer: &mut [u8],
    offset: usize,
    record: &Record,
    position: Position,
    source_position: Position,
    timestamp: i64,
) -> CodecResult<usize> {
    validate(record, position, timestamp)?;

    let length = serialized_length(record);
    let available = buffer.len().saturating_sub(offset);
    if available < length {
        return Err(CodecError::BufferTooSmall {
            required: length,
            available,
        });
    }

    let out = &mut buffer[offset..offset + length];
    out[POSITION_OFFSET..SOURCE_POSITION_OFFSET].copy_from_slice(&position.to_le_bytes());
    out[SOURCE_POSITION_OFFSET..TIMESTAMP_OFFSET]
        .copy_from_slice(&source_position.to_le_bytes());
    out[TIMESTAMP_OFFSET..KEY_OFFSET].copy_from_slice(&timestamp.to_le_bytes());
    out[KEY_OFFSET..METADATA_LENGTH_OFFSET].copy_from_slice(&record.key.to_le_bytes());
    out[METADATA_LENGTH_OFFSET..VALUE_LENGTH_OFFSET]
        .copy_from_slice(&(record.metadata.len() as u16).to_le_bytes());
    out[VALUE_LENGTH_OFFSET..HEADER_LENGTH]
        .copy_from_slice(&(record.value.len() as u32).to_le_bytes());

    let metadata_end = HEADER_LENGTH + record.metadata.len();
    out[HEADER_LENGTH..metadata_end].copy_from_slice(&record.metadata);
    out[metadata_end..].copy_from_slice(&record.value);

    Ok(length)
}

/// Serialize all records of a batch back to back.
pub fn serialize_batch(batch: &SequencedBatch) -> CodecResult<Vec<u8>> {
    if batch.is_empty() {
        return Err(CodecError::InvalidArgument(
            "batch must contain at least one record".to_string(),
        ));
    }

    let total: usize = batch.records.iter().map(serialized_length).sum();
    let mut buffer = vec![0u8; total];
    let mut offset = 0;

    for (i, record) in batch.records.iter().enumerate() {
        offset += serialize(
            &mut buffer,
            offset,
            record,
            batch.first_position + i as i64,
            batch.source_position,
            batch.timestamp,
        )?;
    }

    Ok(buffer)
}

fn read_i64(buffer: &[u8], at: usize) -> i64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buffer[at..at + 8]);
    i64::from_le_bytes(bytes)
}

/// Decode the entry starting at `offset`; returns it and the bytes consumed.
pub fn deserialize(buffer: &[u8], offset: usize) -> CodecResult<(LoggedEntry, usize)> {
    let available = buffer.len().saturating_sub(offset);
    if available < HEADER_LENGTH {
        return Err(CodecError::Truncated {
            offset,
            needed: HEADER_LENGTH - available,
        });
    }

    let header = &buffer[offset..offset + HEADER_LENGTH];
    let metadata_length = u16::from_le_bytes([
        header[METADATA_LENGTH_OFFSET],
        header[METADATA_LENGTH_OFFSET + 1],
    ]) as usize;
    let mut value_length_bytes = [0u8; 4];
    value_length_bytes.copy_from_slice(&header[VALUE_LENGTH_OFFSET..HEADER_LENGTH]);
    let value_length = u32::from_le_bytes(value_length_bytes) as usize;

    let length = HEADER_LENGTH + metadata_length + value_length;
    if available < length {
        return Err(CodecError::Truncated {
            offset,
            needed: length - available,
        });
    }

    let metadata_start = offset + HEADER_LENGTH;
    let value_start = metadata_start + metadata_length;

    let entry = LoggedEntry {
        position: read_i64(header, POSITION_OFFSET),
        source_position: read_i64(header, SOURCE_POSITION_OFFSET),
        timestamp: read_i64(header, TIMESTAMP_OFFSET),
        key: read_i64(header, KEY_OFFSET),
        metadata: buffer[metadata_start..value_start].to_vec(),
        value: buffer[value_start..value_start + value_length].to_vec(),
    };

    Ok((entry, length))
}

/// Decode every entry in `buffer`.
pub fn deserialize_batch(buffer: &[u8]) -> CodecResult<Vec<LoggedEntry>> {
    let mut entries = Vec::new();
    let mut offset = 0;
    while offset < buffer.len() {
        let (entry, length) = deserialize(buffer, offset)?;
        entries.push(entry);
        offset += length;
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::RecordMetadata;
    use crate::types::{UNKEYED, UNSET_POSITION};

    fn record(key: i64, value: &str) -> Record {
        Record::new(key, Vec::new(), value.as_bytes().to_vec())
    }

    #[test]
    fn test_round_trip_with_metadata() {
        let metadata = RecordMetadata::command(3, 1).with_request_id(42);
        let record = Record::with_metadata(7, &metadata, b"payload".to_vec()).unwrap();

        let mut buffer = vec![0u8; serialized_length(&record) + 4];
        let written = serialize(&mut buffer, 4, &record, 12, 9, 1_000).unwrap();
        assert_eq!(written, serialized_length(&record));

        let (entry, read) = deserialize(&buffer, 4).unwrap();
        assert_eq!(read, written);
        assert_eq!(entry.position, 12);
        assert_eq!(entry.source_position, 9);
        assert_eq!(entry.timestamp, 1_000);
        assert_eq!(entry.key, 7);
        assert_eq!(entry.value, b"payload");
        assert_eq!(entry.read_metadata().unwrap(), Some(metadata));
    }

    #[test]
    fn test_absent_metadata_is_zero_length() {
        let record = record(UNKEYED, "createOrder");
        assert!(record.is_unkeyed());
        let mut buffer = vec![0u8; serialized_length(&record)];
        serialize(&mut buffer, 0, &record, 1, UNSET_POSITION, 5).unwrap();

        assert_eq!(&buffer[32..34], &[0, 0]);
        assert_eq!(buffer.len(), HEADER_LENGTH + "createOrder".len());

        let (entry, _) = deserialize(&buffer, 0).unwrap();
        assert!(!entry.has_metadata());
        assert_eq!(entry.read_metadata().unwrap(), None);
    }

    #[test]
    fn test_header_layout_is_little_endian() {
        let record = Record::new(0x0102, vec![0xAA], vec![0xBB, 0xCC]);
        let mut buffer = vec![0u8; serialized_length(&record)];
        serialize(&mut buffer, 0, &record, 1, 2, 3).unwrap();

        assert_eq!(&buffer[0..8], &1i64.to_le_bytes());
        assert_eq!(&buffer[8..16], &2i64.to_le_bytes());
        assert_eq!(&buffer[16..24], &3i64.to_le_bytes());
        assert_eq!(&buffer[24..32], &0x0102i64.to_le_bytes());
        assert_eq!(&buffer[32..34], &1u16.to_le_bytes());
        assert_eq!(&buffer[34..38], &2u32.to_le_bytes());
        assert_eq!(&buffer[38..], &[0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn test_rejects_invalid_arguments() {
        let mut buffer = vec![0u8; 128];

        let empty = Record::new(1, Vec::new(), Vec::new());
        assert!(matches!(
            serialize(&mut buffer, 0, &empty, 1, -1, 0),
            Err(CodecError::InvalidArgument(_))
        ));

        let valid = record(1, "v");
        assert!(matches!(
            serialize(&mut buffer, 0, &valid, 1, -1, -5),
            Err(CodecError::InvalidArgument(_))
        ));
        assert!(matches!(
            serialize(&mut buffer, 0, &valid, -1, -1, 0),
            Err(CodecError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_buffer_too_small() {
        let record = record(1, "value");
        let mut buffer = vec![0u8; HEADER_LENGTH];
        assert_eq!(
            serialize(&mut buffer, 0, &record, 1, -1, 0),
            Err(CodecError::BufferTooSmall {
                required: HEADER_LENGTH + 5,
                available: HEADER_LENGTH,
            })
        );
    }

    #[test]
    fn test_batch_positions_and_shared_source() {
        let batch = SequencedBatch::new(
            1,
            UNSET_POSITION,
            10,
            vec![record(UNKEYED, "a"), record(UNKEYED, "b")],
        );
        let bytes = serialize_batch(&batch).unwrap();
        let entries = deserialize_batch(&bytes).unwrap();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].position, 1);
        assert_eq!(entries[1].position, 2);
        assert!(entries.iter().all(|e| e.source_position == UNSET_POSITION));
        assert_eq!(entries[1].value, b"b");
    }

    #[test]
    fn test_empty_batch_rejected() {
        let batch = SequencedBatch::new(1, UNSET_POSITION, 0, Vec::new());
        assert!(matches!(
            serialize_batch(&batch),
            Err(CodecError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_truncated_input() {
        let record = record(1, "value");
        let mut buffer = vec![0u8; serialized_length(&record)];
        serialize(&mut buffer, 0, &record, 1, -1, 0).unwrap();

        let truncated = &buffer[..buffer.len() - 2];
        assert_eq!(
            deserialize(truncated, 0),
            Err(CodecError::Truncated {
                offset: 0,
                needed: 2
            })
        );
    }
}
