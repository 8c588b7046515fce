//! Record codec: the bit-exact layout of log entries and the record metadata carried in them.

mod record;
mod serializer;

pub use record::{LoggedEntry, Record, RecordMetadata, RecordType, SequencedBatch};
pub use serializer::{
    HEADER_LENGTH, deserialize, deserialize_batch, serialize, serialize_batch, serialized_length,
};
