use anyhow::Result;
use bincode::{Decode, Encode};
use tracing::warn;

use crate::types::{LogIndex, Position};

/// Location of one appended batch inside a segment file.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BatchMeta {
    pub index: LogIndex,
    pub lowest_position: Position,
    pub highest_position: Position,
    /// File offset of the frame payload (after the frame header)
    pub offset: u64,
    pub size: u64,
}

impl BatchMeta {
    pub fn contains(&self, position: Position) -> bool {
        position >= self.lowest_position && position <= self.highest_position
    }
}

/// Payload of a log frame: one append of the replication contract
#[derive(Debug, Clone, PartialEq, Eq, Decode, Encode)]
pub struct BatchRecord {
    pub index: LogIndex,
    pub lowest_position: Position,
    pub highest_position: Position,
    pub data: Vec<u8>,
}

impl BatchRecord {
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let config = bincode::config::standard();
        Ok(bincode::encode_to_vec(self, config)?)
    }

    pub fn deserialize(data: &[u8]) -> Result<(Self, usize)> {
        let config = bincode::config::standard();
        Ok(bincode::decode_from_slice(data, config).map_err(|e| {
            warn!("Failed to deserialize batch record: {}", e);
            e
        })?)
    }
}
