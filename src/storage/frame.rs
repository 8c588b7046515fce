//! CRC-checked frames shared by the log segments and the state transaction log.
//!
//! ```text
//! | size u32 | frame_type u32 | magic u32 | crc u32 | payload ... |
//! ```
//! `size` covers header and payload; `crc` is the crc32 of the payload.

use std::fs::File;
use std::os::unix::fs::FileExt;

use anyhow::{Result, anyhow};
use tracing::warn;

pub const FRAME_MAGIC_NUM: u32 = 0x_1234_5678;
pub const FRAME_HEADER_SIZE: u32 = 16; // 4 + 4 + 4 + 4

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    LogBatch,
    StateBatch,
}

impl FrameType {
    fn code(self) -> u32 {
        match self {
            FrameType::LogBatch => 1,
            FrameType::StateBatch => 2,
        }
    }

    fn from_code(code: u32) -> Result<Self> {
        match code {
            1 => Ok(FrameType::LogBatch),
            2 => Ok(FrameType::StateBatch),
            _ => Err(anyhow!("Invalid frame type {}", code)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub size: u32,
    pub frame_type: FrameType,
    pub magic_num: u32,
    pub crc: u32,
}

impl FrameHeader {
    pub fn for_payload(frame_type: FrameType, payload: &[u8]) -> Self {
        Self {
            size: payload.len() as u32 + FRAME_HEADER_SIZE,
            frame_type,
            magic_num: FRAME_MAGIC_NUM,
            crc: crc32fast::hash(payload),
        }
    }

    pub fn payload_size(&self) -> u64 {
        (self.size - FRAME_HEADER_SIZE) as u64
    }

    pub fn serialize(&self) -> [u8; FRAME_HEADER_SIZE as usize] {
        let mut buf = [0u8; FRAME_HEADER_SIZE as usize];
        buf[0..4].copy_from_slice(&self.size.to_le_bytes());
        buf[4..8].copy_from_slice(&self.frame_type.code().to_le_bytes());
        buf[8..12].copy_from_slice(&self.magic_num.to_le_bytes());
        buf[12..16].copy_from_slice(&self.crc.to_le_bytes());
        buf
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < FRAME_HEADER_SIZE as usize {
            return Err(anyhow!("Invalid length"));
        }

        let read_u32 = |at: usize| {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&data[at..at + 4]);
            u32::from_le_bytes(bytes)
        };

        let size = read_u32(0);
        let frame_type = FrameType::from_code(read_u32(4))?;
        let magic_num = read_u32(8);
        let crc = read_u32(12);

        if magic_num != FRAME_MAGIC_NUM {
            return Err(anyhow!("Invalid magic number"));
        }
        if size < FRAME_HEADER_SIZE {
            return Err(anyhow!("Invalid frame size {}", size));
        }

        Ok(Self {
            size,
            frame_type,
            magic_num,
            crc,
        })
    }
}

/// Header followed by payload, ready to be appended to a file.
pub fn encode_frame(frame_type: FrameType, payload: &[u8]) -> Vec<u8> {
    let header = FrameHeader::for_payload(frame_type, payload);
    let mut buf = Vec::with_capacity(header.size as usize);
    buf.extend_from_slice(&header.serialize());
    buf.extend_from_slice(payload);
    buf
}

/// Read the frame at `offset`.
///
/// Returns `Ok(None)` when the bytes at `offset` are not a complete, valid frame
/// (torn or corrupt tail); everything from `offset` on is then unusable.
pub fn read_frame(
    file: &File,
    offset: u64,
    file_size: u64,
) -> Result<Option<(FrameHeader, Vec<u8>)>> {
    if offset + FRAME_HEADER_SIZE as u64 > file_size {
        warn!("Incomplete frame header at offset {}", offset);
        return Ok(None);
    }

    let mut header_buf = [0u8; FRAME_HEADER_SIZE as usize];
    file.read_exact_at(&mut header_buf, offset)?;

    let header = match FrameHeader::deserialize(&header_buf) {
        Ok(h) => h,
        Err(e) => {
            warn!("Failed to deserialize frame header at offset {}: {}", offset, e);
            return Ok(None);
        }
    };

    if offset + header.size as u64 > file_size {
        warn!(
            "Incomplete frame at offset {}: size {} exceeds file size {}",
            offset, header.size, file_size
        );
        return Ok(None);
    }

    let mut payload = vec![0u8; header.payload_size() as usize];
    file.read_exact_at(&mut payload, offset + FRAME_HEADER_SIZE as u64)?;

    let actual_crc = crc32fast::hash(&payload);
    if actual_crc != header.crc {
        warn!(
            "CRC mismatch at offset {}: expected {}, got {}",
            offset, header.crc, actual_crc
        );
        return Ok(None);
    }

    Ok(Some((header, payload)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_header_round_trip() {
        let header = FrameHeader::for_payload(FrameType::StateBatch, b"abc");
        let parsed = FrameHeader::deserialize(&header.serialize()).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.payload_size(), 3);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut bytes = FrameHeader::for_payload(FrameType::LogBatch, b"x").serialize();
        bytes[8] ^= 0xFF;
        assert!(FrameHeader::deserialize(&bytes).is_err());
    }

    #[test]
    fn test_read_frame_detects_torn_and_corrupt_tail() {
        let mut file = NamedTempFile::new().unwrap();
        let first = encode_frame(FrameType::LogBatch, b"first");
        let second = encode_frame(FrameType::LogBatch, b"second");
        file.write_all(&first).unwrap();
        file.write_all(&second[..second.len() - 2]).unwrap();
        file.flush().unwrap();

        let handle = file.as_file();
        let size = handle.metadata().unwrap().len();

        let (header, payload) = read_frame(handle, 0, size).unwrap().unwrap();
        assert_eq!(payload, b"first");
        assert!(read_frame(handle, header.size as u64, size).unwrap().is_none());

        let mut corrupt = encode_frame(FrameType::LogBatch, b"payload");
        let last = corrupt.len() - 1;
        corrupt[last] ^= 0x01;
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&corrupt).unwrap();
        file.flush().unwrap();
        let size = file.as_file().metadata().unwrap().len();
        assert!(read_frame(file.as_file(), 0, size).unwrap().is_none());
    }
}
