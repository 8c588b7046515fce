use std::{
    fs::{File, OpenOptions},
    os::unix::fs::FileExt,
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Result, anyhow};
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::storage::frame::{FRAME_HEADER_SIZE, FrameType, encode_frame, read_frame};
use crate::types::{LogIndex, Position};

use super::entry::{BatchMeta, BatchRecord};

// LogSegment file format:
// | FrameHeader | BatchRecord | FrameHeader | BatchRecord | ...
// Frames are appended only; a torn or corrupt tail is cut off when the segment is replayed.

pub struct LogSegment {
    pub(crate) file_path: PathBuf,
    pub(crate) file: Arc<File>,
    pub(crate) io_semaphore: Arc<Semaphore>,
    /// Batches in append (and position) order
    pub(crate) batches: Vec<BatchMeta>,
    /// Length of the valid prefix of the file
    pub(crate) size: u64,
}

impl LogSegment {
    pub fn create(file_path: PathBuf, io_semaphore: Arc<Semaphore>) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&file_path)?;

        Ok(Self {
            file_path,
            file: Arc::new(file),
            io_semaphore,
            batches: Vec::new(),
            size: 0,
        })
    }

    /// Open an existing segment and rebuild its index.
    pub fn open(file_path: PathBuf, io_semaphore: Arc<Semaphore>) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(&file_path)?;

        let mut segment = Self {
            file_path,
            file: Arc::new(file),
            io_semaphore,
            batches: Vec::new(),
            size: 0,
        };
        segment.replay_segment()?;
        Ok(segment)
    }

    pub fn first_batch(&self) -> Option<&BatchMeta> {
        self.batches.first()
    }

    pub fn last_batch(&self) -> Option<&BatchMeta> {
        self.batches.last()
    }

    pub fn first_position(&self) -> Option<Position> {
        self.first_batch().map(|b| b.lowest_position)
    }

    pub fn last_position(&self) -> Option<Position> {
        self.last_batch().map(|b| b.highest_position)
    }

    pub fn last_index(&self) -> Option<LogIndex> {
        self.last_batch().map(|b| b.index)
    }

    pub fn batch_count(&self) -> usize {
        self.batches.len()
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn sync_data(&self) -> Result<()> {
        self.file.sync_data().map_err(|e| {
            warn!("Failed to sync log segment file data: {}", e);
            e.into()
        })
    }

    /// Append one batch frame at the end of the valid prefix.
    pub fn write_batch(&mut self, record: &BatchRecord) -> Result<BatchMeta> {
        if let Some(last) = self.last_batch() {
            if record.lowest_position <= last.highest_position {
                return Err(anyhow!(
                    "Batch [{}, {}] does not follow last position {}",
                    record.lowest_position,
                    record.highest_position,
                    last.highest_position
                ));
            }
        }

        let payload = record.serialize()?;
        let frame = encode_frame(FrameType::LogBatch, &payload);

        self.file.write_all_at(&frame, self.size).map_err(|e| {
            warn!("Failed to write batch to {:?}: {}", self.file_path, e);
            e
        })?;

        let meta = BatchMeta {
            index: record.index,
            lowest_position: record.lowest_position,
            highest_position: record.highest_position,
            offset: self.size + FRAME_HEADER_SIZE as u64,
            size: payload.len() as u64,
        };
        self.batches.push(meta);
        self.size += frame.len() as u64;

        Ok(meta)
    }

    /// Rebuild the batch index by scanning the file from the start.
    ///
    /// Scanning stops at the first incomplete or corrupt frame; the file is truncated
    /// to the valid prefix so later appends never follow garbage.
    pub fn replay_segment(&mut self) -> Result<()> {
        self.batches.clear();
        self.size = 0;

        let file_size = self.file.metadata()?.len();
        let mut offset: u64 = 0;

        while offset < file_size {
            let Some((header, payload)) = read_frame(&self.file, offset, file_size)? else {
                break;
            };

            if header.frame_type != FrameType::LogBatch {
                warn!(
                    "Unexpected frame type {:?} at offset {} in {:?}",
                    header.frame_type, offset, self.file_path
                );
                break;
            }

            let record = match BatchRecord::deserialize(&payload) {
                Ok((record, _)) => record,
                Err(e) => {
                    warn!("Failed to decode batch at offset {}: {}", offset, e);
                    break;
                }
            };

            self.batches.push(BatchMeta {
                index: record.index,
                lowest_position: record.lowest_position,
                highest_position: record.highest_position,
                offset: offset + FRAME_HEADER_SIZE as u64,
                size: payload.len() as u64,
            });
            offset += header.size as u64;
        }

        if offset < file_size {
            warn!(
                "Discarding {} bytes of torn tail in {:?}",
                file_size - offset,
                self.file_path
            );
            self.file.set_len(offset)?;
        }
        self.size = offset;

        info!(
            "Replayed segment {:?}: batches={}, size={}",
            self.file_path,
            self.batches.len(),
            self.size
        );
        Ok(())
    }

    /// Batches with `highest_position >= from` and `lowest_position <= to`.
    pub fn batches_in_range(&self, from: Position, to: Position) -> Vec<BatchMeta> {
        let start = self.batches.partition_point(|b| b.highest_position < from);
        self.batches[start..]
            .iter()
            .take_while(|b| b.lowest_position <= to)
            .copied()
            .collect()
    }

    pub fn find_batch(&self, lowest: Position, highest: Position) -> Option<BatchMeta> {
        self.batches
            .iter()
            .rev()
            .find(|b| b.lowest_position == lowest && b.highest_position == highest)
            .copied()
    }
}

/// Read the given batches from `file`, merging contiguous frames into single reads.
pub async fn read_batches(
    file: Arc<File>,
    io_semaphore: Arc<Semaphore>,
    metas: Vec<BatchMeta>,
) -> Result<Vec<BatchRecord>> {
    if metas.is_empty() {
        return Ok(Vec::new());
    }

    // Frames are laid out back to back, so contiguous batches are separated by exactly one header.
    let mut groups: Vec<Vec<BatchMeta>> = Vec::new();
    for meta in metas {
        match groups.last_mut().and_then(|group| {
            let last = group.last()?;
            (last.offset + last.size + FRAME_HEADER_SIZE as u64 == meta.offset).then_some(group)
        }) {
            Some(group) => group.push(meta),
            None => groups.push(vec![meta]),
        }
    }

    let mut tasks = Vec::with_capacity(groups.len());
    for group in groups {
        let permit = io_semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| anyhow!("I/O semaphore closed: {}", e))?;
        let file = file.clone();

        tasks.push(tokio::task::spawn_blocking(move || -> Result<Vec<BatchRecord>> {
            let _permit = permit;
            let (Some(first), Some(last)) = (group.first(), group.last()) else {
                return Ok(Vec::new());
            };
            let start = first.offset;
            let end = last.offset + last.size;
            let mut buf = vec![0u8; (end - start) as usize];
            file.read_exact_at(&mut buf, start)?;

            let mut records = Vec::with_capacity(group.len());
            for meta in &group {
                let begin = (meta.offset - start) as usize;
                let data = &buf[begin..begin + meta.size as usize];
                let (record, _) = BatchRecord::deserialize(data).map_err(|e| {
                    anyhow!("Failed to decode batch at index {}: {}", meta.index, e)
                })?;
                records.push(record);
            }
            Ok(records)
        }));
    }

    let results = futures::future::join_all(tasks).await;

    results
        .into_iter()
        .try_fold(Vec::new(), |mut acc, join_res| -> Result<Vec<BatchRecord>> {
            let batch = join_res??;
            acc.extend(batch);
            Ok(acc)
        })
}
