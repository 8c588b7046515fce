//! Segment Manager for log storage.
//!
//! This module provides multi-segment management with:
//! - Automatic segment rotation when max size is reached
//! - Cross-segment reads in position order
//! - Deletion of sealed segments below a compaction bound
//! - Disk usage tracking

use std::{
    fs,
    path::PathBuf,
    sync::Arc,
    time::SystemTime,
};

use anyhow::Result;
use parking_lot::RwLock;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::types::Position;

use super::{
    entry::{BatchMeta, BatchRecord},
    segment::{LogSegment, read_batches},
};

/// Default maximum segment size (64MB)
pub const DEFAULT_MAX_SEGMENT_SIZE: u64 = 64 * 1024 * 1024;

/// Segment file prefix
const SEGMENT_FILE_PREFIX: &str = "segment_";

/// Segment file extension
const SEGMENT_FILE_EXT: &str = ".log";

/// Metadata about a sealed segment
#[derive(Debug, Clone)]
pub struct SegmentMeta {
    /// Unique segment identifier (monotonically increasing)
    pub segment_id: u64,
    pub file_path: PathBuf,
    pub first_position: Option<Position>,
    pub last_position: Option<Position>,
    pub file_size: u64,
    pub created_at: SystemTime,
}

impl SegmentMeta {
    fn of(segment_id: u64, segment: &LogSegment) -> Self {
        let created_at = fs::metadata(&segment.file_path)
            .and_then(|m| m.created().or_else(|_| m.modified()))
            .unwrap_or_else(|_| SystemTime::now());

        Self {
            segment_id,
            file_path: segment.file_path.clone(),
            first_position: segment.first_position(),
            last_position: segment.last_position(),
            file_size: segment.size(),
            created_at,
        }
    }

    /// Every position in this segment lies strictly below `bound`.
    pub fn is_below(&self, bound: Position) -> bool {
        match self.last_position {
            Some(last) => last < bound,
            None => true,
        }
    }
}

/// Configuration options for segment manager
#[derive(Clone, Debug)]
pub struct SegmentManagerOptions {
    /// Directory for storing segment files
    pub dir: PathBuf,
    /// Maximum segment size in bytes before rotation
    pub max_segment_size: u64,
    /// Maximum number of concurrent blocking reads
    pub max_io_threads: usize,
    /// Whether to sync after each write
    pub sync_on_write: bool,
}

impl Default for SegmentManagerOptions {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./data/log"),
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
            max_io_threads: 4,
            sync_on_write: true,
        }
    }
}

struct ActiveSegment {
    segment_id: u64,
    segment: LogSegment,
}

/// Manages multiple log segments with rotation and cleanup
pub struct SegmentManager {
    options: SegmentManagerOptions,
    io_semaphore: Arc<Semaphore>,
    /// Currently active (writable) segment
    active: RwLock<ActiveSegment>,
    /// Read-only sealed segments, oldest first
    sealed: RwLock<Vec<(SegmentMeta, Arc<LogSegment>)>>,
    next_segment_id: RwLock<u64>,
}

impl SegmentManager {
    pub fn new(options: SegmentManagerOptions) -> Result<Self> {
        fs::create_dir_all(&options.dir)?;

        let io_semaphore = Arc::new(Semaphore::new(options.max_io_threads.max(1)));
        let (active, sealed, next_id) = Self::load_or_create_segments(&options, &io_semaphore)?;

        Ok(Self {
            options,
            io_semaphore,
            active: RwLock::new(active),
            sealed: RwLock::new(sealed),
            next_segment_id: RwLock::new(next_id),
        })
    }

    fn segment_path(options: &SegmentManagerOptions, segment_id: u64) -> PathBuf {
        options.dir.join(format!(
            "{}{:010}{}",
            SEGMENT_FILE_PREFIX, segment_id, SEGMENT_FILE_EXT
        ))
    }

    #[allow(clippy::type_complexity)]
    fn load_or_create_segments(
        options: &SegmentManagerOptions,
        io_semaphore: &Arc<Semaphore>,
    ) -> Result<(ActiveSegment, Vec<(SegmentMeta, Arc<LogSegment>)>, u64)> {
        let mut segment_files: Vec<(u64, PathBuf)> = Vec::new();

        for entry in fs::read_dir(&options.dir)?.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with(SEGMENT_FILE_PREFIX) && name.ends_with(SEGMENT_FILE_EXT) {
                let id_str = name
                    .trim_start_matches(SEGMENT_FILE_PREFIX)
                    .trim_end_matches(SEGMENT_FILE_EXT);
                if let Ok(id) = id_str.parse::<u64>() {
                    segment_files.push((id, path));
                }
            }
        }
        segment_files.sort_by_key(|(id, _)| *id);

        let Some((last_id, last_path)) = segment_files.pop() else {
            let path = Self::segment_path(options, 0);
            let segment = LogSegment::create(path.clone(), io_semaphore.clone())?;
            info!("Created new segment: id=0, path={:?}", path);
            return Ok((
                ActiveSegment {
                    segment_id: 0,
                    segment,
                },
                Vec::new(),
                1,
            ));
        };

        let mut sealed = Vec::with_capacity(segment_files.len());
        for (id, path) in segment_files {
            let segment = LogSegment::open(path, io_semaphore.clone())?;
            let meta = SegmentMeta::of(id, &segment);
            info!(
                "Loaded sealed segment: id={}, positions={:?}..={:?}, size={}",
                id, meta.first_position, meta.last_position, meta.file_size
            );
            sealed.push((meta, Arc::new(segment)));
        }

        let segment = LogSegment::open(last_path, io_semaphore.clone())?;
        info!(
            "Loaded active segment: id={}, batches={}, size={}",
            last_id,
            segment.batch_count(),
            segment.size()
        );

        Ok((
            ActiveSegment {
                segment_id: last_id,
                segment,
            },
            sealed,
            last_id + 1,
        ))
    }

    pub fn needs_rotation(&self) -> bool {
        self.active.read().segment.size() >= self.options.max_segment_size
    }

    /// Seal the active segment and start a new one.
    pub fn rotate_segment(&self) -> Result<()> {
        let next_id = {
            let mut next_id = self.next_segment_id.write();
            let id = *next_id;
            *next_id += 1;
            id
        };

        let new_segment = LogSegment::create(
            Self::segment_path(&self.options, next_id),
            self.io_semaphore.clone(),
        )?;

        let old = {
            let mut active = self.active.write();
            if let Err(e) = active.segment.sync_data() {
                warn!("Failed to sync segment {} before sealing: {}", active.segment_id, e);
            }
            std::mem::replace(
                &mut *active,
                ActiveSegment {
                    segment_id: next_id,
                    segment: new_segment,
                },
            )
        };

        let meta = SegmentMeta::of(old.segment_id, &old.segment);
        self.sealed.write().push((meta, Arc::new(old.segment)));

        info!("Rotated to new segment: id={}", next_id);
        Ok(())
    }

    /// Append one batch to the active segment, rotating first if it is full.
    pub fn write_batch(&self, record: &BatchRecord) -> Result<BatchMeta> {
        if self.needs_rotation() {
            self.rotate_segment()?;
        }

        let mut active = self.active.write();
        let meta = active.segment.write_batch(record)?;
        if self.options.sync_on_write {
            active.segment.sync_data()?;
        }
        Ok(meta)
    }

    /// Most recently written batch across all segments.
    pub fn last_batch(&self) -> Option<BatchMeta> {
        if let Some(meta) = self.active.read().segment.last_batch() {
            return Some(*meta);
        }
        self.sealed
            .read()
            .iter()
            .rev()
            .find_map(|(_, segment)| segment.last_batch().copied())
    }

    /// Lowest position still stored, if any.
    pub fn first_position(&self) -> Option<Position> {
        let from_sealed = self
            .sealed
            .read()
            .iter()
            .find_map(|(meta, _)| meta.first_position);
        from_sealed.or_else(|| self.active.read().segment.first_position())
    }

    /// Find the batch written for exactly this position range.
    pub fn find_batch(&self, lowest: Position, highest: Position) -> Option<BatchMeta> {
        if let Some(meta) = self.active.read().segment.find_batch(lowest, highest) {
            return Some(meta);
        }
        self.sealed
            .read()
            .iter()
            .rev()
            .find_map(|(_, segment)| segment.find_batch(lowest, highest))
    }

    /// Read batches overlapping `[from, to]`, oldest first, stopping once
    /// `max_batches` batches have been collected.
    pub async fn read_batches(
        &self,
        from: Position,
        to: Position,
        max_batches: usize,
    ) -> Result<Vec<BatchRecord>> {
        if from > to || max_batches == 0 {
            return Ok(Vec::new());
        }

        // Collect what to read without holding locks across await
        let mut plan = Vec::new();
        let mut remaining = max_batches;
        {
            let sealed = self.sealed.read();
            for (meta, segment) in sealed.iter() {
                if remaining == 0 {
                    break;
                }
                if meta.is_below(from) {
                    continue;
                }
                let mut metas = segment.batches_in_range(from, to);
                metas.truncate(remaining);
                remaining -= metas.len();
                if !metas.is_empty() {
                    plan.push((segment.file.clone(), metas));
                }
            }
        }
        if remaining > 0 {
            let active = self.active.read();
            let mut metas = active.segment.batches_in_range(from, to);
            metas.truncate(remaining);
            if !metas.is_empty() {
                plan.push((active.segment.file.clone(), metas));
            }
        }

        let mut records = Vec::new();
        for (file, metas) in plan {
            records.extend(read_batches(file, self.io_semaphore.clone(), metas).await?);
        }
        Ok(records)
    }

    /// Delete sealed segments whose every position is strictly below `bound`.
    ///
    /// The active segment is never deleted. Returns the number of segments removed.
    pub fn delete_before(&self, bound: Position) -> Result<usize> {
        let mut sealed = self.sealed.write();

        // Only a prefix can go: segments are position ordered
        let removable = sealed
            .iter()
            .take_while(|(meta, _)| meta.is_below(bound))
            .count();
        if removable == 0 {
            return Ok(0);
        }

        // Segments stay tracked until their file is gone, so a failed deletion is
        // retried by the next call
        let mut removed = 0;
        let mut failure = None;
        for (meta, _segment) in sealed.iter().take(removable) {
            match fs::remove_file(&meta.file_path) {
                Ok(()) => {
                    info!(
                        "Deleted segment: id={}, last_position={:?}, freed={}B",
                        meta.segment_id, meta.last_position, meta.file_size
                    );
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!("Failed to delete segment {:?}: {}", meta.file_path, e);
                    failure = Some(e);
                    break;
                }
            }
            removed += 1;
        }
        sealed.drain(..removed);

        match failure {
            Some(e) => Err(e.into()),
            None => Ok(removed),
        }
    }

    /// Get disk usage statistics
    pub fn get_disk_stats(&self) -> DiskStats {
        let active_size = self.active.read().segment.size();
        let sealed = self.sealed.read();
        let sealed_size: u64 = sealed.iter().map(|(m, _)| m.file_size).sum();

        DiskStats {
            total_usage: active_size + sealed_size,
            active_segment_size: active_size,
            sealed_segment_count: sealed.len(),
            sealed_segments_size: sealed_size,
            max_segment_size: self.options.max_segment_size,
        }
    }

    pub fn sync_all(&self) -> Result<()> {
        self.active.read().segment.sync_data()
    }

    /// Segment count (active + sealed)
    pub fn segment_count(&self) -> usize {
        1 + self.sealed.read().len()
    }

    pub fn sealed_segments(&self) -> Vec<SegmentMeta> {
        self.sealed.read().iter().map(|(m, _)| m.clone()).collect()
    }
}

/// Disk usage statistics
#[derive(Debug, Clone)]
pub struct DiskStats {
    pub total_usage: u64,
    pub active_segment_size: u64,
    pub sealed_segment_count: usize,
    pub sealed_segments_size: u64,
    pub max_segment_size: u64,
}

impl DiskStats {
    /// Format as human-readable string
    pub fn to_human_readable(&self) -> String {
        format!(
            "total: {}, active: {}, sealed: {} segments ({}), max_segment: {}",
            Self::format_bytes(self.total_usage),
            Self::format_bytes(self.active_segment_size),
            self.sealed_segment_count,
            Self::format_bytes(self.sealed_segments_size),
            Self::format_bytes(self.max_segment_size),
        )
    }

    fn format_bytes(bytes: u64) -> String {
        const KB: u64 = 1024;
        const MB: u64 = KB * 1024;
        const GB: u64 = MB * 1024;

        if bytes >= GB {
            format!("{:.2}GB", bytes as f64 / GB as f64)
        } else if bytes >= MB {
            format!("{:.2}MB", bytes as f64 / MB as f64)
        } else if bytes >= KB {
            format!("{:.2}KB", bytes as f64 / KB as f64)
        } else {
            format!("{}B", bytes)
        }
    }
}
