use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::appender::AppenderOptions;
use crate::error::StorageError;
use crate::processor::ProcessorOptions;
use crate::sequencer::{DEFAULT_MAX_BATCH_BYTES, SequencerOptions};
use crate::storage::log::{DEFAULT_MAX_SEGMENT_SIZE, SegmentManagerOptions};
use crate::storage::snapshot::SnapshotStoreOptions;
use crate::storage::state::StateDbOptions;
use crate::traits::StorageResult;
use crate::types::PartitionId;

/// Everything needed to open one partition.
///
/// Data lives under `data_dir/partition-{id}/{log,state,snapshots}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionConfig {
    pub partition_id: PartitionId,
    pub data_dir: PathBuf,
    pub max_segment_size: u64,
    pub max_io_threads: usize,
    /// fsync log segments, state batches and snapshots on every write
    pub sync_on_write: bool,
    pub max_batch_bytes: usize,
    pub verify_snapshot_checksum: bool,
    pub appender: AppenderOptions,
    pub processor: ProcessorOptions,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            partition_id: 1,
            data_dir: PathBuf::from("./data"),
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
            max_io_threads: 4,
            sync_on_write: true,
            max_batch_bytes: DEFAULT_MAX_BATCH_BYTES,
            verify_snapshot_checksum: true,
            appender: AppenderOptions::default(),
            processor: ProcessorOptions::default(),
        }
    }
}

impl PartitionConfig {
    pub fn new(partition_id: PartitionId, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            partition_id,
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    pub fn from_json(json: &str) -> StorageResult<Self> {
        serde_json::from_str(json).map_err(StorageError::from)
    }

    pub fn to_json(&self) -> StorageResult<String> {
        serde_json::to_string_pretty(self).map_err(StorageError::from)
    }

    pub fn partition_dir(&self) -> PathBuf {
        self.data_dir.join(format!("partition-{}", self.partition_id))
    }

    pub fn segment_options(&self) -> SegmentManagerOptions {
        SegmentManagerOptions {
            dir: self.partition_dir().join("log"),
            max_segment_size: self.max_segment_size,
            max_io_threads: self.max_io_threads,
            sync_on_write: self.sync_on_write,
        }
    }

    pub fn state_options(&self) -> StateDbOptions {
        StateDbOptions {
            dir: self.partition_dir().join("state"),
            sync_on_commit: self.sync_on_write,
        }
    }

    /// Snapshots go under `partition_dir()/snapshots/partition-{id}/`.
    pub fn snapshot_options(&self) -> SnapshotStoreOptions {
        SnapshotStoreOptions {
            base_dir: self.partition_dir().join("snapshots"),
            verify_checksum: self.verify_snapshot_checksum,
            sync_on_write: self.sync_on_write,
        }
    }

    pub fn sequencer_options(&self) -> SequencerOptions {
        SequencerOptions {
            max_batch_bytes: self.max_batch_bytes,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = PartitionConfig::from_json(
            r#"{
                "partition_id": 3,
                "data_dir": "/tmp/broker",
                "appender": { "max_backoff_ms": 250 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.partition_id, 3);
        assert_eq!(config.appender.max_backoff_ms, 250);
        assert_eq!(config.appender.initial_backoff_ms, 10);
        assert_eq!(config.max_segment_size, DEFAULT_MAX_SEGMENT_SIZE);
        assert_eq!(
            config.segment_options().dir,
            PathBuf::from("/tmp/broker/partition-3/log")
        );
    }

    #[test]
    fn test_json_round_trip() {
        let config = PartitionConfig::new(2, "/var/lib/broker");
        let parsed = PartitionConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(parsed.partition_id, 2);
        assert_eq!(parsed.data_dir, config.data_dir);
        assert_eq!(
            parsed.processor.max_commands_in_batch,
            config.processor.max_commands_in_batch
        );
    }

    #[test]
    fn test_invalid_json_is_an_encoding_error() {
        assert!(matches!(
            PartitionConfig::from_json("{ not json"),
            Err(StorageError::Encoding(_))
        ));
    }
}
