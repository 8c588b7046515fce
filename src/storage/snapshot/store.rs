//! File-based snapshot store.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use crate::error::StorageError;
use crate::traits::{PersistedSnapshotListener, StorageResult};
use crate::types::{PartitionId, Position};

const SNAPSHOT_DIR_PREFIX: &str = "snapshot-";
const TMP_SUFFIX: &str = ".tmp";
const DATA_FILE: &str = "data.bin";
const META_FILE: &str = "meta.json";
const CHECKSUM_FILE: &str = "checksum.sha256";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotStoreOptions {
    /// Base directory for storing snapshots.
    pub base_dir: PathBuf,
    /// Whether to verify checksums when loading snapshots.
    pub verify_checksum: bool,
    /// Whether to sync data to disk after writes.
    pub sync_on_write: bool,
}

impl Default for SnapshotStoreOptions {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("./data/snapshots"),
            verify_checksum: true,
            sync_on_write: true,
        }
    }
}

impl SnapshotStoreOptions {
    pub fn with_base_dir<P: AsRef<Path>>(base_dir: P) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            ..Default::default()
        }
    }
}

/// Snapshot metadata kept in `meta.json` next to the data.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotMeta {
    partition_id: PartitionId,
    processed_position: Position,
    compaction_bound: Position,
    checksum: String,
    data_size: u64,
    created_at: u64,
}

/// A snapshot that is durably on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedSnapshot {
    pub id: String,
    pub partition_id: PartitionId,
    /// Last processed position whose effects the snapshot contains
    pub processed_position: Position,
    pub checksum: String,
    pub data_size: u64,
    pub created_at: u64,
    pub path: PathBuf,
    compaction_bound: Position,
}

impl PersistedSnapshot {
    /// Highest position that can be rebuilt from this snapshot; the log strictly
    /// below it is no longer needed.
    pub fn compaction_bound(&self) -> Position {
        self.compaction_bound
    }

    fn from_meta(id: String, path: PathBuf, meta: SnapshotMeta) -> Self {
        Self {
            id,
            partition_id: meta.partition_id,
            processed_position: meta.processed_position,
            checksum: meta.checksum,
            data_size: meta.data_size,
            created_at: meta.created_at,
            path,
            compaction_bound: meta.compaction_bound,
        }
    }
}

type Listeners = Arc<RwLock<Arc<Vec<Arc<dyn PersistedSnapshotListener>>>>>;

/// Persistent snapshots of one partition's state.
///
/// Each snapshot lives in its own directory, written under a temporary name and
/// renamed into place once complete, so a crash never leaves a half-written
/// snapshot visible. Only the latest snapshot is kept.
#[derive(Clone)]
pub struct FileSnapshotStore {
    partition_id: PartitionId,
    options: SnapshotStoreOptions,
    dir: PathBuf,
    listeners: Listeners,
}

impl FileSnapshotStore {
    pub fn new(partition_id: PartitionId, options: SnapshotStoreOptions) -> StorageResult<Self> {
        let dir = options
            .base_dir
            .join(format!("partition-{}", partition_id));
        fs::create_dir_all(&dir)?;

        let store = Self {
            partition_id,
            options,
            dir,
            listeners: Arc::new(RwLock::new(Arc::new(Vec::new()))),
        };
        store.remove_incomplete()?;

        info!(
            "FileSnapshotStore initialized for partition {} at {:?}",
            partition_id, store.dir
        );
        Ok(store)
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    pub fn add_listener(&self, listener: Arc<dyn PersistedSnapshotListener>) {
        let mut guard = self.listeners.write();
        let mut next = guard.as_ref().clone();
        next.push(listener);
        *guard = Arc::new(next);
    }

    pub(crate) fn calculate_checksum(data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data);
        format!("{:x}", hasher.finalize())
    }

    fn snapshot_id(processed_position: Position) -> String {
        format!("{}{}", SNAPSHOT_DIR_PREFIX, processed_position)
    }

    fn parse_snapshot_id(name: &str) -> Option<Position> {
        name.strip_prefix(SNAPSHOT_DIR_PREFIX)?.parse().ok()
    }

    /// Drop temporary directories left behind by an interrupted persist.
    fn remove_incomplete(&self) -> StorageResult<()> {
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(TMP_SUFFIX) {
                warn!("Removing incomplete snapshot {:?}", entry.path());
                fs::remove_dir_all(entry.path())?;
            }
        }
        Ok(())
    }

    fn write_file(&self, path: &Path, bytes: &[u8]) -> StorageResult<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.write_all(bytes)?;
        if self.options.sync_on_write {
            file.sync_all()?;
        }
        Ok(())
    }

    fn write_snapshot_atomic(
        &self,
        processed_position: Position,
        data: &[u8],
    ) -> StorageResult<PersistedSnapshot> {
        let id = Self::snapshot_id(processed_position);
        let path = self.dir.join(&id);
        let tmp_path = self.dir.join(format!("{}{}", id, TMP_SUFFIX));

        if tmp_path.exists() {
            fs::remove_dir_all(&tmp_path)?;
        }
        fs::create_dir_all(&tmp_path)?;

        let checksum = Self::calculate_checksum(data);
        let meta = SnapshotMeta {
            partition_id: self.partition_id,
            processed_position,
            compaction_bound: processed_position,
            checksum: checksum.clone(),
            data_size: data.len() as u64,
            created_at: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        };

        self.write_file(&tmp_path.join(DATA_FILE), data)?;
        self.write_file(
            &tmp_path.join(META_FILE),
            serde_json::to_string_pretty(&meta)?.as_bytes(),
        )?;
        self.write_file(&tmp_path.join(CHECKSUM_FILE), checksum.as_bytes())?;

        if path.exists() {
            fs::remove_dir_all(&path)?;
        }
        fs::rename(&tmp_path, &path)?;

        debug!(
            "Snapshot saved for partition {}: position={}, size={}",
            self.partition_id,
            processed_position,
            data.len()
        );

        Ok(PersistedSnapshot::from_meta(id, path, meta))
    }

    fn read_meta(&self, path: &Path) -> StorageResult<SnapshotMeta> {
        let content = fs::read_to_string(path.join(META_FILE))?;
        Ok(serde_json::from_str(&content)?)
    }

    /// All complete snapshots, oldest first.
    pub fn list(&self) -> StorageResult<Vec<PersistedSnapshot>> {
        let mut snapshots = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(TMP_SUFFIX) || Self::parse_snapshot_id(&name).is_none() {
                continue;
            }
            let path = entry.path();
            match self.read_meta(&path) {
                Ok(meta) => snapshots.push(PersistedSnapshot::from_meta(name, path, meta)),
                Err(e) => warn!("Skipping unreadable snapshot {:?}: {}", path, e),
            }
        }
        snapshots.sort_by_key(|s| s.processed_position);
        Ok(snapshots)
    }

    pub fn latest(&self) -> StorageResult<Option<PersistedSnapshot>> {
        Ok(self.list()?.pop())
    }

    fn delete_older_than(&self, processed_position: Position) -> StorageResult<usize> {
        let mut removed = 0;
        for snapshot in self.list()? {
            if snapshot.processed_position < processed_position {
                fs::remove_dir_all(&snapshot.path)?;
                info!("Deleted snapshot {} of partition {}", snapshot.id, self.partition_id);
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn read_data(&self, snapshot: &PersistedSnapshot) -> StorageResult<Vec<u8>> {
        let data_path = snapshot.path.join(DATA_FILE);
        if !data_path.exists() {
            return Err(StorageError::SnapshotNotFound(snapshot.id.clone()));
        }
        let data = fs::read(&data_path)?;

        if self.options.verify_checksum && Self::calculate_checksum(&data) != snapshot.checksum {
            error!(
                "Snapshot checksum verification failed for {} of partition {}",
                snapshot.id, self.partition_id
            );
            return Err(StorageError::DataCorruption(format!(
                "checksum mismatch in snapshot {}",
                snapshot.id
            )));
        }
        Ok(data)
    }

    /// Persist `data` as the snapshot at `processed_position`, remove older
    /// snapshots and notify listeners.
    pub async fn persist(
        &self,
        processed_position: Position,
        data: Vec<u8>,
    ) -> StorageResult<PersistedSnapshot> {
        let store = self.clone();
        let snapshot = tokio::task::spawn_blocking(move || {
            let snapshot = store.write_snapshot_atomic(processed_position, &data)?;
            if let Err(e) = store.delete_older_than(processed_position) {
                warn!("Failed to delete old snapshots: {}", e);
            }
            Ok::<_, StorageError>(snapshot)
        })
        .await
        .map_err(|e| StorageError::Internal(format!("Snapshot save task failed: {}", e)))??;

        info!(
            "Persisted snapshot {} of partition {} ({} bytes)",
            snapshot.id, self.partition_id, snapshot.data_size
        );

        let listeners = self.listeners.read().clone();
        for listener in listeners.iter() {
            listener.on_new_snapshot(&snapshot);
        }
        Ok(snapshot)
    }

    /// Read a snapshot's data, verifying its checksum if configured.
    pub async fn load_data(&self, snapshot: &PersistedSnapshot) -> StorageResult<Vec<u8>> {
        let store = self.clone();
        let snapshot = snapshot.clone();
        tokio::task::spawn_blocking(move || store.read_data(&snapshot))
            .await
            .map_err(|e| StorageError::Internal(format!("Snapshot load task failed: {}", e)))?
    }
}
