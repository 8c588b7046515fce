//! Durable ordered key-value store backing a partition's column families.
//!
//! Committed write batches are appended to `state.log` as CRC-checked frames and
//! applied to an in-memory ordered map. Reopening replays the log; a torn or corrupt
//! batch at the tail is dropped as a whole, so a transaction is either fully visible
//! after a crash or not at all.

use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    io,
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
    sync::Arc,
};

use bincode::{Decode, Encode};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::StorageError;
use crate::storage::frame::{FrameType, encode_frame, read_frame};
use crate::traits::StorageResult;

use super::transaction::Transaction;

const STATE_LOG_FILE: &str = "state.log";
const STATE_LOG_TMP_FILE: &str = "state.log.tmp";

#[derive(Debug, Clone)]
pub struct StateDbOptions {
    pub dir: PathBuf,
    /// fsync the transaction log on every commit
    pub sync_on_commit: bool,
}

impl Default for StateDbOptions {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./data/state"),
            sync_on_commit: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum WriteOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// Unit of atomicity in the transaction log
#[derive(Debug, Clone, Default, PartialEq, Eq, Encode, Decode)]
pub struct WriteBatch {
    pub ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Full copy of the state, as stored in snapshots
#[derive(Debug, Clone, Default, Encode, Decode)]
struct StateExport {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
}

struct StateLog {
    file: File,
    size: u64,
}

impl StateLog {
    /// Append one frame at the tail. On failure the tail is cut back so a frame
    /// reported as failed is never replayed.
    fn append<S>(&mut self, frame: &[u8], sync: S) -> io::Result<()>
    where
        S: FnOnce(&File) -> io::Result<()>,
    {
        let written = self
            .file
            .write_all_at(frame, self.size)
            .and_then(|()| sync(&self.file));
        if let Err(e) = written {
            if let Err(truncate) = self.file.set_len(self.size) {
                warn!("Failed to drop unfinished state batch: {}", truncate);
            }
            return Err(e);
        }
        self.size += frame.len() as u64;
        Ok(())
    }
}

pub struct StateDb {
    options: StateDbOptions,
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    log: Mutex<StateLog>,
}

impl StateDb {
    pub fn open(options: StateDbOptions) -> StorageResult<Arc<Self>> {
        fs::create_dir_all(&options.dir)?;
        let path = options.dir.join(STATE_LOG_FILE);

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        let (data, size, batches) = Self::replay(&file, &path)?;
        info!(
            "Opened state at {:?}: keys={}, batches={}, size={}",
            options.dir,
            data.len(),
            batches,
            size
        );

        Ok(Arc::new(Self {
            options,
            data: RwLock::new(data),
            log: Mutex::new(StateLog { file, size }),
        }))
    }

    /// Replace whatever is in `options.dir` with an exported state, then open it.
    pub fn open_from_export(options: StateDbOptions, export: &[u8]) -> StorageResult<Arc<Self>> {
        let (state, _): (StateExport, usize) =
            bincode::decode_from_slice(export, bincode::config::standard())?;

        fs::create_dir_all(&options.dir)?;
        let batch = WriteBatch {
            ops: state
                .entries
                .into_iter()
                .map(|(key, value)| WriteOp::Put { key, value })
                .collect(),
        };
        Self::write_fresh_log(&options.dir, &batch)?;

        info!("Restored state at {:?} from export", options.dir);
        Self::open(options)
    }

    /// True if `dir` holds no committed state.
    pub fn is_empty_dir(dir: &Path) -> bool {
        fs::metadata(dir.join(STATE_LOG_FILE))
            .map(|m| m.len() == 0)
            .unwrap_or(true)
    }

    fn replay(file: &File, path: &Path) -> StorageResult<(BTreeMap<Vec<u8>, Vec<u8>>, u64, usize)> {
        let file_size = file.metadata()?.len();
        let mut data = BTreeMap::new();
        let mut offset = 0u64;
        let mut batches = 0usize;

        while offset < file_size {
            let frame = read_frame(file, offset, file_size)
                .map_err(|e| StorageError::Internal(format!("{:#}", e)))?;
            let Some((header, payload)) = frame else {
                break;
            };
            if header.frame_type != FrameType::StateBatch {
                warn!("Unexpected frame {:?} in {:?} at {}", header.frame_type, path, offset);
                break;
            }
            let batch: WriteBatch =
                match bincode::decode_from_slice(&payload, bincode::config::standard()) {
                    Ok((batch, _)) => batch,
                    Err(e) => {
                        warn!("Failed to decode state batch at {}: {}", offset, e);
                        break;
                    }
                };

            Self::apply(&mut data, batch);
            batches += 1;
            offset += header.size as u64;
        }

        if offset < file_size {
            warn!(
                "Dropping {} bytes of incomplete transaction at the tail of {:?}",
                file_size - offset,
                path
            );
            file.set_len(offset)?;
        }

        Ok((data, offset, batches))
    }

    fn apply(data: &mut BTreeMap<Vec<u8>, Vec<u8>>, batch: WriteBatch) {
        for op in batch.ops {
            match op {
                WriteOp::Put { key, value } => {
                    data.insert(key, value);
                }
                WriteOp::Delete { key } => {
                    data.remove(&key);
                }
            }
        }
    }

    fn write_fresh_log(dir: &Path, batch: &WriteBatch) -> StorageResult<()> {
        let tmp_path = dir.join(STATE_LOG_TMP_FILE);
        let path = dir.join(STATE_LOG_FILE);

        let mut bytes = Vec::new();
        if !batch.is_empty() {
            let payload = bincode::encode_to_vec(batch, bincode::config::standard())?;
            bytes = encode_frame(FrameType::StateBatch, &payload);
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all_at(&bytes, 0)?;
        file.sync_all()?;
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    /// Start a transaction. Writes stay private to it until `commit`.
    pub fn transaction(self: &Arc<Self>) -> Transaction {
        Transaction::new(self.clone())
    }

    /// Persist and apply a batch atomically.
    pub fn write(&self, batch: WriteBatch) -> StorageResult<()> {
        let sync_on_commit = self.options.sync_on_commit;
        self.write_with(batch, |file| {
            if sync_on_commit {
                file.sync_data()
            } else {
                Ok(())
            }
        })
    }

    pub(super) fn write_with<S>(&self, batch: WriteBatch, sync: S) -> StorageResult<()>
    where
        S: FnOnce(&File) -> io::Result<()>,
    {
        if batch.is_empty() {
            return Ok(());
        }

        let payload = bincode::encode_to_vec(&batch, bincode::config::standard())?;
        let frame = encode_frame(FrameType::StateBatch, &payload);

        let mut log = self.log.lock();
        log.append(&frame, sync).map_err(|e| {
            warn!("Failed to append state batch: {}", e);
            e
        })?;

        let ops = batch.ops.len();
        Self::apply(&mut self.data.write(), batch);
        drop(log);

        debug!("Committed state batch with {} ops", ops);
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.data.read().get(key).cloned()
    }

    /// Committed entries whose key starts with `prefix`, in key order.
    pub fn scan_prefix(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.data
            .read()
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// All committed entries in key order.
    pub fn entries(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.scan_prefix(&[])
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Serialize the committed state for a snapshot.
    pub fn export(&self) -> StorageResult<Vec<u8>> {
        let export = StateExport {
            entries: self.entries(),
        };
        Ok(bincode::encode_to_vec(&export, bincode::config::standard())?)
    }

    /// Rewrite the transaction log as a single batch holding the current state.
    pub fn checkpoint(&self) -> StorageResult<()> {
        let mut log = self.log.lock();
        let batch = WriteBatch {
            ops: self
                .entries()
                .into_iter()
                .map(|(key, value)| WriteOp::Put { key, value })
                .collect(),
        };
        let before = log.size;

        Self::write_fresh_log(&self.options.dir, &batch)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.options.dir.join(STATE_LOG_FILE))?;
        log.size = file.metadata()?.len();
        log.file = file;

        info!(
            "Checkpointed state at {:?}: {} -> {} bytes",
            self.options.dir, before, log.size
        );
        Ok(())
    }

    pub fn flush(&self) -> StorageResult<()> {
        self.log.lock().file.sync_data()?;
        Ok(())
    }
}
