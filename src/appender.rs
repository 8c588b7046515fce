//! Log appender: hands sequenced batches to the replication module.
//!
//! Batches are appended one at a time in position order. Transient failures (I/O
//! errors and negative indexes) are retried with the very same position range and
//! bytes, backing off exponentially between attempts. Only loss of leadership (or
//! another fatal replication error) ends the retry loop, failing every outstanding
//! append.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::commit::{CommitListenerRegistry, ListenerId};
use crate::error::{AppendError, ErrorHandler, ErrorSeverity, ReplicationError, log_error};
use crate::sequencer::SerializedBatch;
use crate::traits::{AppendListener, AppendResult, CommitListener, LogAppendStorage};
use crate::types::{Commit, LogIndex, PartitionId, Position};

/// Retry backoff between append attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppenderOptions {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    /// Randomize each delay within [delay / 2, delay]
    pub jitter: bool,
}

impl Default for AppenderOptions {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 10,
            max_backoff_ms: 1_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl AppenderOptions {
    /// Delay before retry number `attempt` (0-indexed).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff_ms as f64
            * self.backoff_multiplier.max(1.0).powi(attempt.min(32) as i32);
        let capped = base.min(self.max_backoff_ms as f64);
        let millis = if self.jitter {
            capped * (0.5 + rand::random::<f64>() * 0.5)
        } else {
            capped
        };
        Duration::from_millis(millis as u64)
    }
}

struct PendingAppend {
    listener: Arc<dyn AppendListener>,
    written: Option<LogIndex>,
    committed: Option<LogIndex>,
}

/// Appends waiting for their commit, keyed by highest position.
#[derive(Default)]
struct PendingAppends {
    entries: Mutex<BTreeMap<Position, PendingAppend>>,
}

impl PendingAppends {
    fn insert(&self, highest_position: Position, listener: Arc<dyn AppendListener>) {
        self.entries.lock().insert(
            highest_position,
            PendingAppend {
                listener,
                written: None,
                committed: None,
            },
        );
    }

    fn remove(&self, highest_position: Position) -> Option<Arc<dyn AppendListener>> {
        self.entries
            .lock()
            .remove(&highest_position)
            .map(|p| p.listener)
    }

    /// Record the write; fires `on_write` and, if the commit already arrived, `on_commit`.
    fn written(&self, highest_position: Position, index: LogIndex) {
        let (listener, committed) = {
            let mut entries = self.entries.lock();
            let Some(pending) = entries.get_mut(&highest_position) else {
                return;
            };
            pending.written = Some(index);
            let listener = pending.listener.clone();
            let committed = pending.committed;
            if committed.is_some() {
                entries.remove(&highest_position);
            }
            (listener, committed)
        };

        listener.on_write(index);
        if let Some(commit_index) = committed {
            listener.on_commit(commit_index);
        }
    }

    fn committed(&self, commit: Commit) {
        let mut ready = Vec::new();
        {
            let mut entries = self.entries.lock();
            let covered: Vec<Position> = entries
                .range(..=commit.position)
                .map(|(position, _)| *position)
                .collect();
            for position in covered {
                let Some(pending) = entries.get_mut(&position) else {
                    continue;
                };
                match pending.written {
                    Some(index) => {
                        if let Some(p) = entries.remove(&position) {
                            ready.push((p.listener, index));
                        }
                    }
                    // on_commit is deferred until on_write has fired
                    None => pending.committed = Some(commit.index),
                }
            }
        }

        for (listener, index) in ready {
            listener.on_commit(index);
        }
    }

    fn commit_failed(&self, index: LogIndex, error: &ReplicationError) {
        let listeners: Vec<_> = self
            .entries
            .lock()
            .values()
            .filter(|p| p.written == Some(index))
            .map(|p| p.listener.clone())
            .collect();
        for listener in listeners {
            listener.on_commit_error(index, error);
        }
    }

    /// Fail every written but uncommitted append.
    fn fail_all(&self, error: &ReplicationError) {
        let drained: Vec<_> = std::mem::take(&mut *self.entries.lock())
            .into_values()
            .collect();
        for pending in drained {
            match pending.written {
                Some(index) => pending.listener.on_commit_error(index, error),
                None => pending
                    .listener
                    .on_write_error(&AppendError::from(error.clone())),
            }
        }
    }
}

struct AppenderCommitListener {
    pending: Arc<PendingAppends>,
}

impl CommitListener for AppenderCommitListener {
    fn on_commit(&self, commit: Commit) {
        self.pending.committed(commit);
    }

    fn on_commit_error(&self, index: LogIndex, error: &ReplicationError) {
        self.pending.commit_failed(index, error);
    }
}

pub struct LogAppender {
    partition_id: PartitionId,
    storage: Arc<dyn LogAppendStorage>,
    registry: Arc<CommitListenerRegistry>,
    listener_id: ListenerId,
    options: AppenderOptions,
    pending: Arc<PendingAppends>,
    last_written_index: AtomicI64,
    closed: watch::Sender<bool>,
}

impl LogAppender {
    pub fn new(
        partition_id: PartitionId,
        storage: Arc<dyn LogAppendStorage>,
        registry: Arc<CommitListenerRegistry>,
        options: AppenderOptions,
    ) -> Arc<Self> {
        let pending = Arc::new(PendingAppends::default());
        let listener_id = registry.add(Arc::new(AppenderCommitListener {
            pending: pending.clone(),
        }));
        let (closed, _) = watch::channel(false);

        Arc::new(Self {
            partition_id,
            storage,
            registry,
            listener_id,
            options,
            pending,
            last_written_index: AtomicI64::new(-1),
            closed,
        })
    }

    /// Index returned by the most recent successful append.
    pub fn last_written_index(&self) -> LogIndex {
        self.last_written_index.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Stop appending. In-flight retries end with `AppendError::Closed`.
    pub fn close(&self) {
        if !self.closed.send_replace(true) {
            self.registry.remove(self.listener_id);
            info!("Log appender of partition {} closed", self.partition_id);
        }
    }

    /// Append one range of positions, retrying transient failures until it is accepted.
    pub async fn append(
        &self,
        lowest_position: Position,
        highest_position: Position,
        data: Vec<u8>,
        listener: Option<Arc<dyn AppendListener>>,
    ) -> AppendResult<LogIndex> {
        if let Some(listener) = listener.clone() {
            self.pending.insert(highest_position, listener);
        }

        match self
            .append_with_retry(lowest_position, highest_position, data)
            .await
        {
            Ok(index) => {
                self.last_written_index.fetch_max(index, Ordering::AcqRel);
                self.pending.written(highest_position, index);
                trace!(
                    "Partition {} wrote [{}, {}] at index {}",
                    self.partition_id, lowest_position, highest_position, index
                );
                Ok(index)
            }
            Err(err) => {
                if let Some(listener) = self.pending.remove(highest_position) {
                    listener.on_write_error(&err);
                }
                Err(err)
            }
        }
    }

    async fn append_with_retry(
        &self,
        lowest_position: Position,
        highest_position: Position,
        data: Vec<u8>,
    ) -> AppendResult<LogIndex> {
        let mut closed = self.closed.subscribe();
        let mut attempt = 0u32;

        loop {
            if *closed.borrow_and_update() {
                return Err(AppendError::Closed);
            }

            match self
                .storage
                .append(lowest_position, highest_position, data.clone())
                .await
            {
                Ok(index) if index >= 0 => return Ok(index),
                Ok(index) => {
                    warn!(
                        "Partition {}: append of [{}, {}] rejected with index {}, retrying",
                        self.partition_id, lowest_position, highest_position, index
                    );
                }
                Err(err) if err.severity() == ErrorSeverity::Recoverable => {
                    log_error(&err, "append", self.partition_id);
                }
                Err(err) => {
                    log_error(&err, "append", self.partition_id);
                    return Err(err.into());
                }
            }

            let delay = self.options.backoff(attempt);
            attempt = attempt.saturating_add(1);
            debug!(
                "Partition {}: retry #{} of [{}, {}] in {:?}",
                self.partition_id, attempt, lowest_position, highest_position, delay
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = closed.changed() => return Err(AppendError::Closed),
            }
        }
    }

    /// Drive the appender from the sequencer's batch channel until closed or
    /// leadership is lost.
    pub async fn run(self: Arc<Self>, mut batches: mpsc::UnboundedReceiver<SerializedBatch>) {
        let mut closed = self.closed.subscribe();
        info!("Log appender of partition {} started", self.partition_id);

        let terminal = loop {
            if *closed.borrow_and_update() {
                break AppendError::Closed;
            }

            let batch = tokio::select! {
                batch = batches.recv() => match batch {
                    Some(batch) => batch,
                    None => break AppendError::Closed,
                },
                _ = closed.changed() => continue,
            };

            if let Err(err) = self
                .append(
                    batch.lowest_position,
                    batch.highest_position,
                    batch.data,
                    batch.listener,
                )
                .await
            {
                break err;
            }
        };

        if terminal != AppendError::Closed {
            warn!(
                "Log appender of partition {} stopping: {}",
                self.partition_id, terminal
            );
        }

        // Nothing queued behind a failed append may be written: it would leave a gap.
        batches.close();
        while let Ok(batch) = batches.try_recv() {
            if let Some(listener) = batch.listener {
                listener.on_write_error(&terminal);
            }
        }
        let replication_error = match &terminal {
            AppendError::NotLeader => ReplicationError::NotLeader,
            _ => ReplicationError::Closed,
        };
        self.pending.fail_all(&replication_error);
        self.close();
    }
}
