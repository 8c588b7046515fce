//! Log deletion driven by persisted snapshots.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::storage::snapshot::PersistedSnapshot;
use crate::traits::{LogCompactionStorage, PersistedSnapshotListener};
use crate::types::{PartitionId, Position, UNSET_POSITION};

/// Deletes the log below each new snapshot's compaction bound.
///
/// Notifications only enqueue the bound; a worker task does the deletion. Bounds not
/// above the last successful one are ignored, and a failed deletion is left to the
/// next snapshot, whose higher bound covers it.
pub struct LogDeletionService {
    partition_id: PartitionId,
    bounds: mpsc::UnboundedSender<Position>,
    compacted: watch::Receiver<Position>,
}

impl LogDeletionService {
    /// Start the deletion worker. Must be called within a tokio runtime.
    pub fn start(partition_id: PartitionId, storage: Arc<dyn LogCompactionStorage>) -> Arc<Self> {
        let (bounds, rx) = mpsc::unbounded_channel();
        let (compacted_tx, compacted) = watch::channel(UNSET_POSITION);
        tokio::spawn(run(partition_id, storage, rx, compacted_tx));

        Arc::new(Self {
            partition_id,
            bounds,
            compacted,
        })
    }

    /// Highest bound compacted so far.
    pub fn compacted_bound(&self) -> Position {
        *self.compacted.borrow()
    }

    /// Wait until the log has been compacted up to at least `bound`.
    pub async fn wait_for_bound(&self, bound: Position) -> bool {
        let mut rx = self.compacted.clone();
        loop {
            if *rx.borrow_and_update() >= bound {
                return true;
            }
            if rx.changed().await.is_err() {
                return false;
            }
        }
    }

    pub fn request(&self, bound: Position) {
        if self.bounds.send(bound).is_err() {
            debug!(
                "Deletion service of partition {} stopped, dropping bound {}",
                self.partition_id, bound
            );
        }
    }
}

impl PersistedSnapshotListener for LogDeletionService {
    fn on_new_snapshot(&self, snapshot: &PersistedSnapshot) {
        self.request(snapshot.compaction_bound());
    }
}

async fn run(
    partition_id: PartitionId,
    storage: Arc<dyn LogCompactionStorage>,
    mut bounds: mpsc::UnboundedReceiver<Position>,
    compacted: watch::Sender<Position>,
) {
    let mut last_bound = UNSET_POSITION;

    while let Some(mut bound) = bounds.recv().await {
        // Only the highest pending bound matters
        while let Ok(next) = bounds.try_recv() {
            bound = bound.max(next);
        }
        if bound <= last_bound {
            debug!(
                "Partition {}: bound {} already compacted (at {})",
                partition_id, bound, last_bound
            );
            continue;
        }

        match storage.delete_before(bound).await {
            Ok(removed) => {
                last_bound = bound;
                compacted.send_replace(bound);
                info!(
                    "Partition {}: compacted log below {}, {} segments removed",
                    partition_id, bound, removed
                );
            }
            Err(e) => warn!(
                "Partition {}: failed to compact log below {}: {}",
                partition_id, bound, e
            ),
        }
    }

    debug!("Deletion service of partition {} stopped", partition_id);
}
