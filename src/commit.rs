use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::error::ReplicationError;
use crate::traits::CommitListener;
use crate::types::{Commit, LogIndex};

/// Handle returned by [`CommitListenerRegistry::add`], used to remove the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Registered {
    id: ListenerId,
    listener: Arc<dyn CommitListener>,
    /// Highest commit index delivered to this listener
    last_index: AtomicI64,
}

/// Fans commit notifications out to every registered listener.
///
/// The listener list is copy-on-write: notification iterates an immutable snapshot,
/// so registration and removal never race with delivery. Removal only affects
/// notifications that start after it returns.
pub struct CommitListenerRegistry {
    listeners: RwLock<Arc<Vec<Arc<Registered>>>>,
    next_id: AtomicU64,
}

impl Default for CommitListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CommitListenerRegistry {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Arc::new(Vec::new())),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn add(&self, listener: Arc<dyn CommitListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let registered = Arc::new(Registered {
            id,
            listener,
            last_index: AtomicI64::new(i64::MIN),
        });

        let mut guard = self.listeners.write();
        let mut next = Vec::with_capacity(guard.len() + 1);
        next.extend(guard.iter().cloned());
        next.push(registered);
        *guard = Arc::new(next);

        debug!("Registered commit listener {:?}", id);
        id
    }

    /// Returns false if the listener was not registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut guard = self.listeners.write();
        if !guard.iter().any(|r| r.id == id) {
            return false;
        }
        let next: Vec<_> = guard.iter().filter(|r| r.id != id).cloned().collect();
        *guard = Arc::new(next);

        debug!("Removed commit listener {:?}", id);
        true
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Arc<Vec<Arc<Registered>>> {
        self.listeners.read().clone()
    }

    /// Deliver `commit` to each listener that has not yet seen an index >= `commit.index`.
    pub fn notify_commit(&self, commit: Commit) {
        for registered in self.snapshot().iter() {
            let previous = registered.last_index.fetch_max(commit.index, Ordering::AcqRel);
            if previous >= commit.index {
                trace!(
                    "Listener {:?} already observed index {}, skipping {}",
                    registered.id, previous, commit
                );
                continue;
            }
            registered.listener.on_commit(commit);
        }
    }

    pub fn notify_commit_error(&self, index: LogIndex, error: &ReplicationError) {
        for registered in self.snapshot().iter() {
            registered.listener.on_commit_error(index, error);
        }
    }
}
