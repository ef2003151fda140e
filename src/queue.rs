use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};

use crate::changes::FileChangeInfo;
use crate::sync_path::SyncPath;

/// A queued change with its numeric priority. Lower numbers drain first;
/// ties are broken by path so that the drain order is deterministic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncQueueItem {
    pub priority: u64,
    pub path: SyncPath,
    pub change: FileChangeInfo,
}

impl Ord for SyncQueueItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.priority, &self.path).cmp(&(other.priority, &other.path))
    }
}

impl PartialOrd for SyncQueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Priority queue of pending changes. A path can be queued at most once:
/// the scheduler and the filesystem watcher both feed this queue, and a
/// path that is already waiting doesn't need a second entry (the consumer
/// looks at fresh state when the item is processed anyway).
#[derive(Debug, Default)]
pub struct SyncQueue {
    heap: BinaryHeap<Reverse<SyncQueueItem>>,
    queued: HashSet<SyncPath>,
}

impl SyncQueue {
    pub fn new() -> SyncQueue {
        SyncQueue::default()
    }

    /// Returns false if the path was already queued.
    pub fn push(&mut self, change: FileChangeInfo) -> bool {
        if !self.queued.insert(change.path.clone()) {
            return false;
        }
        self.heap.push(Reverse(SyncQueueItem {
            priority: change.priority(),
            path: change.path.clone(),
            change,
        }));
        true
    }

    pub fn pop(&mut self) -> Option<SyncQueueItem> {
        let Reverse(item) = self.heap.pop()?;
        self.queued.remove(&item.path);
        Some(item)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
