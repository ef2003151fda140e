use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::sync_path::SyncPath;

/// Keyed mutexes, one per path. The consumer takes the guard before acting
/// on a path so that the scheduler and the filesystem watcher can never
/// race with an in-flight operation on the same file. Operations on
/// different paths are free to interleave.
#[derive(Debug, Default)]
pub struct PathLocks {
    locks: DashMap<SyncPath, Arc<Mutex<()>>>,
}

impl PathLocks {
    pub fn new() -> PathLocks {
        PathLocks::default()
    }

    pub async fn lock(&self, path: &SyncPath) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry(path.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }
}
