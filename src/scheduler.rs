//! Drives the client: a jittered fixed-cadence loop that lists datasites,
//! computes changes, fills the queue and drains it — plus a filesystem
//! watcher that turns local edits into targeted rescans of just the
//! subtrees that changed.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use log::{debug, error, info, warn};
use notify::Watcher;
use rand::Rng;
use tokio::sync::{mpsc, watch};

use crate::changes::{compute_changes, DatasiteChanges};
use crate::config::ClientConfig;
use crate::consumer::SyncConsumer;
use crate::errors::SyncError;
use crate::locks::PathLocks;
use crate::queue::SyncQueue;
use crate::scanner::scan_tree;
use crate::sync_path::SyncPath;
use crate::transport::ApiClient;
use crate::workspace::{IgnoreRules, Workspace};

/// How long to keep absorbing filesystem events before acting on them, so
/// a burst of writes becomes one rescan.
const WATCH_DEBOUNCE: Duration = Duration::from_millis(250);

/// How long shutdown lets the consumer finish in-flight work.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub struct SyncManager {
    api: Arc<ApiClient>,
    workspace: Workspace,
    own_email: String,
    queue: Arc<tokio::sync::Mutex<SyncQueue>>,
    consumer: SyncConsumer,
    ignore: Arc<RwLock<IgnoreRules>>,
    interval: Duration,
}

impl SyncManager {
    pub fn from_config(config: &ClientConfig) -> Result<SyncManager, SyncError> {
        let workspace = Workspace::new(&config.data_dir);
        workspace.ensure_dirs(&config.email)?;

        let api = Arc::new(ApiClient::new(
            &config.server_url,
            &config.email,
            config.token(),
            Duration::from_secs(config.timeout_secs),
        )?);

        let ignore = Arc::new(RwLock::new(workspace.load_ignore()));
        let locks = Arc::new(PathLocks::new());
        let consumer = SyncConsumer::new(
            api.clone(),
            workspace.clone(),
            config.email.clone(),
            locks,
            ignore.clone(),
            config.email_token.clone(),
            config.max_retries,
        );

        Ok(SyncManager {
            api,
            workspace,
            own_email: config.email.clone(),
            queue: Arc::new(tokio::sync::Mutex::new(SyncQueue::new())),
            consumer,
            ignore,
            interval: Duration::from_millis(config.sync_interval_ms),
        })
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    /// Runs until `shutdown` flips to true, then drains in-flight work for
    /// a bounded grace period. Anything still queued is dropped; the queue
    /// is rebuilt from a fresh scan on the next startup.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let (dirty_tx, mut dirty_rx) = mpsc::unbounded_channel::<PathBuf>();
        // Keep the watcher alive for the lifetime of the loop. Events are
        // delivered on notify's own thread and bridged into the runtime.
        let _watcher = self.start_watcher(dirty_tx);

        loop {
            let tick = jittered(self.interval);
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(tick) => {
                    self.full_pass().await;
                }
                Some(first) = dirty_rx.recv() => {
                    // Coalesce the burst, then rescan just what changed
                    tokio::time::sleep(WATCH_DEBOUNCE).await;
                    let mut dirty = vec![first];
                    while let Ok(p) = dirty_rx.try_recv() {
                        dirty.push(p);
                    }
                    let subtrees = self.dirty_subtrees(dirty);
                    if !subtrees.is_empty() {
                        self.targeted_pass(&subtrees).await;
                    }
                }
            }
        }

        info!("Shutting down: draining consumer for up to {SHUTDOWN_GRACE:?}");
        let drain = self.consumer.consume_all(&self.queue);
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            let remaining = self.queue.lock().await.len();
            warn!("Shutdown grace expired with {remaining} items left; they will be rediscovered on next startup");
        }
    }

    /// One full sync pass: per-datasite server state, change computation,
    /// enqueue (permission files ahead of data), drain.
    pub async fn full_pass(&self) {
        if self.consumer.is_paused() {
            warn!("Skipping sync pass: consumer is paused until authentication succeeds");
            return;
        }

        // Re-read ignore rules so user edits take effect between passes
        *self.ignore.write().unwrap() = self.workspace.load_ignore();

        let states = match self.api.datasite_states().await {
            Ok(s) => s,
            Err(e) => {
                warn!("Couldn't list datasite states: {e}");
                return;
            }
        };

        let mut emails: Vec<String> = states.keys().cloned().collect();
        if !states.contains_key(&self.own_email) {
            emails.push(self.own_email.clone());
        }
        emails.sort();
        debug!("Syncing {} datasites", emails.len());

        let mut enqueued = 0;
        for email in emails {
            let subtree = match SyncPath::try_from(email.as_str()) {
                Ok(p) => p,
                Err(e) => {
                    warn!("Server reported datasite '{email}' with an invalid name: {e}");
                    continue;
                }
            };
            let remote = states.get(&email).cloned().unwrap_or_default();
            let changes = self.compute_local_changes(&subtree, remote).await;
            enqueued += self.enqueue(changes).await;
        }

        if enqueued > 0 {
            debug!("Enqueued {enqueued} changes");
        }
        self.consumer.consume_all(&self.queue).await;
    }

    async fn targeted_pass(&self, subtrees: &[SyncPath]) {
        for subtree in subtrees {
            debug!("Targeted rescan of '{subtree}'");
            let remote = match self.api.dir_state(subtree.as_str()).await {
                Ok(r) => r,
                Err(e) => {
                    warn!("Couldn't fetch remote state for '{subtree}': {e}");
                    continue;
                }
            };
            let changes = self.compute_local_changes(subtree, remote).await;
            self.enqueue(changes).await;
        }
        self.consumer.consume_all(&self.queue).await;
    }

    async fn compute_local_changes(
        &self,
        subtree: &SyncPath,
        remote: Vec<crate::metadata::FileMetadata>,
    ) -> DatasiteChanges {
        let root = self.workspace.datasites_dir();
        let ignore = self.ignore.read().unwrap().clone();
        let scan_subtree = subtree.clone();
        let local = tokio::task::spawn_blocking(move || scan_tree(&root, Some(&scan_subtree), &ignore))
            .await
            .unwrap_or_else(|e| {
                error!("Scan task failed: {e}");
                vec![]
            });
        let ignore = self.ignore.read().unwrap().clone();
        compute_changes(&local, &remote, &self.own_email, &ignore)
    }

    /// Permission-file changes enter the queue before data files and carry
    /// strictly smaller priorities, so within a pass every permission
    /// update reaches the wire before the first data operation.
    async fn enqueue(&self, changes: DatasiteChanges) -> usize {
        let mut queue = self.queue.lock().await;
        let mut n = 0;
        for change in changes.permissions.into_iter().chain(changes.files) {
            if queue.push(change) {
                n += 1;
            }
        }
        n
    }

    /// Reduces raw watcher paths to the set of sync subtrees to rescan.
    fn dirty_subtrees(&self, raw: Vec<PathBuf>) -> Vec<SyncPath> {
        let root = self.workspace.datasites_dir();
        let ignore = self.ignore.read().unwrap();
        let mut seen = HashSet::new();
        let mut result = vec![];
        for p in raw {
            let rel = match p.strip_prefix(&root) {
                Ok(r) if !r.as_os_str().is_empty() => r,
                _ => continue,
            };
            let path = match SyncPath::try_from(rel) {
                Ok(p) => p,
                Err(_) => continue,
            };
            if ignore.is_ignored(&path) {
                continue;
            }
            // Rescan the containing directory (or the datasite root for
            // top-level entries)
            let subtree = path.parent().unwrap_or(path);
            if seen.insert(subtree.clone()) {
                result.push(subtree);
            }
        }
        // Drop subtrees covered by a shallower one in the same batch
        result.sort_by_key(|p| p.depth());
        let mut pruned: Vec<SyncPath> = vec![];
        for s in result {
            if !pruned.iter().any(|kept| s.is_under(kept.as_str())) {
                pruned.push(s);
            }
        }
        pruned
    }

    fn start_watcher(&self, dirty_tx: mpsc::UnboundedSender<PathBuf>) -> Option<notify::RecommendedWatcher> {
        let datasites = self.workspace.datasites_dir();
        let mut watcher = match notify::recommended_watcher(move |result: Result<notify::Event, notify::Error>| {
            match result {
                Ok(event) => {
                    for path in event.paths {
                        let _ = dirty_tx.send(path);
                    }
                }
                Err(e) => warn!("Watch error: {e}"),
            }
        }) {
            Ok(w) => w,
            Err(e) => {
                warn!("Filesystem watching unavailable ({e}); relying on the scheduler cadence only");
                return None;
            }
        };
        if let Err(e) = watcher.watch(&datasites, notify::RecursiveMode::Recursive) {
            warn!("Couldn't watch '{}': {e}", datasites.display());
            return None;
        }
        debug!("Watching '{}'", datasites.display());
        Some(watcher)
    }
}

fn jittered(base: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.5..1.5);
    base.mul_f64(factor)
}
