//! Drains the sync queue. For each item the consumer re-derives the right
//! operation from *fresh* local and remote state (the queue entry may be
//! stale by the time it surfaces), takes the per-path lock, performs the
//! operation over HTTP, and arbitrates retries.
//!
//! No failure of a single item ever aborts the consumer; terminal failures
//! are logged and the next item proceeds.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};

use crate::changes::{compare_file_info, SyncSide};
use crate::delta::{self, Delta, Signature};
use crate::errors::{ApiErrorKind, SyncError};
use crate::locks::PathLocks;
use crate::metadata::{hash_bytes, FileMetadata};
use crate::protocol;
use crate::queue::{SyncQueue, SyncQueueItem};
use crate::sync_path::SyncPath;
use crate::transport::ApiClient;
use crate::workspace::{IgnoreRules, Workspace};

const INITIAL_BACKOFF: Duration = Duration::from_millis(250);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// What the consumer decided to do for one queue item, after looking at
/// the current state of both replicas. Modeled as a tagged variant with a
/// single `apply` entry point so the drain loop doesn't care which
/// operations exist.
enum SyncAction {
    Push { local: FileMetadata, remote: Option<FileMetadata> },
    Pull { expected_modified: DateTime<Utc> },
    DeleteLocal,
    DeleteRemote,
    Skip(&'static str),
}

impl SyncAction {
    // The full metadata (signatures included) is far too noisy for logs
    fn name(&self) -> &'static str {
        match self {
            SyncAction::Push { .. } => "push",
            SyncAction::Pull { .. } => "pull",
            SyncAction::DeleteLocal => "delete local",
            SyncAction::DeleteRemote => "delete remote",
            SyncAction::Skip(_) => "skip",
        }
    }
}

pub struct SyncConsumer {
    api: Arc<ApiClient>,
    workspace: Workspace,
    own_email: String,
    locks: Arc<PathLocks>,
    ignore: Arc<RwLock<IgnoreRules>>,
    /// Metadata of files as this consumer last saw or wrote them. Kept so
    /// a pass that immediately follows a drain doesn't re-enqueue work.
    local_state: Mutex<HashMap<SyncPath, FileMetadata>>,
    /// An email token lets the consumer re-authenticate once when the
    /// access token expires; without one, auth failure pauses the drain.
    email_token: Option<String>,
    paused: AtomicBool,
    max_retries: u32,
}

impl SyncConsumer {
    pub fn new(
        api: Arc<ApiClient>,
        workspace: Workspace,
        own_email: String,
        locks: Arc<PathLocks>,
        ignore: Arc<RwLock<IgnoreRules>>,
        email_token: Option<String>,
        max_retries: u32,
    ) -> SyncConsumer {
        SyncConsumer {
            api,
            workspace,
            own_email,
            locks,
            ignore,
            local_state: Mutex::new(HashMap::new()),
            email_token,
            paused: AtomicBool::new(false),
            max_retries,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Drains the queue to empty, sequentially, in priority order.
    pub async fn consume_all(&self, queue: &tokio::sync::Mutex<SyncQueue>) {
        loop {
            if self.is_paused() {
                warn!("Consumer is paused (authentication failed); leaving queue untouched");
                return;
            }
            let item = match queue.lock().await.pop() {
                Some(item) => item,
                None => return,
            };
            if let Err(e) = self.process_item(&item).await {
                // Terminal for this item only; the queue keeps draining
                match e.api_kind() {
                    Some(ApiErrorKind::PermissionDenied) => {
                        warn!("Permission denied for '{}' as {}: {e}", item.path, self.own_email)
                    }
                    _ => error!("Failed to sync '{}': {e}", item.path),
                }
            }
        }
    }

    async fn process_item(&self, item: &SyncQueueItem) -> Result<(), SyncError> {
        let _guard = self.locks.lock(&item.path).await;

        // Rules may have changed since this item was enqueued
        if self.ignore.read().unwrap().is_ignored(&item.path) {
            debug!("'{}' is now ignored; skipping", item.path);
            return Ok(());
        }

        let action = self.decide(item).await?;
        debug!("'{}': {}", item.path, action.name());
        self.apply(action, &item.path).await
    }

    /// Re-derives the operation from current state on both sides.
    async fn decide(&self, item: &SyncQueueItem) -> Result<SyncAction, SyncError> {
        let local = self.read_local_metadata(&item.path).await?;
        let remote = self.with_retries("get_metadata", || self.api.get_metadata(&item.path)).await?;

        let verdict = compare_file_info(&item.path, local.as_ref(), remote.as_ref(), &self.own_email);
        // Track anything observed in sync, so that a later local deletion
        // of it is recognized as a deletion
        if verdict.is_none() {
            if let Some(l) = &local {
                self.remember(l.clone());
            }
        }
        let action = match verdict {
            None => SyncAction::Skip("in sync"),
            Some(change) => match (change.side, &local, &remote) {
                (SyncSide::Local, Some(l), _) => SyncAction::Push { local: l.clone(), remote: remote.clone() },
                (SyncSide::Local, None, Some(_)) => SyncAction::DeleteRemote,
                (SyncSide::Local, None, None) => SyncAction::Skip("nothing on either side"),
                (SyncSide::Remote, None, Some(r)) => {
                    // Our own file, gone locally but previously synced in
                    // this session: the deletion is real and propagates.
                    // Otherwise (fresh workspace, someone else's data) the
                    // remote copy is the truth and we pull it.
                    if item.path.owner() == self.own_email && self.has_synced(&item.path) {
                        SyncAction::DeleteRemote
                    } else {
                        SyncAction::Pull { expected_modified: r.last_modified }
                    }
                }
                (SyncSide::Remote, Some(_), Some(r)) => SyncAction::Pull { expected_modified: r.last_modified },
                (SyncSide::Remote, Some(_), None) => SyncAction::DeleteLocal,
                (SyncSide::Remote, None, None) => SyncAction::Skip("nothing on either side"),
            },
        };
        Ok(action)
    }

    async fn apply(&self, action: SyncAction, path: &SyncPath) -> Result<(), SyncError> {
        match action {
            SyncAction::Skip(reason) => {
                debug!("'{path}': skipped ({reason})");
                Ok(())
            }
            SyncAction::Push { local, remote } => self.push(path, local, remote).await,
            SyncAction::Pull { expected_modified } => self.pull(path, expected_modified).await,
            SyncAction::DeleteLocal => self.delete_local(path).await,
            SyncAction::DeleteRemote => self.delete_remote(path).await,
        }
    }

    // ---- operations ----

    async fn push(
        &self,
        path: &SyncPath,
        local: FileMetadata,
        mut remote: Option<FileMetadata>,
    ) -> Result<(), SyncError> {
        let disk = self.workspace.resolve(path);
        let data = tokio::fs::read(&disk)
            .await
            .map_err(|e| SyncError::io(disk.display().to_string(), e))?;

        // A create that loses a race comes back AlreadyExists and converts
        // into a diff push, so at most two iterations happen here.
        loop {
            match &remote {
                Some(r) => {
                    let base_sig = r.decode_signature()?;
                    let delta = delta::diff(&base_sig, &data);
                    return self.push_delta(path, &data, &delta, &local).await;
                }
                None => {
                    let result = self
                        .with_retries("create", || self.api.create(path, data.clone()))
                        .await;
                    match result {
                        Ok(()) => {
                            info!("Created '{path}' on the server ({} bytes)", data.len());
                            self.remember(local.clone());
                            return Ok(());
                        }
                        Err(e) if e.api_kind() == Some(ApiErrorKind::AlreadyExists) => {
                            debug!("'{path}' already exists remotely; converting to a diff push");
                            remote = self
                                .with_retries("get_metadata", || self.api.get_metadata(path))
                                .await?;
                            if remote.is_none() {
                                // Created and deleted under us; try create again next pass
                                return Err(e);
                            }
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }

    async fn push_delta(
        &self,
        path: &SyncPath,
        data: &[u8],
        delta: &Delta,
        local: &FileMetadata,
    ) -> Result<(), SyncError> {
        let result = self
            .with_retries("apply_diff", || self.api.apply_diff(path, delta, &local.hash))
            .await;
        match result {
            Ok(response) => {
                info!("Pushed '{path}' via diff (hash {})", response.applied_hash);
                self.remember(local.clone());
                Ok(())
            }
            Err(e) if e.api_kind() == Some(ApiErrorKind::HashMismatch) => {
                // The server's copy is not what our signature assumed.
                // Retry once with a whole-file delta, which applies to any base.
                warn!("Hash mismatch pushing '{path}'; retrying with a full upload");
                let full = Delta::full(data);
                match self
                    .with_retries("apply_diff(full)", || self.api.apply_diff(path, &full, &local.hash))
                    .await
                {
                    Ok(_) => {
                        info!("Pushed '{path}' with a full upload");
                        self.remember(local.clone());
                        Ok(())
                    }
                    Err(e2) => {
                        // Leave both sides intact; surfaced at error level
                        error!("Full upload of '{path}' failed after hash mismatch: {e2}");
                        Err(e2)
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn pull(&self, path: &SyncPath, expected_modified: DateTime<Utc>) -> Result<(), SyncError> {
        let disk = self.workspace.resolve(path);
        let base = match tokio::fs::read(&disk).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => vec![],
            Err(e) => return Err(SyncError::io(disk.display().to_string(), e)),
        };
        let signature = if base.is_empty() { Signature::empty() } else { Signature::of(&base) };

        let response = match self.with_retries("get_diff", || self.api.get_diff(path, &signature)).await {
            Ok(r) => r,
            Err(e) if e.api_kind() == Some(ApiErrorKind::NotFound) => {
                // Deleted remotely between list and fetch
                debug!("'{path}' vanished remotely; deleting local copy");
                return self.delete_local(path).await;
            }
            Err(e) => return Err(e),
        };

        let delta: Delta = protocol::decode_blob(&response.diff)?;
        let mut new_data = delta::apply(&base, &delta)?;
        if hash_bytes(&new_data) != response.expected_hash {
            // The patched result doesn't reproduce the server's content
            // (our base must have changed since the signature was taken).
            warn!("Patched content for '{path}' doesn't match the expected hash; downloading in full");
            new_data = self.with_retries("download", || self.api.download(path)).await?;
        }

        self.write_atomically(path, &disk, &new_data, expected_modified).await?;
        info!("Pulled '{path}' ({} bytes)", new_data.len());
        Ok(())
    }

    /// Stages into a temp file next to the target and renames into place,
    /// so readers never observe a half-written file, then pins the local
    /// mtime to the server's so the conflict rule doesn't see a phantom
    /// local edit on the next pass.
    async fn write_atomically(
        &self,
        path: &SyncPath,
        disk: &Path,
        data: &[u8],
        modified: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        let meta = FileMetadata::from_bytes(path.clone(), data, modified)?;

        let parent = disk.parent().expect("sync paths always have a parent").to_path_buf();
        let target = disk.to_path_buf();
        let data = data.to_vec();
        let result = tokio::task::spawn_blocking(move || -> Result<(), std::io::Error> {
            std::fs::create_dir_all(&parent)?;
            let mut tmp = tempfile::NamedTempFile::new_in(&parent)?;
            std::io::Write::write_all(&mut tmp, &data)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&target).map_err(|e| e.error)?;
            filetime::set_file_mtime(&target, filetime::FileTime::from_system_time(modified.into()))
        })
        .await
        .map_err(|e| SyncError::Transport(format!("write task: {e}")))?;
        result.map_err(|e| SyncError::io(disk.display().to_string(), e))?;

        self.remember(meta);
        Ok(())
    }

    async fn delete_local(&self, path: &SyncPath) -> Result<(), SyncError> {
        let disk = self.workspace.resolve(path);
        match tokio::fs::remove_file(&disk).await {
            Ok(()) => info!("Deleted local '{path}'"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(SyncError::io(disk.display().to_string(), e)),
        }
        self.local_state.lock().unwrap().remove(path);
        Ok(())
    }

    async fn delete_remote(&self, path: &SyncPath) -> Result<(), SyncError> {
        match self.with_retries("delete", || self.api.delete(path)).await {
            Ok(()) => info!("Deleted '{path}' on the server"),
            // Already gone is the outcome we wanted
            Err(e) if e.api_kind() == Some(ApiErrorKind::NotFound) => {}
            Err(e) => return Err(e),
        }
        self.local_state.lock().unwrap().remove(path);
        Ok(())
    }

    // ---- plumbing ----

    async fn read_local_metadata(&self, path: &SyncPath) -> Result<Option<FileMetadata>, SyncError> {
        let disk = self.workspace.resolve(path);
        if !disk.is_file() {
            return Ok(None);
        }
        let rel = path.clone();
        tokio::task::spawn_blocking(move || FileMetadata::from_file(&disk, rel))
            .await
            .map_err(|e| SyncError::Transport(format!("hash task: {e}")))?
            .map(Some)
    }

    fn remember(&self, meta: FileMetadata) {
        self.local_state.lock().unwrap().insert(meta.path.clone(), meta);
    }

    fn has_synced(&self, path: &SyncPath) -> bool {
        self.local_state.lock().unwrap().contains_key(path)
    }

    /// Runs `op`, retrying transient failures with bounded exponential
    /// backoff. An expired token gets one re-authentication attempt; if
    /// that fails too the consumer pauses.
    async fn with_retries<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, SyncError>>,
    {
        let mut delay = INITIAL_BACKOFF;
        let mut reauthed = false;
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    debug!("{what} failed (attempt {attempt}/{}): {e}; backing off {delay:?}", self.max_retries);
                    tokio::time::sleep(delay).await;
                    delay = std::cmp::min(delay * 2, MAX_BACKOFF);
                    attempt += 1;
                }
                Err(e) if e.api_kind() == Some(ApiErrorKind::Unauthorized) && !reauthed => {
                    reauthed = true;
                    match &self.email_token {
                        Some(token) => {
                            warn!("Access token rejected; re-authenticating");
                            if let Err(auth_err) = self.api.validate_email_token(token).await {
                                error!("Re-authentication failed: {auth_err}; pausing consumer");
                                self.paused.store(true, Ordering::SeqCst);
                                return Err(e);
                            }
                        }
                        None => {
                            error!("Access token rejected and no email token configured; pausing consumer");
                            self.paused.store(true, Ordering::SeqCst);
                            return Err(e);
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}
