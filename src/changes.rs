//! Decides what needs to happen to reconcile a datasite's local and remote
//! state: for every path present on either side, a verdict about which
//! side holds the version that should win.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::metadata::FileMetadata;
use crate::sync_path::SyncPath;
use crate::workspace::IgnoreRules;

/// Which replica holds the version that should propagate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncSide {
    Local,
    Remote,
}

/// One file-level change intent, as queued for the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChangeInfo {
    pub path: SyncPath,
    /// The side whose version wins (or whose deletion wins).
    pub side: SyncSide,
    pub last_modified: DateTime<Utc>,
    pub file_size: u64,
}

impl FileChangeInfo {
    /// Queue priority: permission files drain before everything else, and
    /// within data files, small updates drain first.
    pub fn priority(&self) -> u64 {
        if self.path.is_permission_file() {
            0
        } else {
            std::cmp::max(1, self.file_size)
        }
    }
}

/// The changes for one datasite, permission files split out so that the
/// scheduler can enqueue (and the server can see) permission updates before
/// any data-file operation from the same pass.
#[derive(Debug, Default)]
pub struct DatasiteChanges {
    pub permissions: Vec<FileChangeInfo>,
    pub files: Vec<FileChangeInfo>,
}

impl DatasiteChanges {
    pub fn is_empty(&self) -> bool {
        self.permissions.is_empty() && self.files.is_empty()
    }

    pub fn len(&self) -> usize {
        self.permissions.len() + self.files.len()
    }
}

/// The verdict for a single path. `own_email` decides the asymmetric cases:
/// the caller's own datasite flows client→server (a missing side means a
/// deletion to propagate), everyone else's flows server→client.
pub fn compare_file_info(
    path: &SyncPath,
    local: Option<&FileMetadata>,
    remote: Option<&FileMetadata>,
    own_email: &str,
) -> Option<FileChangeInfo> {
    let owned_by_me = path.owner() == own_email;
    match (local, remote) {
        (None, None) => None,

        // Only the remote has it: pull. When this is our own datasite and
        // the consumer has previously synced the file in this session, it
        // refines the verdict into a remote delete (the local deletion is
        // authoritative); without that knowledge, pulling is the safe
        // default — a fresh workspace must restore, not destroy.
        (None, Some(r)) => Some(FileChangeInfo {
            path: path.clone(),
            side: SyncSide::Remote,
            last_modified: r.last_modified,
            file_size: r.file_size,
        }),

        // Only we have it: push our copy if it's ours, otherwise the owner
        // (via the server) deleted it and our copy must go.
        (Some(l), None) => Some(FileChangeInfo {
            path: path.clone(),
            side: if owned_by_me { SyncSide::Local } else { SyncSide::Remote },
            last_modified: l.last_modified,
            file_size: l.file_size,
        }),

        (Some(l), Some(r)) => {
            if l.hash == r.hash {
                return None;
            }
            // Conflict: strictly newer modification time wins; equal times
            // are broken by comparing hashes, which is deterministic,
            // symmetric in the two sides, and never a no-op when the
            // hashes differ.
            let local_wins = match l.last_modified.cmp(&r.last_modified) {
                std::cmp::Ordering::Greater => true,
                std::cmp::Ordering::Less => false,
                std::cmp::Ordering::Equal => l.hash > r.hash,
            };
            let (side, winner) = if local_wins { (SyncSide::Local, l) } else { (SyncSide::Remote, r) };
            Some(FileChangeInfo {
                path: path.clone(),
                side,
                last_modified: winner.last_modified,
                file_size: winner.file_size,
            })
        }
    }
}

/// Diffs a datasite's local metadata against the server-reported metadata.
pub fn compute_changes(
    local: &[FileMetadata],
    remote: &[FileMetadata],
    own_email: &str,
    ignore: &IgnoreRules,
) -> DatasiteChanges {
    let local_by_path: BTreeMap<&SyncPath, &FileMetadata> = local.iter().map(|m| (&m.path, m)).collect();
    let remote_by_path: BTreeMap<&SyncPath, &FileMetadata> = remote.iter().map(|m| (&m.path, m)).collect();

    let mut all_paths: Vec<&SyncPath> = local_by_path.keys().chain(remote_by_path.keys()).copied().collect();
    all_paths.sort();
    all_paths.dedup();

    let mut changes = DatasiteChanges::default();
    for path in all_paths {
        if ignore.is_ignored(path) {
            continue;
        }
        let verdict = compare_file_info(
            path,
            local_by_path.get(path).copied(),
            remote_by_path.get(path).copied(),
            own_email,
        );
        if let Some(change) = verdict {
            if change.path.is_permission_file() {
                changes.permissions.push(change);
            } else {
                changes.files.push(change);
            }
        }
    }

    // Small updates drain first within each class
    changes.permissions.sort_by(|a, b| (a.file_size, &a.path).cmp(&(b.file_size, &b.path)));
    changes.files.sort_by(|a, b| (a.file_size, &a.path).cmp(&(b.file_size, &b.path)));
    changes
}
