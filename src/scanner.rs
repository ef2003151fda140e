use std::path::Path;
use std::time::Instant;

use log::{debug, warn};
use walkdir::WalkDir;

use crate::metadata::FileMetadata;
use crate::sync_path::SyncPath;
use crate::workspace::IgnoreRules;

/// Walks the datasites tree under `root` (or just `subtree` for a targeted
/// rescan) in a single pass, skipping ignored entries and symlinks, and
/// produces metadata for every regular file.
///
/// Unreadable entries are logged and skipped rather than failing the scan:
/// files can legitimately vanish or be locked mid-walk, and the change
/// computer tolerates partial results — the next pass picks them up.
pub fn scan_tree(root: &Path, subtree: Option<&SyncPath>, ignore: &IgnoreRules) -> Vec<FileMetadata> {
    let start = match subtree {
        Some(s) => s.to_disk_path(root),
        None => root.to_path_buf(),
    };
    if !start.exists() {
        return vec![];
    }

    let began = Instant::now();
    let mut result = Vec::new();

    let walker = WalkDir::new(&start).into_iter().filter_entry(|entry| {
        if !entry.file_type().is_dir() {
            return true; // Files are filtered individually below
        }
        match entry.path().strip_prefix(root) {
            Ok(rel) if rel.as_os_str().is_empty() => true, // the root itself
            Ok(rel) => !ignore.is_ignored_dir(rel),
            Err(_) => true,
        }
    });

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("Scan error: {e}");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            // Folders materialize implicitly from the files inside them;
            // symlinks are never synced.
            continue;
        }

        let rel = match entry.path().strip_prefix(root) {
            Ok(r) => r,
            Err(_) => continue,
        };
        let path = match SyncPath::try_from(rel) {
            Ok(p) => p,
            Err(e) => {
                warn!("Skipping '{}': {e}", rel.display());
                continue;
            }
        };
        if ignore.is_ignored(&path) {
            continue;
        }

        match FileMetadata::from_file(entry.path(), path) {
            Ok(m) => result.push(m),
            Err(e) => warn!("Skipping unreadable file: {e}"),
        }
    }

    debug!(
        "Scanned {} files under '{}' in {}ms",
        result.len(),
        start.display(),
        began.elapsed().as_millis()
    );
    result
}
