use std::path::{Path, PathBuf};

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use log::{info, warn};

use crate::errors::SyncError;
use crate::permissions::PermissionFile;
use crate::sync_path::{SyncPath, PERM_FILE};

/// Gitignore-style file at the workspace root controlling what the sync
/// engine will ever look at.
pub const IGNORE_FILE: &str = ".syftignore";

pub const DEFAULT_IGNORE: &str = "\
# Syft
syftperm.yaml.bak

# Hidden files
.*

# OS-specific
.DS_Store
Thumbs.db
Icon

# IDE/Editor-specific
*.swp
*.swo
*~

# General excludes
*.tmp
*.partial

# excluded datasites
# example:
# /user_to_exclude@example.com/
";

/// The on-disk layout under the user-chosen data directory:
///
/// ```text
/// <data_dir>/
///   .syftignore
///   datasites/<email>/...
///   logs/
/// ```
#[derive(Debug, Clone)]
pub struct Workspace {
    data_dir: PathBuf,
}

impl Workspace {
    pub fn new(data_dir: impl Into<PathBuf>) -> Workspace {
        Workspace { data_dir: data_dir.into() }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn datasites_dir(&self) -> PathBuf {
        self.data_dir.join("datasites")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn ignore_path(&self) -> PathBuf {
        self.data_dir.join(IGNORE_FILE)
    }

    /// Absolute path of a relative sync path. `SyncPath` is validated at
    /// construction (no `..`, no absolute segments), so joining cannot
    /// escape the datasites root.
    pub fn resolve(&self, path: &SyncPath) -> PathBuf {
        path.to_disk_path(&self.datasites_dir())
    }

    /// Creates the directory structure, the default ignore file, the
    /// user's own datasite and its default permission file, where missing.
    pub fn ensure_dirs(&self, own_email: &str) -> Result<(), SyncError> {
        let mkdir = |p: PathBuf| {
            std::fs::create_dir_all(&p).map_err(|e| SyncError::io(p.display().to_string(), e))
        };
        mkdir(self.datasites_dir())?;
        mkdir(self.logs_dir())?;
        mkdir(self.datasites_dir().join(own_email))?;

        let ignore = self.ignore_path();
        if !ignore.is_file() {
            info!("Creating default ignore file: {}", ignore.display());
            std::fs::write(&ignore, DEFAULT_IGNORE)
                .map_err(|e| SyncError::io(ignore.display().to_string(), e))?;
        }

        let perm = self.datasites_dir().join(own_email).join(PERM_FILE);
        if !perm.is_file() {
            info!("Creating default permission file: {}", perm.display());
            std::fs::write(&perm, PermissionFile::default_for_owner(own_email).to_yaml())
                .map_err(|e| SyncError::io(perm.display().to_string(), e))?;
        }

        Ok(())
    }

    /// Loads the ignore rules, falling back to the defaults if the file is
    /// missing or unreadable.
    pub fn load_ignore(&self) -> IgnoreRules {
        match std::fs::read_to_string(self.ignore_path()) {
            Ok(content) => IgnoreRules::from_content(&content),
            Err(e) => {
                warn!("Can't read {}: {e}; using default ignore rules", self.ignore_path().display());
                IgnoreRules::from_content(DEFAULT_IGNORE)
            }
        }
    }
}

/// Compiled gitignore-style rules, matched against relative sync paths.
#[derive(Debug, Clone)]
pub struct IgnoreRules {
    gitignore: Gitignore,
}

impl IgnoreRules {
    pub fn from_content(content: &str) -> IgnoreRules {
        let mut builder = GitignoreBuilder::new("");
        for line in content.lines() {
            // A single bad line shouldn't invalidate the whole rule set
            if let Err(e) = builder.add_line(None, line) {
                warn!("Ignoring bad ignore pattern '{line}': {e}");
            }
        }
        let gitignore = builder.build().unwrap_or_else(|e| {
            warn!("Failed to build ignore rules: {e}");
            Gitignore::empty()
        });
        IgnoreRules { gitignore }
    }

    pub fn empty() -> IgnoreRules {
        IgnoreRules { gitignore: Gitignore::empty() }
    }

    pub fn is_ignored(&self, path: &SyncPath) -> bool {
        self.gitignore
            .matched_path_or_any_parents(Path::new(path.as_str()), false)
            .is_ignore()
    }

    /// Directory variant, used while walking so that ignored subtrees are
    /// skipped without descending into them.
    pub fn is_ignored_dir(&self, rel: &Path) -> bool {
        self.gitignore.matched_path_or_any_parents(rel, true).is_ignore()
    }
}
