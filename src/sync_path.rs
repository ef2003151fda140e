use std::{
    fmt::{self, Display},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Deserializer, Serialize};

/// File name of a permission file inside a datasite directory.
pub const PERM_FILE: &str = "syftperm.yaml";

/// A path relative to the datasites root, normalized to forward slashes so
/// that it means the same thing on every platform and on the wire. We can't
/// simply use PathBuf because its syntax differs between the client and
/// server platforms, and because we must reject anything that could escape
/// the datasites root.
///
/// The first segment names the datasite that owns the path, which is always
/// a user email.
#[derive(Serialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct SyncPath {
    inner: String,
}

impl SyncPath {
    /// The email of the datasite this path belongs to (its first segment).
    pub fn owner(&self) -> &str {
        match self.inner.split_once('/') {
            Some((first, _)) => first,
            None => &self.inner,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }

    /// Number of path segments, datasite included.
    pub fn depth(&self) -> u32 {
        self.inner.split('/').count() as u32
    }

    pub fn file_name(&self) -> &str {
        match self.inner.rsplit_once('/') {
            Some((_, name)) => name,
            None => &self.inner,
        }
    }

    /// The containing directory, or None for a bare datasite root.
    pub fn parent(&self) -> Option<SyncPath> {
        self.inner
            .rsplit_once('/')
            .map(|(dir, _)| SyncPath { inner: dir.to_string() })
    }

    /// Whether this path is the given directory or lies underneath it.
    pub fn is_under(&self, dir: &str) -> bool {
        self.inner == dir || self.inner.starts_with(&format!("{dir}/"))
    }

    /// The path relative to `dir`, if this path lies underneath it.
    pub fn strip_dir(&self, dir: &str) -> Option<&str> {
        if dir.is_empty() {
            return Some(&self.inner);
        }
        self.inner.strip_prefix(dir).and_then(|r| r.strip_prefix('/'))
    }

    pub fn is_permission_file(&self) -> bool {
        self.file_name() == PERM_FILE
    }

    /// The full on-disk path consisting of the datasites root and this path.
    pub fn to_disk_path(&self, root: &Path) -> PathBuf {
        root.join(&self.inner)
    }
}

impl Display for SyncPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl TryFrom<&str> for SyncPath {
    type Error = String;

    fn try_from(s: &str) -> Result<SyncPath, String> {
        if s.is_empty() {
            return Err("Path must not be empty".to_string());
        }
        if s.starts_with('/') {
            return Err("Path must be relative".to_string());
        }
        if s.contains('\\') {
            return Err("Illegal characters in path".to_string());
        }
        for segment in s.split('/') {
            if segment.is_empty() {
                return Err("Empty path segment".to_string());
            }
            // ".." would allow escaping the datasites root once joined
            if segment == "." || segment == ".." {
                return Err("Path must not contain '.' or '..' segments".to_string());
            }
        }
        Ok(SyncPath { inner: s.to_string() })
    }
}

impl TryFrom<&Path> for SyncPath {
    type Error = String;

    fn try_from(p: &Path) -> Result<SyncPath, String> {
        if p.is_absolute() {
            return Err("Path must be relative".to_string());
        }

        let mut result = String::new();
        for c in p.iter() {
            let cs = match c.to_str() {
                Some(x) => x,
                None => return Err("Can't convert path component".to_string()),
            };
            if cs.contains('/') || cs.contains('\\') {
                // Slashes in any component would mess things up, once we change which slash is significant
                return Err("Illegal characters in path".to_string());
            }
            if !result.is_empty() {
                result += "/";
            }
            result += cs;
        }

        SyncPath::try_from(result.as_str())
    }
}

// Deserialization goes through the validating constructor, so a hostile peer
// can't hand us a path containing "..".
impl<'de> Deserialize<'de> for SyncPath {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<SyncPath, D::Error> {
        let s = String::deserialize(d)?;
        SyncPath::try_from(s.as_str()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rejects_escapes() {
        assert!(SyncPath::try_from("").is_err());
        assert!(SyncPath::try_from("/etc/hello").is_err());
        assert!(SyncPath::try_from("alice@example.com/../secret").is_err());
        assert!(SyncPath::try_from("alice@example.com/./a.txt").is_err());
        assert!(SyncPath::try_from("alice@example.com//a.txt").is_err());
        assert!(SyncPath::try_from("a\\b").is_err());
    }

    #[test]
    fn test_parse_multiple_components() {
        let p = SyncPath::try_from("alice@example.com/one/two").unwrap();
        assert_eq!(p.as_str(), "alice@example.com/one/two");
        assert_eq!(p.owner(), "alice@example.com");
        assert_eq!(p.depth(), 3);
        assert_eq!(p.file_name(), "two");
        assert_eq!(p.parent().unwrap().as_str(), "alice@example.com/one");
    }

    #[test]
    fn test_datasite_root() {
        let p = SyncPath::try_from("alice@example.com").unwrap();
        assert_eq!(p.owner(), "alice@example.com");
        assert_eq!(p.parent(), None);
        assert_eq!(p.depth(), 1);
    }

    #[test]
    fn test_is_under_and_strip() {
        let p = SyncPath::try_from("alice@example.com/shared/a.txt").unwrap();
        assert!(p.is_under("alice@example.com"));
        assert!(p.is_under("alice@example.com/shared"));
        assert!(!p.is_under("alice@example.com/sha"));
        assert_eq!(p.strip_dir("alice@example.com/shared"), Some("a.txt"));
        assert_eq!(p.strip_dir("bob@example.com"), None);
    }

    #[test]
    fn test_permission_file_detection() {
        assert!(SyncPath::try_from("alice@example.com/syftperm.yaml").unwrap().is_permission_file());
        assert!(SyncPath::try_from("alice@example.com/sub/syftperm.yaml").unwrap().is_permission_file());
        assert!(!SyncPath::try_from("alice@example.com/syftperm.yaml.bak").unwrap().is_permission_file());
    }

    #[test]
    fn test_deserialize_validates() {
        let ok: Result<SyncPath, _> = serde_json::from_str("\"alice@example.com/a.txt\"");
        assert!(ok.is_ok());
        let bad: Result<SyncPath, _> = serde_json::from_str("\"../../etc/passwd\"");
        assert!(bad.is_err());
    }
}
