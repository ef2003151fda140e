use std::{
    fs::File,
    io::Read,
    path::Path,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::delta::{Signature, SignatureBuilder, BLOCK_SIZE};
use crate::errors::SyncError;
use crate::protocol;
use crate::sync_path::SyncPath;

/// How much of a file we read per syscall while hashing.
const READ_CHUNK: usize = 64 * 1024;

/// Everything the sync protocol knows about one file: identity, content
/// digest, rsync signature (Z85 text, as it travels and is stored), size
/// and modification time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub path: SyncPath,
    /// Lowercase hex SHA-256 of the content.
    pub hash: String,
    /// Z85-encoded rsync block signature of the content.
    pub signature: String,
    pub file_size: u64,
    pub last_modified: DateTime<Utc>,
}

impl FileMetadata {
    /// Hashes the file at `disk_path` in fixed-size chunks, computing the
    /// content digest and the rsync signature in the same pass.
    pub fn from_file(disk_path: &Path, path: SyncPath) -> Result<FileMetadata, SyncError> {
        let mut file = File::open(disk_path).map_err(|e| SyncError::io(disk_path.display().to_string(), e))?;
        let meta = file.metadata().map_err(|e| SyncError::io(disk_path.display().to_string(), e))?;

        let mut hasher = Sha256::new();
        let mut sig = SignatureBuilder::new(BLOCK_SIZE);
        let mut buf = vec![0u8; READ_CHUNK];
        let mut size: u64 = 0;
        loop {
            let n = file.read(&mut buf).map_err(|e| SyncError::io(disk_path.display().to_string(), e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            sig.update(&buf[..n]);
            size += n as u64;
        }

        let modified = meta
            .modified()
            .map_err(|e| SyncError::io(disk_path.display().to_string(), e))?;

        Ok(FileMetadata {
            path,
            hash: hex_digest(hasher),
            signature: protocol::encode_blob(&sig.finish())?,
            file_size: size,
            last_modified: DateTime::<Utc>::from(modified),
        })
    }

    /// Metadata for content already held in memory (server-side staging).
    pub fn from_bytes(path: SyncPath, data: &[u8], last_modified: DateTime<Utc>) -> Result<FileMetadata, SyncError> {
        Ok(FileMetadata {
            path,
            hash: hash_bytes(data),
            signature: protocol::encode_blob(&Signature::of(data))?,
            file_size: data.len() as u64,
            last_modified,
        })
    }

    pub fn decode_signature(&self) -> Result<Signature, SyncError> {
        protocol::decode_blob(&self.signature)
    }
}

pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex_digest(hasher)
}

fn hex_digest(hasher: Sha256) -> String {
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_bytes_known_value() {
        // sha256 of "hello"
        assert_eq!(
            hash_bytes(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_from_file_matches_from_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("a.txt");
        std::fs::write(&p, b"some file contents that span a few words").unwrap();

        let path = SyncPath::try_from("alice@example.com/a.txt").unwrap();
        let from_file = FileMetadata::from_file(&p, path.clone()).unwrap();
        let from_bytes =
            FileMetadata::from_bytes(path, b"some file contents that span a few words", from_file.last_modified)
                .unwrap();

        assert_eq!(from_file.hash, from_bytes.hash);
        assert_eq!(from_file.signature, from_bytes.signature);
        assert_eq!(from_file.file_size, from_bytes.file_size);
    }

    #[test]
    fn test_signature_round_trips_through_encoding() {
        let path = SyncPath::try_from("alice@example.com/a.txt").unwrap();
        let m = FileMetadata::from_bytes(path, b"0123456789", Utc::now()).unwrap();
        let sig = m.decode_signature().unwrap();
        assert_eq!(sig, Signature::of(b"0123456789"));
    }
}
