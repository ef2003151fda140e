//! The wire surface shared by the client transport and the server
//! endpoints: request/response bodies, identifying headers, and the
//! encoding of binary blobs (signatures and deltas) as Z85 text inside
//! JSON.

use std::collections::HashMap;

use const_format::concatcp;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::errors::SyncError;
use crate::metadata::FileMetadata;
use crate::sync_path::SyncPath;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const USER_AGENT: &str = concatcp!("syftbox/", env!("CARGO_PKG_VERSION"));

// Identifying headers every client request carries. The server only logs
// them; authorization is bearer-token only.
pub const HEADER_VERSION: &str = "x-syftbox-version";
pub const HEADER_OS_NAME: &str = "x-os-name";
pub const HEADER_OS_ARCH: &str = "x-os-arch";
pub const HEADER_USER: &str = "x-syftbox-user";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathRequest {
    pub path: SyncPath,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffRequest {
    pub path: SyncPath,
    /// Z85-encoded signature of the *requester's* current copy.
    pub signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffResponse {
    pub path: SyncPath,
    /// Z85-encoded delta that turns the requester's copy into the server's.
    pub diff: String,
    /// Hash the requester's copy must have after applying the delta.
    pub expected_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyDiffRequest {
    pub path: SyncPath,
    /// Z85-encoded delta against the server's current copy.
    pub diff: String,
    /// Hash the server's copy must have after applying the delta.
    pub expected_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyDiffResponse {
    pub path: SyncPath,
    pub applied_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkRequest {
    pub paths: Vec<SyncPath>,
}

/// Response of `/sync/datasite_states`: every datasite visible to the
/// caller, with the metadata rows the caller may read.
pub type DatasiteStates = HashMap<String, Vec<FileMetadata>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailTokenRequest {
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailTokenResponse {
    /// In a real deployment this is delivered by email; the dev server
    /// returns it directly.
    pub email_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateTokenRequest {
    pub email_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessTokenResponse {
    pub access_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhoamiResponse {
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfoResponse {
    pub version: String,
}

/// Encodes a signature or delta for JSON transport: bincode bytes wrapped
/// in Z85. Z85 works on 4-byte groups, so the payload is framed with a
/// little-endian length prefix and zero-padded to alignment.
pub fn encode_blob<T: Serialize>(value: &T) -> Result<String, SyncError> {
    let payload = bincode::serialize(value).map_err(|e| SyncError::Delta(format!("encode: {e}")))?;
    let mut framed = Vec::with_capacity(4 + payload.len() + 3);
    framed.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    framed.extend_from_slice(&payload);
    while framed.len() % 4 != 0 {
        framed.push(0);
    }
    Ok(z85::encode(&framed))
}

pub fn decode_blob<T: DeserializeOwned>(text: &str) -> Result<T, SyncError> {
    let framed = z85::decode(text).map_err(|e| SyncError::Delta(format!("z85: {e}")))?;
    if framed.len() < 4 {
        return Err(SyncError::Delta("blob too short".to_string()));
    }
    let len = u32::from_le_bytes([framed[0], framed[1], framed[2], framed[3]]) as usize;
    let payload = framed
        .get(4..4 + len)
        .ok_or_else(|| SyncError::Delta("blob length prefix out of range".to_string()))?;
    bincode::deserialize(payload).map_err(|e| SyncError::Delta(format!("decode: {e}")))
}
