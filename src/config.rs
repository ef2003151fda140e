use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::SyncError;

/// Configuration of the long-running client agent, loaded from a YAML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    /// Root of the workspace (datasites tree, logs, ignore file).
    pub data_dir: PathBuf,
    /// The user this agent acts as; also the name of their datasite.
    pub email: String,
    /// Base URL of the coordination server, e.g. `http://localhost:8080`.
    pub server_url: String,
    /// Bearer token for the server. With auth disabled on the server this
    /// is simply the email.
    #[serde(default)]
    pub access_token: Option<String>,
    /// Email token kept for re-authentication when the access token
    /// expires; without it, an auth failure pauses the consumer.
    #[serde(default)]
    pub email_token: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Base scheduler cadence; each tick is jittered by 0.5–1.5x.
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,
    /// Attempts for transient transport failures before an item is given up.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_sync_interval_ms() -> u64 {
    1000
}

fn default_max_retries() -> u32 {
    5
}

impl ClientConfig {
    pub fn load(path: &Path) -> Result<ClientConfig, SyncError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| SyncError::io(path.display().to_string(), e))?;
        let config: ClientConfig = serde_yaml::from_str(&content)
            .map_err(|e| SyncError::Config(format!("{}: {e}", path.display())))?;
        if !crate::permissions::is_valid_email(&config.email) {
            return Err(SyncError::Config(format!("'{}' is not a valid email", config.email)));
        }
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), SyncError> {
        let content = serde_yaml::to_string(self)
            .map_err(|e| SyncError::Config(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| SyncError::io(path.display().to_string(), e))
    }

    /// The effective bearer token (the email itself when none configured,
    /// matching the server's auth-disabled mode).
    pub fn token(&self) -> String {
        self.access_token.clone().unwrap_or_else(|| self.email.clone())
    }
}

/// Configuration of the coordination server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Root for the snapshot folder, the metadata database and the logs.
    pub data_dir: PathBuf,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// HS256 key for email/access tokens.
    #[serde(default = "default_jwt_secret")]
    pub jwt_secret: String,
    /// When disabled, the bearer token is taken to be the caller's email.
    /// Only suitable for development and tests.
    #[serde(default = "default_true")]
    pub auth_enabled: bool,
    #[serde(default = "default_email_token_ttl")]
    pub email_token_ttl_secs: u64,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_jwt_secret() -> String {
    // Overridden in any real deployment; only good for local development
    "syftbox-dev-secret".to_string()
}

fn default_true() -> bool {
    true
}

fn default_email_token_ttl() -> u64 {
    30 * 60
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<ServerConfig, SyncError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| SyncError::io(path.display().to_string(), e))?;
        serde_yaml::from_str(&content).map_err(|e| SyncError::Config(format!("{}: {e}", path.display())))
    }

    /// The authoritative replica of file bytes.
    pub fn snapshot_dir(&self) -> PathBuf {
        self.data_dir.join("snapshot")
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("metadata.sqlite")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_round_trip_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("config.yaml");
        std::fs::write(
            &p,
            "data_dir: /tmp/syftbox\nemail: alice@example.com\nserver_url: http://localhost:8080\n",
        )
        .unwrap();
        let c = ClientConfig::load(&p).unwrap();
        assert_eq!(c.timeout_secs, 30);
        assert_eq!(c.sync_interval_ms, 1000);
        assert_eq!(c.token(), "alice@example.com");

        c.save(&p).unwrap();
        let again = ClientConfig::load(&p).unwrap();
        assert_eq!(again.email, c.email);
    }

    #[test]
    fn test_client_config_rejects_unknown_keys_and_bad_email() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("config.yaml");
        std::fs::write(&p, "data_dir: /tmp\nemail: a@b\nserver_url: x\nwhatever: 1\n").unwrap();
        assert!(ClientConfig::load(&p).is_err());

        std::fs::write(&p, "data_dir: /tmp\nemail: nope\nserver_url: x\n").unwrap();
        assert!(ClientConfig::load(&p).is_err());
    }

    #[test]
    fn test_server_config_paths() {
        let c = ServerConfig {
            data_dir: PathBuf::from("/srv/syftbox"),
            bind_addr: default_bind_addr(),
            jwt_secret: default_jwt_secret(),
            auth_enabled: false,
            email_token_ttl_secs: 60,
        };
        assert_eq!(c.snapshot_dir(), PathBuf::from("/srv/syftbox/snapshot"));
        assert_eq!(c.db_path(), PathBuf::from("/srv/syftbox/metadata.sqlite"));
    }
}
