use std::path::{Path, PathBuf};

use tempfile::TempDir;

use syftbox::config::{ClientConfig, ServerConfig};
use syftbox::scheduler::SyncManager;
use syftbox::server::RunningServer;
use syftbox::sync_path::SyncPath;

use crate::filesystem_node::{
    file_with_modified, load_filesystem_node_from_disk, save_filesystem_node_to_disk, FilesystemNode,
};

/// An in-process coordination server on an ephemeral port, with a
/// throwaway snapshot folder and database. Auth runs in the disabled mode
/// (bearer token = email), like a development deployment.
pub struct TestServer {
    pub server: RunningServer,
    snapshot: PathBuf,
    _dir: TempDir,
}

impl TestServer {
    pub async fn start() -> TestServer {
        Self::start_seeded(|_| {}).await
    }

    /// `seed` may populate the snapshot folder before the server starts;
    /// the startup rescan indexes whatever it wrote (modification times
    /// included), which is the easiest way to fabricate remote state.
    pub async fn start_seeded(seed: impl FnOnce(&Path)) -> TestServer {
        Self::start_inner(seed, false).await
    }

    /// Real token checking, for exercising the auth endpoints themselves.
    pub async fn start_with_auth() -> TestServer {
        Self::start_inner(|_| {}, true).await
    }

    async fn start_inner(seed: impl FnOnce(&Path), auth_enabled: bool) -> TestServer {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            data_dir: dir.path().to_path_buf(),
            bind_addr: "127.0.0.1:0".to_string(),
            jwt_secret: "test-secret".to_string(),
            auth_enabled,
            email_token_ttl_secs: 60,
        };
        let snapshot = config.snapshot_dir();
        std::fs::create_dir_all(&snapshot).unwrap();
        seed(&snapshot);

        let server = RunningServer::start(&config).await.expect("server should start");
        TestServer { server, snapshot, _dir: dir }
    }

    pub fn url(&self) -> String {
        self.server.url()
    }

    /// Loads the server's authoritative copy of a relative path.
    pub fn load(&self, rel: &str) -> Option<FilesystemNode> {
        load_filesystem_node_from_disk(&self.snapshot.join(rel))
    }

    pub fn save(&self, rel: &str, node: &FilesystemNode) {
        save_filesystem_node_to_disk(node, &self.snapshot.join(rel));
    }

    pub fn requests(&self) -> Vec<String> {
        self.server.request_log.lock().unwrap().clone()
    }

    /// Only the requests that mutate server state.
    pub fn mutating_requests(&self) -> Vec<String> {
        self.requests()
            .into_iter()
            .filter(|r| {
                r.ends_with("/sync/create") || r.ends_with("/sync/apply_diff") || r.ends_with("/sync/delete")
            })
            .collect()
    }
}

/// A client agent with its own workspace tempdir, driven one sync pass at
/// a time (no background scheduler, so tests stay deterministic).
pub struct TestClient {
    pub manager: SyncManager,
    pub email: String,
    datasites: PathBuf,
    _dir: TempDir,
}

impl TestClient {
    pub async fn connect(server: &TestServer, email: &str) -> TestClient {
        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig {
            data_dir: dir.path().to_path_buf(),
            email: email.to_string(),
            server_url: server.url(),
            access_token: None,
            email_token: None,
            timeout_secs: 10,
            sync_interval_ms: 1000,
            max_retries: 2,
        };
        let manager = SyncManager::from_config(&config).expect("workspace should set up");
        manager.api().register(email).await.expect("registration should succeed");
        TestClient {
            manager,
            email: email.to_string(),
            datasites: dir.path().join("datasites"),
            _dir: dir,
        }
    }

    /// One full sync pass: list → compute → enqueue → drain.
    pub async fn sync(&self) {
        self.manager.full_pass().await;
    }

    pub fn save(&self, rel: &str, node: &FilesystemNode) {
        save_filesystem_node_to_disk(node, &self.datasites.join(rel));
    }

    pub fn load(&self, rel: &str) -> Option<FilesystemNode> {
        load_filesystem_node_from_disk(&self.datasites.join(rel))
    }

    pub fn delete(&self, rel: &str) {
        std::fs::remove_file(self.datasites.join(rel)).unwrap();
    }

    pub fn mtime(&self, rel: &str) -> std::time::SystemTime {
        std::fs::metadata(self.datasites.join(rel)).unwrap().modified().unwrap()
    }

    pub async fn remote_metadata(&self, rel: &str) -> Option<syftbox::FileMetadata> {
        self.manager
            .api()
            .get_metadata(&SyncPath::try_from(rel).unwrap())
            .await
            .expect("get_metadata should not error")
    }
}

/// A permission file node for seeding: the owner keeps everything and the
/// whole datasite is world-readable. Stamped with a far-future mtime so it
/// deterministically beats the default permission file a connecting owner
/// agent seeds locally (conflicts resolve by modification time).
pub fn world_readable(owner: &str) -> FilesystemNode {
    file_with_modified(
        &format!(
            "- path: '**'\n  user: {owner}\n  permissions: [admin, read, create, write]\n\
             - path: '**'\n  user: '*'\n  permissions: [read]\n"
        ),
        std::time::SystemTime::now() + std::time::Duration::from_secs(3600),
    )
}

/// Asserts that the file at `rel` has identical contents on the server and
/// on every given client.
pub fn assert_file_everywhere(server: &TestServer, clients: &[&TestClient], rel: &str, contents: &str) {
    match server.load(rel) {
        Some(FilesystemNode::File { contents: c, .. }) => {
            assert_eq!(c, contents.as_bytes(), "server copy of '{rel}' differs")
        }
        other => panic!("server copy of '{rel}' missing or not a file: {other:?}"),
    }
    for client in clients {
        match client.load(rel) {
            Some(FilesystemNode::File { contents: c, .. }) => {
                assert_eq!(c, contents.as_bytes(), "{}'s copy of '{rel}' differs", client.email)
            }
            other => panic!("{}'s copy of '{rel}' missing or not a file: {other:?}", client.email),
        }
    }
}
