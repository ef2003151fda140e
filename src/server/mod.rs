//! The coordination server: SQLite metadata store, permission-rule index,
//! and the stateless HTTP endpoints implementing the sync protocol.

pub mod auth;
pub mod db;
pub mod routes;

use std::net::SocketAddr;

use log::info;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::errors::SyncError;
use auth::AuthService;
use db::MetaStore;
use routes::AppState;

/// A bound, running server. Tests start one on an ephemeral port; the
/// binary starts one on the configured address and waits on it.
pub struct RunningServer {
    pub addr: SocketAddr,
    /// Shared request log ("METHOD /path" per request, in order).
    pub request_log: std::sync::Arc<std::sync::Mutex<Vec<String>>>,
    handle: JoinHandle<std::io::Result<()>>,
    shutdown: watch::Sender<bool>,
}

impl RunningServer {
    /// Creates folders, opens (or creates) the database, migrates legacy
    /// permission files, reconciles the DB against the snapshot folder,
    /// and starts serving.
    pub async fn start(config: &ServerConfig) -> Result<RunningServer, SyncError> {
        let snapshot = config.snapshot_dir();
        for dir in [&snapshot, &config.logs_dir()] {
            std::fs::create_dir_all(dir).map_err(|e| SyncError::io(dir.display().to_string(), e))?;
        }

        let store = MetaStore::connect(&config.db_path())
            .await
            .map_err(|e| SyncError::Config(format!("couldn't open database: {e}")))?;
        store
            .rescan_snapshot(&snapshot)
            .await
            .map_err(|e| SyncError::Config(format!("startup rescan failed: {e}")))?;

        let request_log = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let state = AppState {
            store,
            auth: AuthService::new(&config.jwt_secret, config.auth_enabled, config.email_token_ttl_secs),
            snapshot,
            request_log: request_log.clone(),
        };
        let app = routes::router(state);

        let listener = TcpListener::bind(&config.bind_addr)
            .await
            .map_err(|e| SyncError::Config(format!("couldn't bind {}: {e}", config.bind_addr)))?;
        let addr = listener.local_addr().map_err(|e| SyncError::io(&config.bind_addr, e))?;
        info!("Server listening on {addr}");

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.changed().await;
                })
                .await
        });

        Ok(RunningServer { addr, request_log, handle, shutdown })
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Signals shutdown and waits for in-flight requests to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }

    /// Serves until `signal` completes (or the server dies on its own),
    /// then shuts down gracefully and waits for in-flight requests.
    pub async fn run_until(mut self, signal: impl std::future::Future<Output = ()>) -> std::io::Result<()> {
        tokio::select! {
            result = &mut self.handle => {
                return result.unwrap_or_else(|e| Err(std::io::Error::other(e)));
            }
            _ = signal => {}
        }
        let _ = self.shutdown.send(true);
        self.handle.await.unwrap_or_else(|e| Err(std::io::Error::other(e)))
    }
}
