use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use env_logger::Env;
use log::{error, info, warn};
use tokio::sync::watch;

use syftbox::config::{ClientConfig, ServerConfig};
use syftbox::scheduler::SyncManager;
use syftbox::server::RunningServer;

#[derive(Parser)]
#[command(name = "syftbox", version, about = "Federated personal-data sync: local agent and coordination server")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the long-running sync agent against a coordination server.
    Client {
        /// Path to the client YAML config file.
        #[arg(long)]
        config: PathBuf,
    },
    /// Run the coordination server.
    Server {
        /// Path to the server YAML config file.
        #[arg(long)]
        config: PathBuf,
    },
}

fn main() -> ExitCode {
    // Configure logging
    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or("info"));
    builder.format(|buf, record| {
        writeln!(buf, "{:5} | {}: {}", record.level(), record.target(), record.args())
    });
    builder.init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Client { config } => client_main(&config),
        Commands::Server { config } => server_main(&config),
    }
}

fn client_main(config_path: &PathBuf) -> ExitCode {
    let config = match ClientConfig::load(config_path) {
        Ok(c) => c,
        Err(e) => {
            error!("Bad client config: {e}");
            return ExitCode::from(1);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(r) => r,
        Err(e) => {
            error!("Couldn't start runtime: {e}");
            return ExitCode::from(2);
        }
    };

    runtime.block_on(async {
        let manager = match SyncManager::from_config(&config) {
            Ok(m) => m,
            Err(e) => {
                error!("Couldn't set up the workspace: {e}");
                return ExitCode::from(1);
            }
        };

        // Make sure our datasite exists on the server; a failure here is
        // not fatal (the server may simply be down right now).
        if let Err(e) = manager.api().register(&config.email).await {
            warn!("Registration with {} failed: {e}", config.server_url);
        }

        info!("Syncing {} as {} against {}", config.data_dir.display(), config.email, config.server_url);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let run = manager.run(shutdown_rx);
        tokio::pin!(run);
        tokio::select! {
            _ = &mut run => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted; shutting down");
                let _ = shutdown_tx.send(true);
                run.await;
            }
        }
        ExitCode::SUCCESS
    })
}

fn server_main(config_path: &PathBuf) -> ExitCode {
    let config = match ServerConfig::load(config_path) {
        Ok(c) => c,
        Err(e) => {
            error!("Bad server config: {e}");
            return ExitCode::from(1);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(r) => r,
        Err(e) => {
            error!("Couldn't start runtime: {e}");
            return ExitCode::from(2);
        }
    };

    runtime.block_on(async {
        let server = match RunningServer::start(&config).await {
            Ok(s) => s,
            Err(e) => {
                // Covers the port-in-use case as well as bad paths
                error!("Couldn't start server: {e}");
                return ExitCode::from(1);
            }
        };

        let result = server
            .run_until(async {
                let _ = tokio::signal::ctrl_c().await;
                info!("Interrupted; shutting down");
            })
            .await;
        if let Err(e) = result {
            error!("Server exited with an error: {e}");
            return ExitCode::from(2);
        }
        ExitCode::SUCCESS
    })
}
