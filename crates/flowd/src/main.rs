//! flowd - AI protocol pipeline orchestrator daemon.
//!
//! Main entry point for the daemon binary.

use clap::Parser;
use flow_core::config::Config;
use flowd::{Daemon, DaemonOptions};
use tracing::error;
use tracing_subscriber::{fmt, EnvFilter};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Debug, Parser)]
#[command(name = "flowd", about = "AI protocol pipeline orchestrator daemon")]
struct Args {
    /// Port for the HTTP control plane.
    #[arg(long, default_value_t = 8717)]
    port: u16,

    /// SQLite database path; overrides FLOWD_DB_PATH.
    #[arg(long)]
    db_path: Option<std::path::PathBuf>,
}

fn main() {
    let args = Args::parse();

    let config = match Config::from_env() {
        Ok(mut config) => {
            if let Some(db_path) = args.db_path {
                config.db_path = db_path;
                config.db_url = None;
            }
            config
        }
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            std::process::exit(2);
        }
    };

    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    runtime.block_on(async {
        let options = DaemonOptions { port: args.port };
        match Daemon::new(config, options).await {
            Ok(daemon) => {
                let daemon_ref = &daemon;
                tokio::select! {
                    result = daemon.run() => {
                        if let Err(e) = result {
                            error!("daemon error: {e}");
                        }
                    }
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("received SIGINT");
                        daemon_ref.shutdown();
                    }
                }
            }
            Err(e) => {
                error!("failed to initialize daemon: {e}");
                std::process::exit(1);
            }
        }
    });
}
