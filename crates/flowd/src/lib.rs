//! flowd - AI protocol pipeline orchestrator daemon.
//!
//! Library components for the daemon process: store, queues, engines,
//! the worker loop and its handlers, the webhook reducer, and the HTTP
//! control plane.

pub mod engine;
pub mod executor;
pub mod git;
pub mod metrics;
pub mod planner;
pub mod policy;
pub mod qa;
pub mod queue;
pub mod server;
pub mod state;
pub mod storage;
pub mod webhook;
pub mod worker;

#[cfg(test)]
pub(crate) mod testutil;

use std::sync::Arc;

use flow_core::budget::BudgetError;
use flow_core::config::Config;
use flow_core::spec::SpecError;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::engine::{CodexEngine, EngineError, EngineRegistry};
use crate::metrics::Metrics;
use crate::queue::{create_queue, JobQueue, QueueError};
use crate::storage::{Storage, StorageError};
use crate::worker::Worker;

/// Type alias for application-level errors with context and backtraces.
pub type AppResult<T> = eyre::Result<T>;

/// Errors surfaced by job handlers. Recoverable conditions are reduced to
/// state transitions and events inside the handlers; what escapes here is
/// what the worker's retry/backoff path deals with.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Spec(#[from] SpecError),
    #[error(transparent)]
    Budget(#[from] BudgetError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid job payload: missing {0}")]
    Payload(&'static str),
    #[error("git error: {0}")]
    Git(#[from] git::GitError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type HandlerResult<T> = std::result::Result<T, HandlerError>;

/// Shared process-wide state handed to every handler.
///
/// The engine registry and metrics are initialised once at startup,
/// before any worker claims a job, and never mutated after.
pub struct AppContext {
    pub storage: Arc<Storage>,
    pub queue: Arc<dyn JobQueue>,
    pub engines: Arc<EngineRegistry>,
    pub config: Config,
    pub metrics: Arc<Metrics>,
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("engines", &self.engines)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Daemon options beyond the environment-derived [`Config`].
#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub port: u16,
}

impl Default for DaemonOptions {
    fn default() -> Self {
        Self { port: 8717 }
    }
}

/// The composed daemon: store + queue + worker + HTTP server.
pub struct Daemon {
    ctx: Arc<AppContext>,
    options: DaemonOptions,
    shutdown: CancellationToken,
}

impl Daemon {
    pub async fn new(config: Config, options: DaemonOptions) -> AppResult<Self> {
        info!(environment = %config.environment, "starting flowd");
        let storage = match &config.db_url {
            Some(url) => Storage::from_url(url).await?,
            None => Storage::new(&config.db_path).await?,
        };
        storage.migrate_embedded().await?;

        let queue = create_queue(config.redis_url.as_deref());
        let engines = EngineRegistry::new(Arc::new(CodexEngine::new()));

        let ctx = Arc::new(AppContext {
            storage: Arc::new(storage),
            queue,
            engines: Arc::new(engines),
            config,
            metrics: Arc::new(Metrics::new()),
        });

        Ok(Self {
            ctx,
            options,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn context(&self) -> Arc<AppContext> {
        Arc::clone(&self.ctx)
    }

    /// Run the worker loop and the HTTP server until shutdown.
    pub async fn run(&self) -> AppResult<()> {
        let worker = Worker::new(Arc::clone(&self.ctx), self.shutdown.clone());
        let worker_handle = tokio::spawn(async move { worker.run().await });

        let server_result = server::start_server(
            Arc::clone(&self.ctx),
            self.options.port,
            self.shutdown.clone(),
        )
        .await;

        self.shutdown.cancel();
        let _ = worker_handle.await;
        info!("daemon stopped");
        server_result
    }

    /// Signal cooperative shutdown; in-flight handlers finish first.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
