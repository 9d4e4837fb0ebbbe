//! Engine dispatch layer.
//!
//! An engine is a pluggable execution backend with three capabilities:
//! `plan`, `execute`, and `qa`. Engines are stateless from the
//! orchestrator's viewpoint and are registered once at startup under a
//! string id; exactly one engine is the default.

use futures_util::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine not registered: {0}")]
    NotRegistered(String),
    #[error("{0} CLI not found in PATH")]
    CliNotFound(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("engine exited with code {code}: {stderr}")]
    NonZeroExit { code: i32, stderr: String },
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Sandbox mode passed to the engine CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Sandbox {
    #[default]
    ReadOnly,
    WorkspaceWrite,
}

impl Sandbox {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadOnly => "read-only",
            Self::WorkspaceWrite => "workspace-write",
        }
    }
}

/// Request descriptor handed to every engine capability.
#[derive(Debug, Clone)]
pub struct EngineRequest {
    pub project_id: i64,
    pub protocol_run_id: i64,
    pub step_run_id: i64,
    pub model: String,
    pub working_dir: PathBuf,
    pub prompt_files: Vec<PathBuf>,
    pub prompt_text: String,
    pub sandbox: Sandbox,
    pub output_schema: Option<PathBuf>,
}

/// Uniform result of an engine invocation.
#[derive(Debug, Clone)]
pub struct EngineResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub metadata: Value,
}

/// Static description of a registered engine.
#[derive(Debug, Clone)]
pub struct EngineMetadata {
    pub id: String,
    pub default_model: Option<String>,
}

/// The engine capability triple. Methods return boxed futures so the
/// registry can hold trait objects.
impl std::fmt::Debug for dyn Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("id", &self.metadata().id)
            .finish()
    }
}

pub trait Engine: Send + Sync {
    fn metadata(&self) -> &EngineMetadata;
    fn plan<'a>(&'a self, request: &'a EngineRequest) -> BoxFuture<'a, Result<EngineResult>>;
    fn execute<'a>(&'a self, request: &'a EngineRequest) -> BoxFuture<'a, Result<EngineResult>>;
    fn qa<'a>(&'a self, request: &'a EngineRequest) -> BoxFuture<'a, Result<EngineResult>>;
    /// Whether the backing CLI is usable on this host. Handlers use this
    /// to pick the stub short-circuit path.
    fn available(&self) -> bool {
        true
    }
}

/// Named set of engines with one default.
pub struct EngineRegistry {
    engines: HashMap<String, Arc<dyn Engine>>,
    default_id: String,
}

impl EngineRegistry {
    pub fn new(default_engine: Arc<dyn Engine>) -> Self {
        let default_id = default_engine.metadata().id.clone();
        let mut engines = HashMap::new();
        engines.insert(default_id.clone(), default_engine);
        Self {
            engines,
            default_id,
        }
    }

    pub fn register(&mut self, engine: Arc<dyn Engine>) {
        self.engines.insert(engine.metadata().id.clone(), engine);
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn Engine>> {
        self.engines
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::NotRegistered(id.to_string()))
    }

    pub fn get_default(&self) -> Arc<dyn Engine> {
        self.engines[&self.default_id].clone()
    }

    pub fn default_id(&self) -> &str {
        &self.default_id
    }
}

impl std::fmt::Debug for EngineRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRegistry")
            .field("default_id", &self.default_id)
            .field("engines", &self.engines.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Check whether a binary resolves on PATH.
pub fn cli_available(binary: &str) -> bool {
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| dir.join(binary).is_file())
}

/// The bundled engine: shells out to the `codex` CLI with the prompt on
/// stdin and the artefact on stdout.
pub struct CodexEngine {
    metadata: EngineMetadata,
    binary: String,
}

impl CodexEngine {
    pub const ID: &'static str = "codex";
    /// Last-resort model when neither spec, step, project, nor
    /// environment names one.
    pub const FALLBACK_MODEL: &'static str = "codex-5.1-max-xhigh";

    pub fn new() -> Self {
        Self {
            metadata: EngineMetadata {
                id: Self::ID.to_string(),
                default_model: Some(Self::FALLBACK_MODEL.to_string()),
            },
            binary: "codex".to_string(),
        }
    }

    async fn invoke(&self, request: &EngineRequest) -> Result<EngineResult> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("exec")
            .arg("-m")
            .arg(&request.model)
            .arg("--sandbox")
            .arg(request.sandbox.as_str())
            .arg("--cd")
            .arg(&request.working_dir)
            .arg("--skip-git-repo-check");
        if let Some(schema) = &request.output_schema {
            cmd.arg("--output-schema").arg(schema);
        }
        cmd.arg("-")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!(
            step_run_id = request.step_run_id,
            model = %request.model,
            sandbox = request.sandbox.as_str(),
            working_dir = %request.working_dir.display(),
            "spawning codex process"
        );

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                EngineError::CliNotFound(self.binary.clone())
            } else {
                EngineError::Io(e)
            }
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(request.prompt_text.as_bytes()).await?;
        }

        let output = child.wait_with_output().await?;
        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if exit_code != 0 {
            warn!(
                step_run_id = request.step_run_id,
                exit_code, "codex invocation failed"
            );
            return Err(EngineError::NonZeroExit {
                code: exit_code,
                stderr,
            });
        }

        Ok(EngineResult {
            success: true,
            stdout,
            stderr,
            metadata: serde_json::json!({ "exit_code": exit_code }),
        })
    }
}

impl Default for CodexEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for CodexEngine {
    fn metadata(&self) -> &EngineMetadata {
        &self.metadata
    }

    fn plan<'a>(&'a self, request: &'a EngineRequest) -> BoxFuture<'a, Result<EngineResult>> {
        Box::pin(self.invoke(request))
    }

    fn execute<'a>(&'a self, request: &'a EngineRequest) -> BoxFuture<'a, Result<EngineResult>> {
        Box::pin(self.invoke(request))
    }

    fn qa<'a>(&'a self, request: &'a EngineRequest) -> BoxFuture<'a, Result<EngineResult>> {
        Box::pin(self.invoke(request))
    }

    fn available(&self) -> bool {
        cli_available(&self.binary)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::path::Path;
    use std::sync::Mutex;

    /// Scripted engine for handler tests: records requests and replays
    /// queued results (or a default pass).
    pub(crate) struct MockEngine {
        metadata: EngineMetadata,
        pub requests: Mutex<Vec<EngineRequest>>,
        pub responses: Mutex<Vec<Result<EngineResult>>>,
        pub available: bool,
    }

    impl MockEngine {
        pub fn new(id: &str) -> Self {
            Self {
                metadata: EngineMetadata {
                    id: id.to_string(),
                    default_model: Some("mock-model".to_string()),
                },
                requests: Mutex::new(Vec::new()),
                responses: Mutex::new(Vec::new()),
                available: true,
            }
        }

        pub fn unavailable(id: &str) -> Self {
            let mut engine = Self::new(id);
            engine.available = false;
            engine
        }

        pub fn push_response(&self, response: Result<EngineResult>) {
            self.responses.lock().unwrap().push(response);
        }

        pub fn push_stdout(&self, stdout: &str) {
            self.push_response(Ok(EngineResult {
                success: true,
                stdout: stdout.to_string(),
                stderr: String::new(),
                metadata: Value::Null,
            }));
        }

        fn next(&self, request: &EngineRequest) -> Result<EngineResult> {
            self.requests.lock().unwrap().push(request.clone());
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Ok(EngineResult {
                    success: true,
                    stdout: "mock output".to_string(),
                    stderr: String::new(),
                    metadata: Value::Null,
                })
            } else {
                responses.remove(0)
            }
        }
    }

    impl Engine for MockEngine {
        fn metadata(&self) -> &EngineMetadata {
            &self.metadata
        }

        fn plan<'a>(&'a self, request: &'a EngineRequest) -> BoxFuture<'a, Result<EngineResult>> {
            let result = self.next(request);
            Box::pin(async move { result })
        }

        fn execute<'a>(
            &'a self,
            request: &'a EngineRequest,
        ) -> BoxFuture<'a, Result<EngineResult>> {
            let result = self.next(request);
            Box::pin(async move { result })
        }

        fn qa<'a>(&'a self, request: &'a EngineRequest) -> BoxFuture<'a, Result<EngineResult>> {
            let result = self.next(request);
            Box::pin(async move { result })
        }

        fn available(&self) -> bool {
            self.available
        }
    }

    pub(crate) fn request_for(working_dir: &Path) -> EngineRequest {
        EngineRequest {
            project_id: 1,
            protocol_run_id: 1,
            step_run_id: 1,
            model: "mock-model".to_string(),
            working_dir: working_dir.to_path_buf(),
            prompt_files: Vec::new(),
            prompt_text: "prompt".to_string(),
            sandbox: Sandbox::ReadOnly,
            output_schema: None,
        }
    }
}
