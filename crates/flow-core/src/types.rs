//! Core entity types for the orchestrator.
//!
//! These mirror the four persisted tables (projects, protocol runs, step
//! runs, events) plus their status vocabularies. Identifiers are opaque
//! numeric row ids assigned by the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Protocol run lifecycle status.
///
/// Transitions are monotonic toward a terminal status except that
/// `running` <-> `blocked` is bidirectional (`blocked -> running` is the
/// recovery edge).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolStatus {
    Pending,
    Planning,
    Planned,
    Running,
    Blocked,
    Failed,
    Completed,
    Cancelled,
}

impl ProtocolStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Planning => "planning",
            Self::Planned => "planned",
            Self::Running => "running",
            Self::Blocked => "blocked",
            Self::Failed => "failed",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "planning" => Some(Self::Planning),
            "planned" => Some(Self::Planned),
            "running" => Some(Self::Running),
            "blocked" => Some(Self::Blocked),
            "failed" => Some(Self::Failed),
            "completed" => Some(Self::Completed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// No further automatic transitions occur from these states.
    /// `blocked` also counts until an operator resumes the run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Blocked
        )
    }
}

/// Step run lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    NeedsQa,
    Completed,
    Failed,
    Blocked,
    Cancelled,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::NeedsQa => "needs_qa",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "needs_qa" => Some(Self::NeedsQa),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "blocked" => Some(Self::Blocked),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Statuses that let the parent protocol close out.
    pub fn is_terminal_success(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

/// Step phase within a protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Setup,
    Work,
    Qa,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::Work => "work",
            Self::Qa => "qa",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "setup" => Some(Self::Setup),
            "work" => Some(Self::Work),
            "qa" => Some(Self::Qa),
            _ => None,
        }
    }

    /// Classify a step file name the way the planner does: `00-` prefixed
    /// or `setup`-named files are setup, `qa`-named files are QA gates,
    /// everything else is work.
    pub fn infer(filename: &str) -> Self {
        let lower = filename.to_lowercase();
        if lower.starts_with("00-") || lower.contains("setup") {
            Self::Setup
        } else if lower.contains("qa") {
            Self::Qa
        } else {
            Self::Work
        }
    }
}

/// A source repository registered with the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    /// Local path or remote URL of the repository.
    pub git_url: String,
    pub base_branch: String,
    /// CI provider hint ("github" or "gitlab").
    pub ci_provider: Option<String>,
    /// Opaque secret map; may carry `api_token` for per-project access.
    pub secrets: Option<BTreeMap<String, Value>>,
    /// Phase -> model id defaults (planning, decompose, exec, qa).
    pub default_models: Option<BTreeMap<String, String>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    /// Per-project API token from `secrets.api_token`, if configured.
    pub fn api_token(&self) -> Option<&str> {
        self.secrets
            .as_ref()
            .and_then(|s| s.get("api_token"))
            .and_then(Value::as_str)
    }

    pub fn default_model(&self, phase: &str) -> Option<&str> {
        self.default_models
            .as_ref()
            .and_then(|m| m.get(phase))
            .map(String::as_str)
    }
}

/// One attempt to drive a named protocol against a project.
///
/// `protocol_name` doubles as the git branch for the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolRun {
    pub id: i64,
    pub project_id: i64,
    pub protocol_name: String,
    pub status: ProtocolStatus,
    pub base_branch: String,
    pub worktree_path: Option<String>,
    pub protocol_root: Option<String>,
    pub description: Option<String>,
    /// Opaque map; holds the protocol spec under [`crate::spec::PROTOCOL_SPEC_KEY`].
    pub template_config: Option<Value>,
    pub template_source: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One execution slot within a protocol run, ordered by `step_index`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRun {
    pub id: i64,
    pub protocol_run_id: i64,
    pub step_index: i64,
    pub step_name: String,
    pub step_type: StepType,
    pub status: StepStatus,
    pub retries: i64,
    pub model: Option<String>,
    pub engine_id: Option<String>,
    /// Opaque list of policy descriptors; decoded by the policy runtime.
    pub policy: Option<Value>,
    /// Opaque map carrying loop counters and inline trigger depth.
    pub runtime_state: Option<Value>,
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An entry in the append-only audit log.
///
/// Events are the source of truth for observers; they are never rewritten
/// or deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub protocol_run_id: i64,
    pub step_run_id: Option<i64>,
    pub event_type: String,
    pub message: String,
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}
