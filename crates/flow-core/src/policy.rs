//! Policy descriptors attached to step runs.
//!
//! Descriptors are stored as opaque JSON on the step row; the policy
//! runtime decodes them here. Two behaviors exist: `loop` (retry or step
//! back with an iteration bound) and `trigger` (fan out to another step).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Action taken by a loop policy when it applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopAction {
    Retry,
    StepBack,
}

/// A policy descriptor as declared in the protocol spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "behavior", rename_all = "snake_case")]
pub enum PolicyDescriptor {
    Loop {
        action: LoopAction,
        max_iterations: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step_back: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        skip_steps: Option<Vec<i64>>,
        /// Reserved; any non-null condition is treated as always-true.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        condition: Option<Value>,
    },
    Trigger {
        trigger_agent_id: String,
        target_agent_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        condition: Option<Value>,
    },
}

impl PolicyDescriptor {
    pub fn condition(&self) -> Option<&Value> {
        match self {
            Self::Loop { condition, .. } | Self::Trigger { condition, .. } => condition.as_ref(),
        }
    }
}

/// Decode the policy list stored on a step row. Entries that fail to
/// decode are dropped rather than failing the whole evaluation.
pub fn decode_policies(raw: Option<&Value>) -> Vec<PolicyDescriptor> {
    let Some(Value::Array(items)) = raw else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| serde_json::from_value(item.clone()).ok())
        .collect()
}

/// Well-known points in the step lifecycle where policies are evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyReason {
    ExecCompleted,
    ExecFailed,
    ExecStub,
    QaPassed,
    QaFailed,
    QaSkippedPolicy,
    QaStubPass,
}

impl PolicyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExecCompleted => "exec_completed",
            Self::ExecFailed => "exec_failed",
            Self::ExecStub => "exec_stub",
            Self::QaPassed => "qa_passed",
            Self::QaFailed => "qa_failed",
            Self::QaSkippedPolicy => "qa_skipped_policy",
            Self::QaStubPass => "qa_stub_pass",
        }
    }

    /// Loop policies fire only on failure reasons.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::ExecFailed | Self::QaFailed)
    }
}

/// Outcome of a policy evaluation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyDecision {
    pub applied: bool,
    /// Step run id selected by a trigger policy.
    pub target_step_id: Option<i64>,
    /// Inline trigger depth to carry into the target execution.
    pub inline_depth: u32,
}

impl PolicyDecision {
    pub fn not_applied() -> Self {
        Self::default()
    }
}

// --- Runtime state helpers ---

/// Key in `runtime_state` tracking loop applications.
pub const LOOP_ITERATIONS_KEY: &str = "loop_iterations";
/// Key in `runtime_state` carrying the inline trigger depth.
pub const INLINE_TRIGGER_DEPTH_KEY: &str = "inline_trigger_depth";

/// Read a counter out of a step's opaque runtime state.
pub fn runtime_counter(runtime_state: Option<&Value>, key: &str) -> u32 {
    runtime_state
        .and_then(|v| v.get(key))
        .and_then(Value::as_u64)
        .unwrap_or(0) as u32
}

/// Merge a counter into the runtime state map, preserving other keys.
pub fn with_runtime_counter(runtime_state: Option<&Value>, key: &str, value: u32) -> Value {
    let mut map = match runtime_state {
        Some(Value::Object(map)) => map.clone(),
        _ => serde_json::Map::new(),
    };
    map.insert(key.to_string(), Value::from(u64::from(value)));
    Value::Object(map)
}
