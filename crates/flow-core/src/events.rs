//! Event vocabulary for the audit log.
//!
//! Handlers journal events as `(event_type, message, metadata)` triples
//! through the store. Known event types are enumerated here so emitters
//! and tests agree on the tags; webhook handlers additionally pass through
//! provider-supplied event names verbatim.

use serde::{Deserialize, Serialize};

/// Known event tags emitted by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Planned,
    StepCompleted,
    StepExecutionFailed,
    SpecValidationError,
    LoopPolicyApplied,
    LoopPolicyExhausted,
    PolicyConditionUnevaluated,
    TriggerEnqueued,
    TriggerEnqueueFailed,
    TriggerExecutedInline,
    TriggerInlineFailed,
    TriggerInlineDepthExceeded,
    QaPassed,
    QaFailed,
    QaError,
    QaSkippedPolicy,
    QaEnqueued,
    ManualApproval,
    ProtocolCompleted,
    JobFailed,
    UnknownJob,
    CiTriggered,
    OpenPr,
    OpenPrSkipped,
    OpenPrFailed,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planned => "planned",
            Self::StepCompleted => "step_completed",
            Self::StepExecutionFailed => "step_execution_failed",
            Self::SpecValidationError => "spec_validation_error",
            Self::LoopPolicyApplied => "loop_policy_applied",
            Self::LoopPolicyExhausted => "loop_policy_exhausted",
            Self::PolicyConditionUnevaluated => "policy_condition_unevaluated",
            Self::TriggerEnqueued => "trigger_enqueued",
            Self::TriggerEnqueueFailed => "trigger_enqueue_failed",
            Self::TriggerExecutedInline => "trigger_executed_inline",
            Self::TriggerInlineFailed => "trigger_inline_failed",
            Self::TriggerInlineDepthExceeded => "trigger_inline_depth_exceeded",
            Self::QaPassed => "qa_passed",
            Self::QaFailed => "qa_failed",
            Self::QaError => "qa_error",
            Self::QaSkippedPolicy => "qa_skipped_policy",
            Self::QaEnqueued => "qa_enqueued",
            Self::ManualApproval => "manual_approval",
            Self::ProtocolCompleted => "protocol_completed",
            Self::JobFailed => "job_failed",
            Self::UnknownJob => "unknown_job",
            Self::CiTriggered => "ci_triggered",
            Self::OpenPr => "open_pr",
            Self::OpenPrSkipped => "open_pr_skipped",
            Self::OpenPrFailed => "open_pr_failed",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_serializes_to_tag() {
        assert_eq!(
            serde_json::to_string(&EventKind::SpecValidationError).unwrap(),
            "\"spec_validation_error\""
        );
        assert_eq!(EventKind::LoopPolicyApplied.as_str(), "loop_policy_applied");
    }

    #[test]
    fn display_matches_as_str() {
        assert_eq!(
            EventKind::TriggerInlineDepthExceeded.to_string(),
            "trigger_inline_depth_exceeded"
        );
    }
}
