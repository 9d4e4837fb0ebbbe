//! Policy runtime: evaluates loop and trigger descriptors on step runs.
//!
//! Invoked by the executor and QA gate at well-known reasons. The runtime
//! writes `status`, `retries`, and `runtime_state` on step rows and
//! journals every decision; it never writes the `policy` column itself.
//! The worker is single-threaded per step, so read-modify-write of
//! `runtime_state` needs no locking.

use flow_core::events::EventKind;
use flow_core::policy::{
    decode_policies, runtime_counter, with_runtime_counter, LoopAction, PolicyDecision,
    PolicyDescriptor, PolicyReason, INLINE_TRIGGER_DEPTH_KEY, LOOP_ITERATIONS_KEY,
};
use flow_core::spec::{ProtocolSpec, PROTOCOL_SPEC_KEY};
use flow_core::types::{StepRun, StepStatus};
use serde_json::json;
use std::path::Path;
use tracing::info;

use crate::storage::StepUpdate;
use crate::{AppContext, HandlerResult};

/// Evaluate loop policies for a failed step.
///
/// Returns an applied decision when a loop policy reset the step (and
/// possibly earlier steps) back to `pending`. Exhausted policies journal
/// `loop_policy_exhausted` and do not apply.
pub async fn apply_loop_policies(
    ctx: &AppContext,
    step: &StepRun,
    reason: PolicyReason,
) -> HandlerResult<PolicyDecision> {
    if step.status != StepStatus::Failed {
        return Ok(PolicyDecision::not_applied());
    }

    for descriptor in decode_policies(step.policy.as_ref()) {
        let PolicyDescriptor::Loop {
            action,
            max_iterations,
            step_back,
            skip_steps,
            ..
        } = &descriptor
        else {
            continue;
        };

        journal_condition(ctx, step, descriptor.condition(), reason).await?;

        let iterations = runtime_counter(step.runtime_state.as_ref(), LOOP_ITERATIONS_KEY);
        if iterations >= *max_iterations {
            ctx.storage
                .append_event(
                    step.protocol_run_id,
                    Some(step.id),
                    EventKind::LoopPolicyExhausted.as_str(),
                    &format!(
                        "Loop policy exhausted after {iterations}/{max_iterations} iterations."
                    ),
                    Some(json!({
                        "reason": reason.as_str(),
                        "iterations": iterations,
                        "max_iterations": max_iterations,
                    })),
                )
                .await?;
            continue;
        }

        let next_state = with_runtime_counter(
            step.runtime_state.as_ref(),
            LOOP_ITERATIONS_KEY,
            iterations + 1,
        );

        match action {
            LoopAction::Retry => {
                ctx.storage
                    .update_step_status(
                        step.id,
                        StepStatus::Pending,
                        StepUpdate {
                            retries: Some(step.retries + 1),
                            runtime_state: Some(next_state),
                            ..StepUpdate::default()
                        },
                    )
                    .await?;
                ctx.storage
                    .append_event(
                        step.protocol_run_id,
                        Some(step.id),
                        EventKind::LoopPolicyApplied.as_str(),
                        "Loop policy applied: step reset for retry.",
                        Some(json!({
                            "action": "retry",
                            "reason": reason.as_str(),
                            "iteration": iterations + 1,
                            "max_iterations": max_iterations,
                        })),
                    )
                    .await?;
                info!(
                    step_run_id = step.id,
                    iteration = iterations + 1,
                    "loop policy retry applied"
                );
            }
            LoopAction::StepBack => {
                let back = i64::from(step_back.unwrap_or(1));
                let target_index = (step.step_index - back).max(0);
                let skip = skip_steps.clone().unwrap_or_default();

                let steps = ctx.storage.list_step_runs(step.protocol_run_id).await?;
                let mut reset_indices = Vec::new();
                for candidate in steps {
                    let in_range = candidate.step_index >= target_index
                        && candidate.step_index <= step.step_index;
                    if !in_range || skip.contains(&candidate.step_index) {
                        continue;
                    }
                    let runtime_state = if candidate.id == step.id {
                        Some(next_state.clone())
                    } else {
                        None
                    };
                    ctx.storage
                        .update_step_status(
                            candidate.id,
                            StepStatus::Pending,
                            StepUpdate {
                                runtime_state,
                                ..StepUpdate::default()
                            },
                        )
                        .await?;
                    reset_indices.push(candidate.step_index);
                }

                ctx.storage
                    .append_event(
                        step.protocol_run_id,
                        Some(step.id),
                        EventKind::LoopPolicyApplied.as_str(),
                        "Loop policy applied: stepped back.",
                        Some(json!({
                            "action": "step_back",
                            "reason": reason.as_str(),
                            "target_index": target_index,
                            "reset_indices": reset_indices,
                            "iteration": iterations + 1,
                            "max_iterations": max_iterations,
                        })),
                    )
                    .await?;
                info!(
                    step_run_id = step.id,
                    target_index, "loop policy step_back applied"
                );
            }
        }

        return Ok(PolicyDecision {
            applied: true,
            target_step_id: None,
            inline_depth: 0,
        });
    }

    Ok(PolicyDecision::not_applied())
}

/// Evaluate trigger policies for a step at the given reason.
///
/// When the step's spec id matches a descriptor's `trigger_agent_id`, the
/// step whose id equals `target_agent_id` is returned as the target. The
/// caller decides whether to enqueue or inline-execute it; the decision
/// carries the current inline depth for the cap check.
pub async fn apply_trigger_policies(
    ctx: &AppContext,
    step: &StepRun,
    reason: PolicyReason,
) -> HandlerResult<PolicyDecision> {
    let policies = decode_policies(step.policy.as_ref());
    if policies.is_empty() {
        return Ok(PolicyDecision::not_applied());
    }

    let run = ctx.storage.get_protocol_run(step.protocol_run_id).await?;
    let spec = run
        .template_config
        .as_ref()
        .and_then(|t| t.get(PROTOCOL_SPEC_KEY))
        .and_then(|v| ProtocolSpec::from_value(v).ok());
    let step_agent_id = agent_id_for(spec.as_ref(), &step.step_name);

    for descriptor in policies {
        let PolicyDescriptor::Trigger {
            trigger_agent_id,
            target_agent_id,
            ..
        } = &descriptor
        else {
            continue;
        };
        if *trigger_agent_id != step_agent_id {
            continue;
        }

        journal_condition(ctx, step, descriptor.condition(), reason).await?;

        let steps = ctx.storage.list_step_runs(step.protocol_run_id).await?;
        let target = steps
            .iter()
            .find(|s| agent_id_for(spec.as_ref(), &s.step_name) == *target_agent_id);
        let Some(target) = target else {
            continue;
        };

        let depth = runtime_counter(step.runtime_state.as_ref(), INLINE_TRIGGER_DEPTH_KEY);
        info!(
            step_run_id = step.id,
            target_step_id = target.id,
            inline_depth = depth,
            "trigger policy selected target"
        );
        return Ok(PolicyDecision {
            applied: true,
            target_step_id: Some(target.id),
            inline_depth: depth,
        });
    }

    Ok(PolicyDecision::not_applied())
}

/// Spec id for a step name: the spec entry's `id` when present, else the
/// file stem.
fn agent_id_for(spec: Option<&ProtocolSpec>, step_name: &str) -> String {
    if let Some(entry) = spec.and_then(|s| s.step_by_name(step_name)) {
        return entry.id.clone();
    }
    Path::new(step_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(step_name)
        .to_string()
}

/// Conditions are reserved: any non-null condition counts as satisfied
/// and is journaled so observers can see it went unevaluated.
async fn journal_condition(
    ctx: &AppContext,
    step: &StepRun,
    condition: Option<&serde_json::Value>,
    reason: PolicyReason,
) -> HandlerResult<()> {
    if let Some(condition) = condition {
        ctx.storage
            .append_event(
                step.protocol_run_id,
                Some(step.id),
                EventKind::PolicyConditionUnevaluated.as_str(),
                "Policy condition present but not evaluated; treated as true.",
                Some(json!({
                    "reason": reason.as_str(),
                    "condition": condition,
                })),
            )
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::{create_test_storage, TestStorage};
    use crate::storage::{NewProject, NewProtocolRun, NewStepRun};
    use crate::testutil::test_context;
    use flow_core::types::{ProtocolStatus, StepType};
    use serde_json::json;

    async fn context_with_run() -> (std::sync::Arc<AppContext>, TestStorage, i64) {
        let ts = create_test_storage().await;
        let project = ts
            .storage
            .create_project(NewProject {
                name: "demo".to_string(),
                git_url: "/tmp/demo".to_string(),
                base_branch: "main".to_string(),
                ..NewProject::default()
            })
            .await
            .unwrap();
        let run = ts
            .storage
            .create_protocol_run(NewProtocolRun {
                project_id: project.id,
                protocol_name: "0001-demo".to_string(),
                status: ProtocolStatus::Running,
                base_branch: "main".to_string(),
                worktree_path: None,
                protocol_root: None,
                description: None,
                template_config: Some(json!({
                    PROTOCOL_SPEC_KEY: {
                        "steps": [
                            {"id": "build", "name": "01-build.md"},
                            {"id": "test", "name": "02-test.md"}
                        ]
                    }
                })),
                template_source: None,
            })
            .await
            .unwrap();
        let ctx = test_context(&ts).await;
        (ctx, ts, run.id)
    }

    async fn failed_step_with_policy(
        ts: &TestStorage,
        run_id: i64,
        step_index: i64,
        name: &str,
        policy: serde_json::Value,
    ) -> StepRun {
        let step = ts
            .storage
            .create_step_run(NewStepRun {
                protocol_run_id: run_id,
                step_index,
                step_name: name.to_string(),
                step_type: StepType::Work,
                status: StepStatus::Failed,
                model: None,
                engine_id: None,
                policy: Some(policy),
                summary: None,
            })
            .await
            .unwrap();
        ts.storage.get_step_run(step.id).await.unwrap()
    }

    #[tokio::test]
    async fn retry_policy_resets_step_and_counts_iterations() {
        let (ctx, ts, run_id) = context_with_run().await;
        let policy = json!([{"behavior": "loop", "action": "retry", "max_iterations": 2}]);
        let step = failed_step_with_policy(&ts, run_id, 0, "01-build.md", policy).await;

        let decision = apply_loop_policies(&ctx, &step, PolicyReason::ExecFailed)
            .await
            .unwrap();
        assert!(decision.applied);

        let updated = ts.storage.get_step_run(step.id).await.unwrap();
        assert_eq!(updated.status, StepStatus::Pending);
        assert_eq!(updated.retries, 1);
        assert_eq!(
            runtime_counter(updated.runtime_state.as_ref(), LOOP_ITERATIONS_KEY),
            1
        );

        let events = ts.storage.list_events(run_id).await.unwrap();
        assert!(events.iter().any(|e| e.event_type == "loop_policy_applied"));
    }

    #[tokio::test]
    async fn loop_policy_exhausts_at_max_iterations() {
        let (ctx, ts, run_id) = context_with_run().await;
        let policy = json!([{"behavior": "loop", "action": "retry", "max_iterations": 2}]);
        let mut step = failed_step_with_policy(&ts, run_id, 0, "01-build.md", policy).await;

        for _ in 0..2 {
            let decision = apply_loop_policies(&ctx, &step, PolicyReason::ExecFailed)
                .await
                .unwrap();
            assert!(decision.applied);
            // Fail again for the next evaluation.
            ts.storage
                .update_step_status(step.id, StepStatus::Failed, StepUpdate::default())
                .await
                .unwrap();
            step = ts.storage.get_step_run(step.id).await.unwrap();
        }

        let decision = apply_loop_policies(&ctx, &step, PolicyReason::ExecFailed)
            .await
            .unwrap();
        assert!(!decision.applied);

        let events = ts.storage.list_events(run_id).await.unwrap();
        assert!(events
            .iter()
            .any(|e| e.event_type == "loop_policy_exhausted"));
    }

    #[tokio::test]
    async fn zero_max_iterations_never_applies() {
        let (ctx, ts, run_id) = context_with_run().await;
        let policy = json!([{"behavior": "loop", "action": "retry", "max_iterations": 0}]);
        let step = failed_step_with_policy(&ts, run_id, 0, "01-build.md", policy).await;

        let decision = apply_loop_policies(&ctx, &step, PolicyReason::ExecFailed)
            .await
            .unwrap();
        assert!(!decision.applied);
        let updated = ts.storage.get_step_run(step.id).await.unwrap();
        assert_eq!(updated.status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn loop_policy_ignores_non_failed_steps() {
        let (ctx, ts, run_id) = context_with_run().await;
        let policy = json!([{"behavior": "loop", "action": "retry", "max_iterations": 2}]);
        let step = failed_step_with_policy(&ts, run_id, 0, "01-build.md", policy).await;
        ts.storage
            .update_step_status(step.id, StepStatus::Completed, StepUpdate::default())
            .await
            .unwrap();
        let step = ts.storage.get_step_run(step.id).await.unwrap();

        let decision = apply_loop_policies(&ctx, &step, PolicyReason::ExecFailed)
            .await
            .unwrap();
        assert!(!decision.applied);
    }

    #[tokio::test]
    async fn step_back_resets_range_skipping_listed_indices() {
        let (ctx, ts, run_id) = context_with_run().await;
        for (idx, name) in [(0, "00-setup.md"), (1, "01-build.md")] {
            ts.storage
                .create_step_run(NewStepRun {
                    protocol_run_id: run_id,
                    step_index: idx,
                    step_name: name.to_string(),
                    step_type: StepType::Work,
                    status: StepStatus::Completed,
                    model: None,
                    engine_id: None,
                    policy: None,
                    summary: None,
                })
                .await
                .unwrap();
        }
        let policy = json!([{
            "behavior": "loop", "action": "step_back",
            "max_iterations": 1, "step_back": 2, "skip_steps": [1]
        }]);
        let step = failed_step_with_policy(&ts, run_id, 2, "02-test.md", policy).await;

        let decision = apply_loop_policies(&ctx, &step, PolicyReason::QaFailed)
            .await
            .unwrap();
        assert!(decision.applied);

        let steps = ts.storage.list_step_runs(run_id).await.unwrap();
        assert_eq!(steps[0].status, StepStatus::Pending); // index 0 reset
        assert_eq!(steps[1].status, StepStatus::Completed); // index 1 skipped
        assert_eq!(steps[2].status, StepStatus::Pending); // failing step reset

        let events = ts.storage.list_events(run_id).await.unwrap();
        let applied = events
            .iter()
            .find(|e| e.event_type == "loop_policy_applied")
            .unwrap();
        let reset = applied.metadata.as_ref().unwrap()["reset_indices"]
            .as_array()
            .unwrap()
            .clone();
        assert_eq!(reset, vec![json!(0), json!(2)]);
    }

    #[tokio::test]
    async fn trigger_policy_selects_target_by_agent_id() {
        let (ctx, ts, run_id) = context_with_run().await;
        let trigger = json!([{
            "behavior": "trigger", "trigger_agent_id": "build", "target_agent_id": "test"
        }]);
        let build = failed_step_with_policy(&ts, run_id, 0, "01-build.md", trigger).await;
        let target = ts
            .storage
            .create_step_run(NewStepRun {
                protocol_run_id: run_id,
                step_index: 1,
                step_name: "02-test.md".to_string(),
                step_type: StepType::Work,
                status: StepStatus::Pending,
                model: None,
                engine_id: None,
                policy: None,
                summary: None,
            })
            .await
            .unwrap();

        let decision = apply_trigger_policies(&ctx, &build, PolicyReason::ExecCompleted)
            .await
            .unwrap();
        assert!(decision.applied);
        assert_eq!(decision.target_step_id, Some(target.id));
        assert_eq!(decision.inline_depth, 0);
    }

    #[tokio::test]
    async fn trigger_policy_carries_current_inline_depth() {
        let (ctx, ts, run_id) = context_with_run().await;
        let trigger = json!([{
            "behavior": "trigger", "trigger_agent_id": "build", "target_agent_id": "test"
        }]);
        let build = failed_step_with_policy(&ts, run_id, 0, "01-build.md", trigger).await;
        ts.storage
            .update_step_status(
                build.id,
                StepStatus::NeedsQa,
                StepUpdate {
                    runtime_state: Some(json!({ INLINE_TRIGGER_DEPTH_KEY: 2 })),
                    ..StepUpdate::default()
                },
            )
            .await
            .unwrap();
        ts.storage
            .create_step_run(NewStepRun {
                protocol_run_id: run_id,
                step_index: 1,
                step_name: "02-test.md".to_string(),
                step_type: StepType::Work,
                status: StepStatus::Pending,
                model: None,
                engine_id: None,
                policy: None,
                summary: None,
            })
            .await
            .unwrap();

        let build = ts.storage.get_step_run(build.id).await.unwrap();
        let decision = apply_trigger_policies(&ctx, &build, PolicyReason::ExecCompleted)
            .await
            .unwrap();
        assert!(decision.applied);
        assert_eq!(decision.inline_depth, 2);
    }

    #[tokio::test]
    async fn trigger_policy_without_match_does_not_apply() {
        let (ctx, ts, run_id) = context_with_run().await;
        let trigger = json!([{
            "behavior": "trigger", "trigger_agent_id": "other", "target_agent_id": "test"
        }]);
        let step = failed_step_with_policy(&ts, run_id, 0, "01-build.md", trigger).await;

        let decision = apply_trigger_policies(&ctx, &step, PolicyReason::ExecCompleted)
            .await
            .unwrap();
        assert!(!decision.applied);
    }

    #[tokio::test]
    async fn non_null_condition_journals_unevaluated() {
        let (ctx, ts, run_id) = context_with_run().await;
        let policy = json!([{
            "behavior": "loop", "action": "retry", "max_iterations": 1,
            "condition": {"when": "tests_fail"}
        }]);
        let step = failed_step_with_policy(&ts, run_id, 0, "01-build.md", policy).await;

        let decision = apply_loop_policies(&ctx, &step, PolicyReason::ExecFailed)
            .await
            .unwrap();
        assert!(decision.applied);

        let events = ts.storage.list_events(run_id).await.unwrap();
        assert!(events
            .iter()
            .any(|e| e.event_type == "policy_condition_unevaluated"));
    }
}
