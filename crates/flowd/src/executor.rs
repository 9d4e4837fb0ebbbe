//! Step executor: runs one protocol step through its engine.
//!
//! Execution is a fixed sequence of phases; any failure reduces to a
//! state transition plus an event and returns. Duplicate job delivery is
//! made safe by re-reading step state up front: a step already in a
//! terminal-success state is a no-op.

use std::collections::BTreeMap;
use std::path::Path;

use flow_core::budget::enforce_token_budget;
use flow_core::events::EventKind;
use flow_core::policy::{PolicyDecision, PolicyReason, INLINE_TRIGGER_DEPTH_KEY};
use flow_core::prompt::{execute_step_prompt, prompt_version};
use flow_core::spec::{
    get_step_spec, resolve_outputs_map, resolve_spec_path, template_spec_hash,
    validate_step_spec_paths, StepSpec,
};
use flow_core::types::{Project, ProtocolRun, ProtocolStatus, StepRun, StepStatus};
use futures_util::future::BoxFuture;
use serde_json::json;
use tracing::{debug, info};

use crate::engine::{EngineRequest, Sandbox};
use crate::git;
use crate::policy::{apply_loop_policies, apply_trigger_policies};
use crate::qa;
use crate::queue::EXECUTE_STEP_JOB;
use crate::storage::StepUpdate;
use crate::{AppContext, HandlerResult};

/// Cap on inline trigger recursion.
pub const MAX_INLINE_TRIGGER_DEPTH: u32 = 3;

/// Execute one step run end to end.
pub async fn handle_execute_step(ctx: &AppContext, step_run_id: i64) -> HandlerResult<()> {
    let step = ctx.storage.get_step_run(step_run_id).await?;
    let run = ctx.storage.get_protocol_run(step.protocol_run_id).await?;
    let project = ctx.storage.get_project(run.project_id).await?;
    let spec_hash = template_spec_hash(run.template_config.as_ref());

    // Duplicate delivery or a cancelled run: nothing to do.
    if step.status.is_terminal_success() {
        debug!(step_run_id, "step already terminal; skipping");
        return Ok(());
    }
    if run.status == ProtocolStatus::Cancelled {
        ctx.storage
            .update_step_status(step.id, StepStatus::Cancelled, StepUpdate::default())
            .await?;
        return Ok(());
    }

    info!(
        step_run_id = step.id,
        protocol_run_id = run.id,
        protocol = %run.protocol_name,
        step_name = %step.step_name,
        "executing step"
    );
    ctx.storage
        .update_protocol_status(run.id, ProtocolStatus::Running)
        .await?;

    let step_spec = get_step_spec(run.template_config.as_ref(), &step.step_name);
    let engine_id = step_spec
        .as_ref()
        .and_then(|s| s.engine_id.clone())
        .or_else(|| step.engine_id.clone())
        .unwrap_or_else(|| ctx.engines.default_id().to_string());
    let engine = ctx.engines.get(&engine_id)?;

    // Stub short-circuit: the run still counts as executed.
    let repo_root = git::local_repo_path(&project.git_url);
    if !engine.available() || repo_root.is_none() {
        return execute_stub(ctx, &step, &run, spec_hash).await;
    }
    let repo_root = repo_root.unwrap_or_default();

    let worktree = git::ensure_worktree(&repo_root, &run.protocol_name, &run.base_branch)?;
    let protocol_root = worktree.join(".protocols").join(&run.protocol_name);

    // Spec validation: every referenced path must stay inside the
    // protocol root or the workspace.
    if let Some(spec_entry) = &step_spec {
        let errors = validate_step_spec_paths(&protocol_root, spec_entry, &worktree);
        if !errors.is_empty() {
            for error in &errors {
                ctx.storage
                    .append_event(
                        run.id,
                        Some(step.id),
                        EventKind::SpecValidationError.as_str(),
                        error,
                        Some(json!({"step": step.step_name, "spec_hash": spec_hash})),
                    )
                    .await?;
            }
            ctx.storage
                .update_step_status(
                    step.id,
                    StepStatus::Failed,
                    StepUpdate {
                        summary: Some("Spec validation failed".to_string()),
                        ..StepUpdate::default()
                    },
                )
                .await?;
            ctx.storage
                .update_protocol_status(run.id, ProtocolStatus::Blocked)
                .await?;
            return Ok(());
        }
    }

    // Resolve the prompt: spec prompt_ref first, then the legacy default
    // of the step file inside the protocol root.
    let step_path = match step_spec.as_ref().and_then(|s| s.prompt_ref.as_deref()) {
        Some(prompt_ref) => {
            let path = resolve_spec_path(prompt_ref, &protocol_root, &worktree);
            if path.exists() {
                path
            } else {
                protocol_root.join(&step.step_name)
            }
        }
        None => {
            let path = protocol_root.join(&step.step_name);
            if path.exists() {
                path
            } else {
                resolve_spec_path(&step.step_name, &protocol_root, &worktree)
            }
        }
    };

    let plan = std::fs::read_to_string(protocol_root.join("plan.md")).unwrap_or_default();
    let step_content = std::fs::read_to_string(&step_path).unwrap_or_default();
    let protocol_number = run
        .protocol_name
        .split('-')
        .next()
        .unwrap_or(&run.protocol_name);
    let exec_prompt = execute_step_prompt(
        &run.protocol_name,
        protocol_number,
        &plan,
        &step.step_name,
        &step_content,
    );

    let model = resolve_exec_model(&step_spec, &step, &project, ctx, &engine_id);

    // Token budget: strict violations fail the step without dispatching.
    let budget_context = format!("exec:{}", step.step_name);
    let estimated = match enforce_token_budget(
        &exec_prompt,
        ctx.config.token_budget_limit(),
        &budget_context,
        ctx.config.token_budget_mode,
    ) {
        Ok(estimated) => estimated,
        Err(e) => {
            ctx.storage
                .update_step_status(
                    step.id,
                    StepStatus::Failed,
                    StepUpdate {
                        summary: Some("Token budget exceeded".to_string()),
                        ..StepUpdate::default()
                    },
                )
                .await?;
            ctx.storage
                .append_event(
                    run.id,
                    Some(step.id),
                    EventKind::StepExecutionFailed.as_str(),
                    &e.to_string(),
                    Some(json!({"model": model, "spec_hash": spec_hash})),
                )
                .await?;
            ctx.storage
                .update_protocol_status(run.id, ProtocolStatus::Blocked)
                .await?;
            return Ok(());
        }
    };
    ctx.metrics.observe_tokens("exec", estimated);

    // Cancellation checkpoint before the engine call.
    let current = ctx.storage.get_protocol_run(run.id).await?;
    if current.status == ProtocolStatus::Cancelled {
        ctx.storage
            .update_step_status(step.id, StepStatus::Cancelled, StepUpdate::default())
            .await?;
        return Ok(());
    }

    let request = EngineRequest {
        project_id: project.id,
        protocol_run_id: run.id,
        step_run_id: step.id,
        model: model.clone(),
        working_dir: worktree.clone(),
        prompt_files: Vec::new(),
        prompt_text: exec_prompt,
        sandbox: Sandbox::WorkspaceWrite,
        output_schema: None,
    };

    let result = match engine.execute(&request).await {
        Ok(result) => result,
        Err(e) => {
            return execute_failed(ctx, &step, &run, &model, spec_hash, &e.to_string()).await;
        }
    };

    // Persist outputs: engine stdout lands at the resolved primary path
    // and every aux path.
    let default_aux = default_aux_outputs(&run, &worktree, &step);
    let outputs = resolve_outputs_map(
        step_spec.as_ref().and_then(|s| s.outputs.as_ref()),
        &protocol_root,
        &worktree,
        protocol_root.join(&step.step_name),
        default_aux,
        uses_alternate_layout(&run),
    );
    if !result.stdout.is_empty() {
        write_output(&outputs.protocol, &result.stdout)?;
        for path in outputs.aux.values() {
            write_output(path, &result.stdout)?;
        }
    }

    // Surface the work to CI.
    if git::push_and_open_pr(&worktree, &run.protocol_name, &run.base_branch)
        && git::trigger_ci(project.ci_provider.as_deref(), &repo_root, &run.protocol_name)
    {
        ctx.storage
            .append_event(
                run.id,
                Some(step.id),
                EventKind::CiTriggered.as_str(),
                "CI triggered after push.",
                Some(json!({"branch": run.protocol_name})),
            )
            .await?;
    }

    ctx.storage
        .update_step_status(
            step.id,
            StepStatus::NeedsQa,
            StepUpdate {
                summary: Some("Executed; pending QA".to_string()),
                model: Some(model.clone()),
                engine_id: Some(engine_id.clone()),
                ..StepUpdate::default()
            },
        )
        .await?;

    let aux_paths: BTreeMap<&String, String> = outputs
        .aux
        .iter()
        .map(|(label, path)| (label, path.display().to_string()))
        .collect();
    ctx.storage
        .append_event(
            run.id,
            Some(step.id),
            EventKind::StepCompleted.as_str(),
            "Step executed. QA required.",
            Some(json!({
                "estimated_tokens": {"exec": estimated},
                "prompt_versions": {"exec": prompt_version(Some(&step_path))},
                "outputs": {
                    "protocol": outputs.protocol.display().to_string(),
                    "aux": aux_paths,
                },
                "spec_hash": spec_hash,
                "model": model,
                "engine_id": engine_id,
            })),
        )
        .await?;

    let step = ctx.storage.get_step_run(step.id).await?;
    let decision = apply_trigger_policies(ctx, &step, PolicyReason::ExecCompleted).await?;
    if decision.applied {
        ctx.storage
            .update_protocol_status(run.id, ProtocolStatus::Running)
            .await?;
        dispatch_trigger(ctx, &decision, run.id, step.id, "exec_completed").await?;
    }

    if ctx.config.auto_qa_after_exec {
        auto_qa(ctx, &step).await?;
    }
    Ok(())
}

/// Stub execution: the engine CLI or the repository is unavailable, so
/// the step transitions to `needs_qa` with a stub summary and the normal
/// policy evaluation still runs.
async fn execute_stub(
    ctx: &AppContext,
    step: &StepRun,
    run: &ProtocolRun,
    spec_hash: Option<String>,
) -> HandlerResult<()> {
    ctx.storage
        .update_step_status(
            step.id,
            StepStatus::NeedsQa,
            StepUpdate {
                summary: Some("Executed via stub (engine/repo unavailable)".to_string()),
                ..StepUpdate::default()
            },
        )
        .await?;
    ctx.storage
        .append_event(
            run.id,
            Some(step.id),
            EventKind::StepCompleted.as_str(),
            "Step executed (stub; engine/repo unavailable). QA required.",
            Some(json!({"spec_hash": spec_hash})),
        )
        .await?;

    let step = ctx.storage.get_step_run(step.id).await?;
    let decision = apply_trigger_policies(ctx, &step, PolicyReason::ExecStub).await?;
    if decision.applied {
        ctx.storage
            .update_protocol_status(run.id, ProtocolStatus::Running)
            .await?;
        dispatch_trigger(ctx, &decision, run.id, step.id, "exec_stub").await?;
    }

    if ctx.config.auto_qa_after_exec {
        auto_qa(ctx, &step).await?;
    }
    Ok(())
}

/// Engine failure path: loop policies first (they may recover the run),
/// then trigger policies, and only then the run blocks.
async fn execute_failed(
    ctx: &AppContext,
    step: &StepRun,
    run: &ProtocolRun,
    model: &str,
    spec_hash: Option<String>,
    error: &str,
) -> HandlerResult<()> {
    ctx.storage
        .update_step_status(
            step.id,
            StepStatus::Failed,
            StepUpdate {
                summary: Some(format!("Execution error: {error}")),
                ..StepUpdate::default()
            },
        )
        .await?;
    ctx.storage
        .append_event(
            run.id,
            Some(step.id),
            EventKind::StepExecutionFailed.as_str(),
            &format!("Execution failed: {error}"),
            Some(json!({"model": model, "spec_hash": spec_hash})),
        )
        .await?;

    let step = ctx.storage.get_step_run(step.id).await?;
    let loop_decision = apply_loop_policies(ctx, &step, PolicyReason::ExecFailed).await?;
    if loop_decision.applied {
        ctx.storage
            .update_protocol_status(run.id, ProtocolStatus::Running)
            .await?;
        ctx.queue.enqueue(
            EXECUTE_STEP_JOB,
            json!({"step_run_id": step.id, "protocol_run_id": run.id}),
            None,
        )?;
        return Ok(());
    }

    let decision = apply_trigger_policies(ctx, &step, PolicyReason::ExecFailed).await?;
    if decision.applied {
        ctx.storage
            .update_protocol_status(run.id, ProtocolStatus::Running)
            .await?;
        dispatch_trigger(ctx, &decision, run.id, step.id, "exec_failed").await?;
        return Ok(());
    }

    ctx.storage
        .update_protocol_status(run.id, ProtocolStatus::Blocked)
        .await?;
    Ok(())
}

/// Route an applied trigger decision: enqueue through the queue when a
/// remote broker is configured, otherwise inline-execute the target with
/// the depth cap enforced.
pub async fn dispatch_trigger(
    ctx: &AppContext,
    decision: &PolicyDecision,
    protocol_run_id: i64,
    source_step_id: i64,
    source: &str,
) -> HandlerResult<()> {
    let Some(target_step_id) = decision.target_step_id else {
        return Ok(());
    };
    let inline_depth = decision.inline_depth;

    if inline_depth >= MAX_INLINE_TRIGGER_DEPTH {
        ctx.storage
            .append_event(
                protocol_run_id,
                Some(source_step_id),
                EventKind::TriggerInlineDepthExceeded.as_str(),
                &format!(
                    "Inline trigger depth exceeded ({inline_depth}/{MAX_INLINE_TRIGGER_DEPTH})."
                ),
                Some(json!({
                    "target_step_id": target_step_id,
                    "source": source,
                    "inline_depth": inline_depth,
                })),
            )
            .await?;
        return Ok(());
    }

    if ctx.config.redis_url.is_some() {
        match ctx.queue.enqueue(
            EXECUTE_STEP_JOB,
            json!({
                "step_run_id": target_step_id,
                "protocol_run_id": protocol_run_id,
                "inline_trigger_depth": inline_depth,
            }),
            None,
        ) {
            Ok(job) => {
                ctx.storage
                    .append_event(
                        protocol_run_id,
                        Some(target_step_id),
                        EventKind::TriggerEnqueued.as_str(),
                        "Triggered step enqueued for execution.",
                        Some(json!({
                            "job_id": job.job_id,
                            "target_step_id": target_step_id,
                            "source": source,
                            "inline_depth": inline_depth,
                        })),
                    )
                    .await?;
                return Ok(());
            }
            Err(e) => {
                ctx.storage
                    .append_event(
                        protocol_run_id,
                        Some(target_step_id),
                        EventKind::TriggerEnqueueFailed.as_str(),
                        &format!("Failed to enqueue triggered step: {e}"),
                        Some(json!({
                            "target_step_id": target_step_id,
                            "source": source,
                            "inline_depth": inline_depth,
                        })),
                    )
                    .await?;
                return Ok(());
            }
        }
    }

    // Inline fallback: carry the incremented depth on the target so a
    // trigger chain terminates at the cap.
    let target = ctx.storage.get_step_run(target_step_id).await?;
    let next_state = flow_core::policy::with_runtime_counter(
        target.runtime_state.as_ref(),
        INLINE_TRIGGER_DEPTH_KEY,
        inline_depth + 1,
    );
    ctx.storage
        .update_step_status(
            target_step_id,
            StepStatus::Running,
            StepUpdate {
                summary: Some("Triggered (inline)".to_string()),
                runtime_state: Some(next_state),
                ..StepUpdate::default()
            },
        )
        .await?;
    ctx.storage
        .append_event(
            protocol_run_id,
            Some(target_step_id),
            EventKind::TriggerExecutedInline.as_str(),
            "Triggered step executed inline (no queue configured).",
            Some(json!({
                "target_step_id": target_step_id,
                "source": source,
                "inline_depth": inline_depth,
            })),
        )
        .await?;

    if let Err(e) = execute_step_boxed(ctx, target_step_id).await {
        ctx.storage
            .append_event(
                protocol_run_id,
                Some(target_step_id),
                EventKind::TriggerInlineFailed.as_str(),
                &format!("Inline trigger failed: {e}"),
                Some(json!({"target_step_id": target_step_id, "source": source})),
            )
            .await?;
        ctx.storage
            .update_step_status(
                target_step_id,
                StepStatus::Failed,
                StepUpdate {
                    summary: Some(format!("Trigger inline failed: {e}")),
                    ..StepUpdate::default()
                },
            )
            .await?;
    }
    Ok(())
}

/// Boxed indirection so inline triggers can recurse into the executor.
fn execute_step_boxed<'a>(
    ctx: &'a AppContext,
    step_run_id: i64,
) -> BoxFuture<'a, HandlerResult<()>> {
    Box::pin(handle_execute_step(ctx, step_run_id))
}

async fn auto_qa(ctx: &AppContext, step: &StepRun) -> HandlerResult<()> {
    ctx.storage
        .append_event(
            step.protocol_run_id,
            Some(step.id),
            EventKind::QaEnqueued.as_str(),
            "Auto QA after execution.",
            Some(json!({"source": "auto_after_exec"})),
        )
        .await?;
    qa::handle_quality(ctx, step.id).await
}

/// Model chain for execution: spec entry, step row, project defaults,
/// environment default, engine default, hard-coded fallback.
fn resolve_exec_model(
    step_spec: &Option<StepSpec>,
    step: &StepRun,
    project: &Project,
    ctx: &AppContext,
    engine_id: &str,
) -> String {
    step_spec
        .as_ref()
        .and_then(|s| s.model.clone())
        .or_else(|| step.model.clone())
        .or_else(|| project.default_model("exec").map(String::from))
        .or_else(|| ctx.config.exec_model.clone())
        .or_else(|| {
            ctx.engines
                .get(engine_id)
                .ok()
                .and_then(|e| e.metadata().default_model.clone())
        })
        .unwrap_or_else(|| crate::engine::CodexEngine::FALLBACK_MODEL.to_string())
}

/// The alternate workspace layout mirrors outputs under a `codemachine`
/// aux label; detected from the template kind on the run.
fn uses_alternate_layout(run: &ProtocolRun) -> bool {
    run.template_config
        .as_ref()
        .and_then(|t| t.get("template"))
        .is_some()
}

fn default_aux_outputs(
    run: &ProtocolRun,
    worktree: &Path,
    step: &StepRun,
) -> BTreeMap<String, std::path::PathBuf> {
    let mut aux = BTreeMap::new();
    if uses_alternate_layout(run) {
        aux.insert(
            "codemachine".to_string(),
            worktree.join(".codemachine/outputs").join(&step.step_name),
        );
    }
    aux
}

fn write_output(path: &Path, content: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)
}
