//! QA gate: validates an executed step and maps the verdict onto step
//! and protocol state.

use flow_core::budget::enforce_token_budget;
use flow_core::events::EventKind;
use flow_core::policy::PolicyReason;
use flow_core::prompt::{prompt_version, qa_prompt_body};
use flow_core::spec::{get_step_spec, resolve_spec_path, template_spec_hash, QaPolicy};
use flow_core::types::{ProtocolStatus, StepStatus};
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::engine::{EngineRequest, Sandbox};
use crate::executor::dispatch_trigger;
use crate::git;
use crate::policy::{apply_loop_policies, apply_trigger_policies};
use crate::queue::EXECUTE_STEP_JOB;
use crate::state::maybe_complete_protocol;
use crate::storage::StepUpdate;
use crate::{AppContext, HandlerResult};

/// Fallback QA model when neither spec, project, nor environment names
/// one.
const QA_FALLBACK_MODEL: &str = "codex-5.1-max";

/// QA verdict parsed from engine output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail,
}

/// Parse the verdict from a QA report: the literal `VERDICT: FAIL`
/// anywhere (case-insensitive), or a final non-empty line starting with
/// `VERDICT` and containing `FAIL`, reads as a failure; anything else
/// passes.
pub fn determine_verdict(report: &str) -> Verdict {
    let upper = report.to_uppercase();
    if upper.contains("VERDICT: FAIL") {
        return Verdict::Fail;
    }
    let last_line = upper.lines().rev().find(|line| !line.trim().is_empty());
    if let Some(line) = last_line {
        let line = line.trim();
        if line.starts_with("VERDICT") && line.contains("FAIL") {
            return Verdict::Fail;
        }
    }
    Verdict::Pass
}

/// Run the QA gate for one step.
pub async fn handle_quality(ctx: &AppContext, step_run_id: i64) -> HandlerResult<()> {
    let step = ctx.storage.get_step_run(step_run_id).await?;
    let run = ctx.storage.get_protocol_run(step.protocol_run_id).await?;
    let project = ctx.storage.get_project(run.project_id).await?;
    let spec_hash = template_spec_hash(run.template_config.as_ref());

    // Never overwrite a step another actor already closed out.
    if step.status.is_terminal_success() {
        return Ok(());
    }

    info!(
        step_run_id = step.id,
        protocol_run_id = run.id,
        step_name = %step.step_name,
        "running QA"
    );

    let step_spec = get_step_spec(run.template_config.as_ref(), &step.step_name);
    let qa_cfg = step_spec.as_ref().and_then(|s| s.qa.clone());

    // Policy skip: the step passes without an engine call.
    if qa_cfg.as_ref().and_then(|qa| qa.policy) == Some(QaPolicy::Skip) {
        ctx.storage
            .update_step_status(
                step.id,
                StepStatus::Completed,
                StepUpdate {
                    summary: Some("QA skipped (policy)".to_string()),
                    ..StepUpdate::default()
                },
            )
            .await?;
        ctx.storage
            .append_event(
                run.id,
                Some(step.id),
                EventKind::QaSkippedPolicy.as_str(),
                "QA skipped by policy.",
                Some(json!({"policy": "skip", "spec_hash": spec_hash})),
            )
            .await?;
        let step = ctx.storage.get_step_run(step.id).await?;
        let decision = apply_trigger_policies(ctx, &step, PolicyReason::QaSkippedPolicy).await?;
        if decision.applied {
            ctx.storage
                .update_protocol_status(run.id, ProtocolStatus::Running)
                .await?;
            dispatch_trigger(ctx, &decision, run.id, step.id, "qa_skipped_policy").await?;
        }
        maybe_complete_protocol(ctx, run.id).await?;
        return Ok(());
    }

    let qa_model = qa_cfg
        .as_ref()
        .and_then(|qa| qa.model.clone())
        .or_else(|| project.default_model("qa").map(String::from))
        .or_else(|| ctx.config.qa_model.clone())
        .unwrap_or_else(|| QA_FALLBACK_MODEL.to_string());
    let engine_id = qa_cfg
        .as_ref()
        .and_then(|qa| qa.engine_id.clone())
        .or_else(|| step.engine_id.clone())
        .unwrap_or_else(|| ctx.engines.default_id().to_string());
    let engine = ctx.engines.get(&engine_id)?;

    // Stub pass-through when the engine CLI or the repo is unavailable.
    let repo_root = git::local_repo_path(&project.git_url);
    if !engine.available() || repo_root.is_none() {
        ctx.storage
            .update_step_status(
                step.id,
                StepStatus::Completed,
                StepUpdate {
                    summary: Some("QA passed (stub; engine/repo unavailable)".to_string()),
                    ..StepUpdate::default()
                },
            )
            .await?;
        ctx.metrics.inc_qa_verdict("pass");
        ctx.storage
            .append_event(
                run.id,
                Some(step.id),
                EventKind::QaPassed.as_str(),
                "QA passed (stub; engine/repo unavailable).",
                Some(json!({"model": qa_model, "spec_hash": spec_hash})),
            )
            .await?;
        let step = ctx.storage.get_step_run(step.id).await?;
        let decision = apply_trigger_policies(ctx, &step, PolicyReason::QaStubPass).await?;
        if decision.applied {
            ctx.storage
                .update_protocol_status(run.id, ProtocolStatus::Running)
                .await?;
            dispatch_trigger(ctx, &decision, run.id, step.id, "qa_stub_pass").await?;
        }
        maybe_complete_protocol(ctx, run.id).await?;
        return Ok(());
    }
    let repo_root = repo_root.unwrap_or_default();

    let worktree = git::ensure_worktree(&repo_root, &run.protocol_name, &run.base_branch)?;
    let protocol_root = worktree.join(".protocols").join(&run.protocol_name);
    let qa_prompt_path = resolve_qa_prompt_path(
        qa_cfg.as_ref().and_then(|qa| qa.prompt.as_deref()),
        &protocol_root,
        &worktree,
    );
    let qa_prompt_ver = prompt_version(Some(&qa_prompt_path));

    let prompt_prefix = std::fs::read_to_string(&qa_prompt_path).unwrap_or_default();
    let step_file = protocol_root.join(&step.step_name);
    let body = qa_prompt_body(
        &read_or_empty(&protocol_root.join("plan.md")),
        &read_or_empty(&protocol_root.join("context.md")),
        &read_or_empty(&protocol_root.join("log.md")),
        &step.step_name,
        &read_or_empty(&step_file),
        &git::status_porcelain(&worktree),
        &git::last_commit_message(&worktree),
    );
    let full_prompt = format!("{prompt_prefix}\n\n{body}");

    let budget_context = format!("qa:{}", step.step_name);
    let estimated = match enforce_token_budget(
        &full_prompt,
        ctx.config.token_budget_limit(),
        &budget_context,
        ctx.config.token_budget_mode,
    ) {
        Ok(estimated) => estimated,
        Err(e) => {
            return qa_error(ctx, &step, &run, &qa_model, &qa_prompt_ver, &e.to_string()).await;
        }
    };
    ctx.metrics.observe_tokens("qa", estimated);

    let request = EngineRequest {
        project_id: project.id,
        protocol_run_id: run.id,
        step_run_id: step.id,
        model: qa_model.clone(),
        working_dir: worktree.clone(),
        prompt_files: vec![qa_prompt_path],
        prompt_text: full_prompt,
        sandbox: Sandbox::ReadOnly,
        output_schema: None,
    };

    let result = match engine.qa(&request).await {
        Ok(result) => result,
        Err(e) => {
            ctx.metrics.inc_qa_verdict("fail");
            return qa_error(ctx, &step, &run, &qa_model, &qa_prompt_ver, &e.to_string()).await;
        }
    };

    let report = result.stdout.trim().to_string();
    if let Err(e) = std::fs::write(protocol_root.join("quality-report.md"), &report) {
        warn!(step_run_id = step.id, error = %e, "failed to write quality report");
    }

    let metadata = json!({
        "estimated_tokens": {"qa": estimated},
        "prompt_versions": {"qa": qa_prompt_ver},
        "model": qa_model,
        "spec_hash": spec_hash,
    });

    match determine_verdict(&report) {
        Verdict::Fail => {
            ctx.storage
                .update_step_status(
                    step.id,
                    StepStatus::Failed,
                    StepUpdate {
                        summary: Some("QA verdict: FAIL".to_string()),
                        ..StepUpdate::default()
                    },
                )
                .await?;
            ctx.storage
                .append_event(
                    run.id,
                    Some(step.id),
                    EventKind::QaFailed.as_str(),
                    "QA failed.",
                    Some(metadata),
                )
                .await?;
            ctx.metrics.inc_qa_verdict("fail");

            let step = ctx.storage.get_step_run(step.id).await?;
            let loop_decision = apply_loop_policies(ctx, &step, PolicyReason::QaFailed).await?;
            if loop_decision.applied {
                ctx.storage
                    .update_protocol_status(run.id, ProtocolStatus::Running)
                    .await?;
                ctx.queue.enqueue(
                    EXECUTE_STEP_JOB,
                    json!({"step_run_id": step.id, "protocol_run_id": run.id}),
                    None,
                )?;
            } else {
                ctx.storage
                    .update_protocol_status(run.id, ProtocolStatus::Blocked)
                    .await?;
            }
        }
        Verdict::Pass => {
            ctx.storage
                .update_step_status(
                    step.id,
                    StepStatus::Completed,
                    StepUpdate {
                        summary: Some("QA verdict: PASS".to_string()),
                        ..StepUpdate::default()
                    },
                )
                .await?;
            ctx.storage
                .append_event(
                    run.id,
                    Some(step.id),
                    EventKind::QaPassed.as_str(),
                    "QA passed.",
                    Some(metadata),
                )
                .await?;
            ctx.metrics.inc_qa_verdict("pass");

            let step = ctx.storage.get_step_run(step.id).await?;
            let decision = apply_trigger_policies(ctx, &step, PolicyReason::QaPassed).await?;
            if decision.applied {
                ctx.storage
                    .update_protocol_status(run.id, ProtocolStatus::Running)
                    .await?;
                dispatch_trigger(ctx, &decision, run.id, step.id, "qa_passed").await?;
            }
            maybe_complete_protocol(ctx, run.id).await?;
        }
    }
    Ok(())
}

/// Engine-level QA failure (distinct from a FAIL verdict): the step
/// fails and the run blocks.
async fn qa_error(
    ctx: &AppContext,
    step: &flow_core::types::StepRun,
    run: &flow_core::types::ProtocolRun,
    qa_model: &str,
    qa_prompt_ver: &str,
    error: &str,
) -> HandlerResult<()> {
    warn!(step_run_id = step.id, error, "QA failed to run");
    ctx.storage
        .update_step_status(
            step.id,
            StepStatus::Failed,
            StepUpdate {
                summary: Some(format!("QA error: {error}")),
                ..StepUpdate::default()
            },
        )
        .await?;
    ctx.storage
        .update_protocol_status(run.id, ProtocolStatus::Blocked)
        .await?;
    ctx.storage
        .append_event(
            run.id,
            Some(step.id),
            EventKind::QaError.as_str(),
            &format!("QA failed to run: {error}"),
            Some(json!({
                "prompt_versions": {"qa": qa_prompt_ver},
                "model": qa_model,
            })),
        )
        .await?;
    Ok(())
}

/// QA prompt path: spec-provided references resolve against the protocol
/// root then workspace; the default lives in the workspace prompt
/// library.
fn resolve_qa_prompt_path(
    prompt_ref: Option<&str>,
    protocol_root: &Path,
    workspace: &Path,
) -> PathBuf {
    match prompt_ref {
        Some(reference) => resolve_spec_path(reference, protocol_root, workspace),
        None => workspace.join("prompts/quality-validator.prompt.md"),
    }
}

fn read_or_empty(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::MockEngine;
    use crate::storage::tests::{create_test_storage, TestStorage};
    use crate::storage::{NewProject, NewProtocolRun, NewStepRun};
    use crate::testutil::{test_context, test_context_with};
    use flow_core::config::Config;
    use flow_core::spec::PROTOCOL_SPEC_KEY;
    use flow_core::types::StepType;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn verdict_fail_anywhere_in_report() {
        assert_eq!(determine_verdict("All good.\nVERDICT: FAIL\nmore"), Verdict::Fail);
        assert_eq!(determine_verdict("verdict: fail"), Verdict::Fail);
    }

    #[test]
    fn verdict_fail_on_trailing_verdict_line() {
        assert_eq!(
            determine_verdict("Checks ran.\nVERDICT - FAILED CHECKS\n\n"),
            Verdict::Fail
        );
    }

    #[test]
    fn verdict_pass_by_default() {
        assert_eq!(determine_verdict(""), Verdict::Pass);
        assert_eq!(determine_verdict("VERDICT: PASS"), Verdict::Pass);
        // FAIL mentioned mid-report without the verdict marker.
        assert_eq!(
            determine_verdict("Two tests FAIL here.\nVERDICT: PASS"),
            Verdict::Pass
        );
    }

    async fn seed(
        ts: &TestStorage,
        git_url: &str,
        template_config: Option<serde_json::Value>,
        step_status: StepStatus,
    ) -> (i64, i64) {
        let project = ts
            .storage
            .create_project(NewProject {
                name: "demo".to_string(),
                git_url: git_url.to_string(),
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
                template_config,
                template_source: None,
            })
            .await
            .unwrap();
        let step = ts
            .storage
            .create_step_run(NewStepRun {
                protocol_run_id: run.id,
                step_index: 0,
                step_name: "01-build.md".to_string(),
                step_type: StepType::Work,
                status: step_status,
                model: None,
                engine_id: None,
                policy: None,
                summary: None,
            })
            .await
            .unwrap();
        (run.id, step.id)
    }

    fn qa_workspace(dir: &TempDir) -> String {
        let repo = dir.path().join("repo");
        let protocol_root = dir.path().join("worktrees/0001-demo/.protocols/0001-demo");
        std::fs::create_dir_all(&repo).unwrap();
        std::fs::create_dir_all(&protocol_root).unwrap();
        std::fs::write(protocol_root.join("plan.md"), "plan").unwrap();
        std::fs::write(protocol_root.join("01-build.md"), "step").unwrap();
        repo.display().to_string()
    }

    #[tokio::test]
    async fn skip_policy_completes_without_engine() {
        let ts = create_test_storage().await;
        let template = serde_json::json!({
            PROTOCOL_SPEC_KEY: {
                "steps": [{"id": "build", "name": "01-build.md", "qa": {"policy": "skip"}}]
            }
        });
        let (run_id, step_id) = seed(&ts, "/missing", Some(template), StepStatus::NeedsQa).await;
        let ctx = test_context(&ts).await;

        handle_quality(&ctx, step_id).await.unwrap();

        let step = ts.storage.get_step_run(step_id).await.unwrap();
        assert_eq!(step.status, StepStatus::Completed);

        let events = ts.storage.list_events(run_id).await.unwrap();
        assert!(events.iter().any(|e| e.event_type == "qa_skipped_policy"));
        // The only step completed, so the protocol closed out.
        let run = ts.storage.get_protocol_run(run_id).await.unwrap();
        assert_eq!(run.status, ProtocolStatus::Completed);
    }

    #[tokio::test]
    async fn stub_pass_completes_step_and_protocol() {
        let ts = create_test_storage().await;
        let (run_id, step_id) = seed(&ts, "/missing", None, StepStatus::NeedsQa).await;
        let ctx = test_context(&ts).await;

        handle_quality(&ctx, step_id).await.unwrap();

        let step = ts.storage.get_step_run(step_id).await.unwrap();
        assert_eq!(step.status, StepStatus::Completed);
        let run = ts.storage.get_protocol_run(run_id).await.unwrap();
        assert_eq!(run.status, ProtocolStatus::Completed);

        let events = ts.storage.list_events(run_id).await.unwrap();
        let passed = events.iter().find(|e| e.event_type == "qa_passed").unwrap();
        assert!(passed.message.contains("stub"));
    }

    #[tokio::test]
    async fn terminal_steps_are_not_overwritten() {
        let ts = create_test_storage().await;
        let (run_id, step_id) = seed(&ts, "/missing", None, StepStatus::Cancelled).await;
        let ctx = test_context(&ts).await;

        handle_quality(&ctx, step_id).await.unwrap();

        let step = ts.storage.get_step_run(step_id).await.unwrap();
        assert_eq!(step.status, StepStatus::Cancelled);
        assert!(ts.storage.list_events(run_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn fail_verdict_fails_step_and_blocks_run() {
        let dir = TempDir::new().unwrap();
        let git_url = qa_workspace(&dir);
        let ts = create_test_storage().await;
        let (run_id, step_id) = seed(&ts, &git_url, None, StepStatus::NeedsQa).await;

        let engine = Arc::new(MockEngine::new("codex"));
        engine.push_stdout("Report.\nVERDICT: FAIL");
        let ctx = test_context_with(&ts, Config::default(), engine).await;

        handle_quality(&ctx, step_id).await.unwrap();

        let step = ts.storage.get_step_run(step_id).await.unwrap();
        assert_eq!(step.status, StepStatus::Failed);
        assert_eq!(step.summary.as_deref(), Some("QA verdict: FAIL"));
        let run = ts.storage.get_protocol_run(run_id).await.unwrap();
        assert_eq!(run.status, ProtocolStatus::Blocked);

        let events = ts.storage.list_events(run_id).await.unwrap();
        let failed = events.iter().find(|e| e.event_type == "qa_failed").unwrap();
        let metadata = failed.metadata.as_ref().unwrap();
        assert!(metadata["estimated_tokens"]["qa"].as_u64().unwrap() > 0);
        assert_eq!(metadata["model"], QA_FALLBACK_MODEL);
    }

    #[tokio::test]
    async fn fail_verdict_with_loop_policy_keeps_run_running() {
        let dir = TempDir::new().unwrap();
        let git_url = qa_workspace(&dir);
        let ts = create_test_storage().await;
        let (run_id, step_id) = seed(&ts, &git_url, None, StepStatus::NeedsQa).await;
        let policy =
            serde_json::json!([{"behavior": "loop", "action": "retry", "max_iterations": 1}]);
        crate::storage::tests::set_step_policy(&ts, step_id, &policy).await;

        let engine = Arc::new(MockEngine::new("codex"));
        engine.push_stdout("VERDICT: FAIL");
        let ctx = test_context_with(&ts, Config::default(), engine).await;

        handle_quality(&ctx, step_id).await.unwrap();

        let step = ts.storage.get_step_run(step_id).await.unwrap();
        assert_eq!(step.status, StepStatus::Pending);
        assert_eq!(step.retries, 1);
        let run = ts.storage.get_protocol_run(run_id).await.unwrap();
        assert_eq!(run.status, ProtocolStatus::Running);

        let events = ts.storage.list_events(run_id).await.unwrap();
        assert!(events.iter().any(|e| e.event_type == "loop_policy_applied"));
    }

    #[tokio::test]
    async fn pass_verdict_completes_and_closes_protocol() {
        let dir = TempDir::new().unwrap();
        let git_url = qa_workspace(&dir);
        let ts = create_test_storage().await;
        let (run_id, step_id) = seed(&ts, &git_url, None, StepStatus::NeedsQa).await;

        let engine = Arc::new(MockEngine::new("codex"));
        engine.push_stdout("Everything checks out.\nVERDICT: PASS");
        let ctx = test_context_with(&ts, Config::default(), engine).await;

        handle_quality(&ctx, step_id).await.unwrap();

        let step = ts.storage.get_step_run(step_id).await.unwrap();
        assert_eq!(step.status, StepStatus::Completed);
        let run = ts.storage.get_protocol_run(run_id).await.unwrap();
        assert_eq!(run.status, ProtocolStatus::Completed);
    }

    #[tokio::test]
    async fn engine_error_emits_qa_error_and_blocks() {
        let dir = TempDir::new().unwrap();
        let git_url = qa_workspace(&dir);
        let ts = create_test_storage().await;
        let (run_id, step_id) = seed(&ts, &git_url, None, StepStatus::NeedsQa).await;

        let engine = Arc::new(MockEngine::new("codex"));
        engine.push_response(Err(crate::engine::EngineError::NonZeroExit {
            code: 2,
            stderr: "engine exploded".to_string(),
        }));
        let ctx = test_context_with(&ts, Config::default(), engine).await;

        handle_quality(&ctx, step_id).await.unwrap();

        let step = ts.storage.get_step_run(step_id).await.unwrap();
        assert_eq!(step.status, StepStatus::Failed);
        let run = ts.storage.get_protocol_run(run_id).await.unwrap();
        assert_eq!(run.status, ProtocolStatus::Blocked);

        let events = ts.storage.list_events(run_id).await.unwrap();
        assert!(events.iter().any(|e| e.event_type == "qa_error"));
    }
}
