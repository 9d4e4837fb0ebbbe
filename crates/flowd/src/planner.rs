//! Protocol planner: turns a protocol description into a validated spec
//! and materialised step rows.
//!
//! Planning is re-runnable: invoking it twice on the same workspace
//! produces the same spec hash and creates no duplicate step rows.

use std::collections::HashSet;
use std::path::Path;

use flow_core::budget::enforce_token_budget;
use flow_core::events::EventKind;
use flow_core::prompt::{decompose_step_prompt, planning_prompt, prompt_version};
use flow_core::spec::{
    build_spec_from_protocol_files, protocol_spec_hash, validate_protocol_spec, ProtocolSpec,
    PROTOCOL_SPEC_KEY,
};
use flow_core::types::{ProtocolRun, ProtocolStatus, StepStatus, StepType};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::engine::{EngineRequest, Sandbox};
use crate::git;
use crate::state::maybe_complete_protocol;
use crate::storage::NewStepRun;
use crate::{AppContext, HandlerResult};

const PLANNING_FALLBACK_MODEL: &str = "gpt-5.1-high";

/// JSON planning artefact returned by the planning engine.
#[derive(Debug, Deserialize)]
struct PlanningArtefact {
    #[serde(default)]
    plan: String,
    #[serde(default)]
    context: String,
    #[serde(default)]
    steps: Vec<PlannedStepFile>,
}

#[derive(Debug, Deserialize)]
struct PlannedStepFile {
    name: String,
    #[serde(default)]
    content: String,
}

/// Plan (or re-plan) a protocol run.
pub async fn handle_plan_protocol(ctx: &AppContext, protocol_run_id: i64) -> HandlerResult<()> {
    let run = ctx.storage.get_protocol_run(protocol_run_id).await?;
    let project = ctx.storage.get_project(run.project_id).await?;

    if run.status == ProtocolStatus::Cancelled {
        return Ok(());
    }

    info!(
        protocol_run_id = run.id,
        protocol = %run.protocol_name,
        project_id = project.id,
        "planning protocol"
    );

    let engine = ctx.engines.get_default();
    let repo_root = git::local_repo_path(&project.git_url);

    // Stub path: still transitions to planned so local development and
    // idempotent recovery work without the engine CLI.
    if !engine.available() || repo_root.is_none() {
        ctx.storage
            .update_protocol_status(protocol_run_id, ProtocolStatus::Planned)
            .await?;
        let run = ctx.storage.get_protocol_run(protocol_run_id).await?;
        let spec_hash = flow_core::spec::template_spec_hash(run.template_config.as_ref());
        let has_spec = spec_hash.is_some();
        ctx.storage
            .append_event(
                protocol_run_id,
                None,
                EventKind::Planned.as_str(),
                "Protocol planned (stub; engine or repo unavailable).",
                Some(json!({"spec_hash": spec_hash, "spec_validated": false})),
            )
            .await?;
        // A pre-seeded spec may declare zero steps; close the run out.
        if has_spec {
            maybe_complete_protocol(ctx, protocol_run_id).await?;
        }
        return Ok(());
    }
    let repo_root = repo_root.unwrap_or_default();

    let worktree = git::ensure_worktree(&repo_root, &run.protocol_name, &run.base_branch)?;
    let protocol_root = worktree.join(".protocols").join(&run.protocol_name);
    ctx.storage
        .update_protocol_paths(
            protocol_run_id,
            &worktree.display().to_string(),
            &protocol_root.display().to_string(),
        )
        .await?;

    let planning_model = project
        .default_model("planning")
        .map(String::from)
        .or_else(|| ctx.config.planning_model.clone())
        .unwrap_or_else(|| PLANNING_FALLBACK_MODEL.to_string());
    let protocol_number = run
        .protocol_name
        .split('-')
        .next()
        .unwrap_or(&run.protocol_name);

    let planning_prompt_path = repo_root.join("prompts/protocol-new.prompt.md");
    let templates = std::fs::read_to_string(&planning_prompt_path).unwrap_or_default();
    let planning_text = planning_prompt(
        &run.protocol_name,
        protocol_number,
        run.description.as_deref().unwrap_or(""),
        &templates,
    );
    let planning_tokens = enforce_token_budget(
        &planning_text,
        ctx.config.token_budget_limit(),
        "planning",
        ctx.config.token_budget_mode,
    )?;
    ctx.metrics.observe_tokens("planning", planning_tokens);

    let schema_path = repo_root.join("schemas/protocol-planning.schema.json");
    let planning_request = EngineRequest {
        project_id: project.id,
        protocol_run_id: run.id,
        step_run_id: 0,
        model: planning_model.clone(),
        working_dir: worktree.clone(),
        prompt_files: Vec::new(),
        prompt_text: planning_text,
        sandbox: Sandbox::ReadOnly,
        output_schema: schema_path.exists().then_some(schema_path),
    };
    let planning_result = engine.plan(&planning_request).await?;
    let artefact: PlanningArtefact = serde_json::from_str(&planning_result.stdout)?;
    write_protocol_files(&protocol_root, &artefact)?;

    let steps_created = sync_step_runs_from_protocol(ctx, &protocol_root, protocol_run_id).await?;
    let run = ctx.storage.get_protocol_run(protocol_run_id).await?;
    if run.status == ProtocolStatus::Blocked {
        // Spec validation failed during synchronisation.
        return Ok(());
    }

    // Decompose each non-setup step file into finer-grained tasks.
    let decompose_model = project
        .default_model("decompose")
        .map(String::from)
        .or_else(|| ctx.config.decompose_model.clone())
        .unwrap_or_else(|| PLANNING_FALLBACK_MODEL.to_string());
    let plan_md = std::fs::read_to_string(protocol_root.join("plan.md")).unwrap_or_default();
    let mut decompose_tokens = 0u64;
    for entry in step_files(&protocol_root)? {
        let file_name = entry
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        if file_name.to_lowercase().starts_with("00-setup") {
            continue;
        }
        let content = std::fs::read_to_string(&entry).unwrap_or_default();
        let decompose_text = decompose_step_prompt(
            &run.protocol_name,
            protocol_number,
            &plan_md,
            &file_name,
            &content,
        );
        decompose_tokens += enforce_token_budget(
            &decompose_text,
            ctx.config.token_budget_limit(),
            "decompose",
            ctx.config.token_budget_mode,
        )?;

        let request = EngineRequest {
            project_id: project.id,
            protocol_run_id: run.id,
            step_run_id: 0,
            model: decompose_model.clone(),
            working_dir: worktree.clone(),
            prompt_files: Vec::new(),
            prompt_text: decompose_text,
            sandbox: Sandbox::ReadOnly,
            output_schema: None,
        };
        let result = engine.plan(&request).await?;
        std::fs::write(&entry, result.stdout)?;
    }
    ctx.metrics.observe_tokens("decompose", decompose_tokens);

    ctx.storage
        .update_protocol_status(protocol_run_id, ProtocolStatus::Planned)
        .await?;
    let run = ctx.storage.get_protocol_run(protocol_run_id).await?;
    let spec_hash = flow_core::spec::template_spec_hash(run.template_config.as_ref());
    ctx.storage
        .append_event(
            protocol_run_id,
            None,
            EventKind::Planned.as_str(),
            "Protocol planned.",
            Some(json!({
                "steps_created": steps_created,
                "protocol_root": protocol_root.display().to_string(),
                "models": {"planning": planning_model, "decompose": decompose_model},
                "prompt_versions": {"planning": prompt_version(Some(&planning_prompt_path))},
                "estimated_tokens": {"planning": planning_tokens, "decompose": decompose_tokens},
                "spec_hash": spec_hash,
                "spec_validated": true,
            })),
        )
        .await?;
    maybe_complete_protocol(ctx, protocol_run_id).await?;

    // Surface the planned branch to CI, best effort.
    if git::push_and_open_pr(&worktree, &run.protocol_name, &run.base_branch)
        && git::trigger_ci(project.ci_provider.as_deref(), &repo_root, &run.protocol_name)
    {
        ctx.storage
            .append_event(
                protocol_run_id,
                None,
                EventKind::CiTriggered.as_str(),
                "CI triggered after planning push.",
                Some(json!({"branch": run.protocol_name})),
            )
            .await?;
    }

    Ok(())
}

/// Ensure step rows exist for every spec entry, building the spec from
/// the on-disk protocol files when the run does not carry one yet.
///
/// Validation errors block the run with one event per error and create
/// no rows. Returns the number of rows created.
pub async fn sync_step_runs_from_protocol(
    ctx: &AppContext,
    protocol_root: &Path,
    protocol_run_id: i64,
) -> HandlerResult<usize> {
    let run = ctx.storage.get_protocol_run(protocol_run_id).await?;
    let mut template = match run.template_config.clone() {
        Some(Value::Object(map)) => Value::Object(map),
        _ => json!({}),
    };

    let spec_value = match template.get(PROTOCOL_SPEC_KEY) {
        Some(spec) if !spec.is_null() => spec.clone(),
        _ => {
            let built = build_spec_from_protocol_files(protocol_root)?;
            let value = built.to_value()?;
            template[PROTOCOL_SPEC_KEY] = value.clone();
            ctx.storage
                .update_protocol_template(protocol_run_id, &template, run.template_source.as_deref())
                .await?;
            value
        }
    };
    let spec = ProtocolSpec::from_value(&spec_value)?;
    let spec_hash = protocol_spec_hash(&spec_value);

    let workspace = workspace_for(protocol_root);
    let errors = validate_protocol_spec(protocol_root, &spec, &workspace);
    if !errors.is_empty() {
        for error in &errors {
            ctx.storage
                .append_event(
                    protocol_run_id,
                    None,
                    EventKind::SpecValidationError.as_str(),
                    error,
                    Some(json!({
                        "protocol_root": protocol_root.display().to_string(),
                        "spec_hash": spec_hash,
                    })),
                )
                .await?;
        }
        set_spec_meta(&mut template, "invalid", &errors);
        ctx.storage
            .update_protocol_template(protocol_run_id, &template, run.template_source.as_deref())
            .await?;
        ctx.storage
            .update_protocol_status(protocol_run_id, ProtocolStatus::Blocked)
            .await?;
        return Ok(0);
    }
    set_spec_meta(&mut template, "valid", &[]);
    ctx.storage
        .update_protocol_template(protocol_run_id, &template, run.template_source.as_deref())
        .await?;

    let existing: HashSet<String> = ctx
        .storage
        .list_step_runs(protocol_run_id)
        .await?
        .into_iter()
        .map(|s| s.step_name)
        .collect();

    let mut created = 0;
    for (index, entry) in spec.steps.iter().enumerate() {
        if existing.contains(&entry.name) {
            continue;
        }
        let policy = entry
            .policies
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;
        ctx.storage
            .create_step_run(NewStepRun {
                protocol_run_id,
                step_index: index as i64,
                step_name: entry.name.clone(),
                step_type: StepType::infer(&entry.name),
                status: StepStatus::Pending,
                model: entry.model.clone(),
                engine_id: entry.engine_id.clone(),
                policy,
                summary: None,
            })
            .await?;
        created += 1;
    }
    Ok(created)
}

/// Record spec validation status on the template so the spec endpoint
/// can report it without re-validating.
fn set_spec_meta(template: &mut Value, status: &str, errors: &[String]) {
    template["spec_meta"] = json!({
        "validation_status": status,
        "errors": errors,
    });
}

/// Validation status recorded by the last planning pass, if any.
pub fn spec_validation_status(run: &ProtocolRun) -> Option<String> {
    run.template_config
        .as_ref()
        .and_then(|t| t.get("spec_meta"))
        .and_then(|m| m.get("validation_status"))
        .and_then(Value::as_str)
        .map(String::from)
}

fn write_protocol_files(protocol_root: &Path, artefact: &PlanningArtefact) -> std::io::Result<()> {
    std::fs::create_dir_all(protocol_root)?;
    std::fs::write(protocol_root.join("plan.md"), &artefact.plan)?;
    std::fs::write(protocol_root.join("context.md"), &artefact.context)?;
    for step in &artefact.steps {
        std::fs::write(protocol_root.join(&step.name), &step.content)?;
    }
    Ok(())
}

/// Markdown step files in the protocol root, sorted, reserved artefacts
/// excluded.
fn step_files(protocol_root: &Path) -> std::io::Result<Vec<std::path::PathBuf>> {
    let reserved = ["plan.md", "context.md", "log.md", "quality-report.md"];
    let mut files: Vec<_> = std::fs::read_dir(protocol_root)?
        .filter_map(std::result::Result::ok)
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "md"))
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| !reserved.contains(&name))
        })
        .collect();
    files.sort();
    Ok(files)
}

/// The workspace root is the parent of `.protocols/<name>`.
fn workspace_for(protocol_root: &Path) -> std::path::PathBuf {
    match protocol_root.parent() {
        Some(parent) if parent.file_name().is_some_and(|n| n == ".protocols") => parent
            .parent()
            .map_or_else(|| parent.to_path_buf(), Path::to_path_buf),
        Some(parent) => parent.to_path_buf(),
        None => protocol_root.to_path_buf(),
    }
}
