//! Prompt fingerprints and prompt assembly.
//!
//! Fingerprints let events record which prompt revision produced an
//! artefact without storing the text itself.

use sha2::{Digest, Sha256};
use std::path::Path;

/// Stable fingerprint for prompt text: SHA-256, short form keeps event
/// metadata compact.
pub fn fingerprint_text(text: &str, short: bool) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    if short {
        digest[..12].to_string()
    } else {
        digest
    }
}

/// Hash the contents of a prompt file. Returns `"missing"` when the file
/// is absent so callers record the absence instead of failing the run.
pub fn fingerprint_file(path: &Path, short: bool) -> String {
    match std::fs::read(path) {
        Ok(data) => {
            let mut hasher = Sha256::new();
            hasher.update(&data);
            let digest = format!("{:x}", hasher.finalize());
            if short {
                digest[..12].to_string()
            } else {
                digest
            }
        }
        Err(_) => "missing".to_string(),
    }
}

/// Fingerprint a prompt file when a path is known, `"unknown"` otherwise.
pub fn prompt_version(path: Option<&Path>) -> String {
    match path {
        Some(path) => fingerprint_file(path, true),
        None => "unknown".to_string(),
    }
}

// --- Prompt assembly ---

/// Planning prompt: protocol naming, task description, template section.
pub fn planning_prompt(
    protocol_name: &str,
    protocol_number: &str,
    description: &str,
    templates_section: &str,
) -> String {
    format!(
        "You are a protocol planner. Produce a JSON planning artefact for \
         protocol {protocol_name} (number {protocol_number}).\n\n\
         Task description:\n{description}\n\n\
         Protocol templates:\n{templates_section}\n"
    )
}

/// Execution prompt for one step: the plan plus the step file content.
pub fn execute_step_prompt(
    protocol_name: &str,
    protocol_number: &str,
    plan: &str,
    step_file_name: &str,
    step_content: &str,
) -> String {
    format!(
        "You are executing protocol {protocol_name} (number {protocol_number}).\n\n\
         plan.md:\n{plan}\n\n\
         Current step ({step_file_name}):\n{step_content}\n\n\
         Carry out this step and emit the updated step artefact on stdout."
    )
}

/// Decompose prompt: rewrite a step file into finer-grained tasks.
pub fn decompose_step_prompt(
    protocol_name: &str,
    protocol_number: &str,
    plan: &str,
    step_file_name: &str,
    step_content: &str,
) -> String {
    format!(
        "You are decomposing a step of protocol {protocol_name} (number \
         {protocol_number}).\n\n\
         plan.md:\n{plan}\n\n\
         Step file ({step_file_name}):\n{step_content}\n\n\
         Rewrite the step file into concrete sub-tasks. Output the full \
         replacement file content."
    )
}

/// QA prompt body built from the protocol root context plus the step file.
pub fn qa_prompt_body(
    plan: &str,
    context: &str,
    log: &str,
    step_file_name: &str,
    step_content: &str,
    git_status: &str,
    last_commit: &str,
) -> String {
    format!(
        "You are a QA orchestrator. Validate the current protocol step. \
         Follow the checklist and output Markdown only (no fences).\n\n\
         plan.md:\n{plan}\n\n\
         context.md:\n{context}\n\n\
         log.md (may be empty):\n{log}\n\n\
         Step file ({step_file_name}):\n{step_content}\n\n\
         Git status (porcelain):\n{git_status}\n\n\
         Latest commit message:\n{last_commit}\n\n\
         Use the format from the quality-validator prompt. If any blocking \
         issue, verdict = FAIL."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn fingerprint_is_stable_and_short() {
        let a = fingerprint_text("hello", true);
        let b = fingerprint_text("hello", true);
        assert_eq!(a, b);
        assert_eq!(a.len(), 12);
        assert_eq!(fingerprint_text("hello", false).len(), 64);
        assert_ne!(a, fingerprint_text("world", true));
    }

    #[test]
    fn missing_file_fingerprints_as_missing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("prompt.md");
        assert_eq!(fingerprint_file(&path, true), "missing");
        std::fs::write(&path, "content").unwrap();
        assert_eq!(fingerprint_file(&path, true).len(), 12);
    }

    #[test]
    fn prompt_version_handles_unknown() {
        assert_eq!(prompt_version(None), "unknown");
    }

    #[test]
    fn exec_prompt_embeds_plan_and_step() {
        let prompt = execute_step_prompt("0001-demo", "0001", "the plan", "01-build.md", "do it");
        assert!(prompt.contains("0001-demo"));
        assert!(prompt.contains("the plan"));
        assert!(prompt.contains("01-build.md"));
        assert!(prompt.contains("do it"));
    }

    #[test]
    fn qa_prompt_mentions_verdict_rule() {
        let prompt = qa_prompt_body("p", "c", "", "01.md", "s", "", "(no commits yet)");
        assert!(prompt.contains("verdict = FAIL"));
    }
}
