//! Protocol spec model: schema, validation, and content-addressed hashing.
//!
//! The spec is embedded in a run's `template_config` under
//! [`PROTOCOL_SPEC_KEY`]. The store treats it as an opaque JSON map; this
//! module is the use site that decodes it into typed structs.

use crate::policy::PolicyDescriptor;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Well-known key inside `template_config` holding the spec.
pub const PROTOCOL_SPEC_KEY: &str = "protocol_spec";

/// Protocol artefacts that are not step files.
const RESERVED_FILES: &[&str] = &["plan.md", "context.md", "log.md", "quality-report.md"];

#[derive(Debug, Error)]
pub enum SpecError {
    #[error("spec is not a JSON object")]
    NotAnObject,
    #[error("failed to decode spec: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("failed to read protocol root {path:?}: {source}")]
    ReadDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// QA gating policy for a step. Absent means full QA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QaPolicy {
    Skip,
    #[default]
    Full,
}

/// Per-step QA configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QaSpec {
    pub policy: Option<QaPolicy>,
    pub model: Option<String>,
    pub engine_id: Option<String>,
    /// Prompt path resolved against protocol root then workspace.
    pub prompt: Option<String>,
}

/// Declared output paths for a step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputsSpec {
    /// Primary output, resolved against the protocol root.
    pub protocol: Option<String>,
    /// Labelled auxiliary outputs, resolved workspace-relative.
    pub aux: Option<BTreeMap<String, String>>,
}

/// One step declaration within a protocol spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    /// Stable identifier within the spec; trigger policies address steps by it.
    pub id: String,
    /// File name within the protocol root.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<OutputsSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qa: Option<QaSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policies: Option<Vec<PolicyDescriptor>>,
}

impl StepSpec {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            engine_id: None,
            model: None,
            prompt_ref: None,
            outputs: None,
            qa: None,
            policies: None,
        }
    }

    pub fn qa_policy(&self) -> QaPolicy {
        self.qa
            .as_ref()
            .and_then(|qa| qa.policy)
            .unwrap_or_default()
    }
}

/// The declarative protocol document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProtocolSpec {
    #[serde(default)]
    pub steps: Vec<StepSpec>,
}

impl ProtocolSpec {
    pub fn to_value(&self) -> Result<Value, SpecError> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_value(value: &Value) -> Result<Self, SpecError> {
        if !value.is_object() {
            return Err(SpecError::NotAnObject);
        }
        Ok(serde_json::from_value(value.clone())?)
    }

    pub fn step_by_name(&self, name: &str) -> Option<&StepSpec> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn step_by_id(&self, id: &str) -> Option<&StepSpec> {
        self.steps.iter().find(|s| s.id == id)
    }
}

// --- Content-addressed hashing ---

/// Serialize a JSON value with object keys sorted recursively.
///
/// Hashing must not depend on map insertion order, so the canonical form
/// rebuilds every object as a sorted map before serializing.
fn canonical_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), canonical_value(v)))
                .collect();
            // BTreeMap serializes in key order.
            serde_json::to_value(sorted).unwrap_or(Value::Null)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical_value).collect()),
        other => other.clone(),
    }
}

/// Full SHA-256 hex digest of the canonical serialisation.
pub fn protocol_spec_hash_full(spec: &Value) -> String {
    let canonical = canonical_value(spec);
    let serialized = serde_json::to_string(&canonical).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(serialized.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Short-form spec hash: first 12 hex characters of the SHA-256 digest.
pub fn protocol_spec_hash(spec: &Value) -> String {
    let mut full = protocol_spec_hash_full(spec);
    full.truncate(12);
    full
}

/// Extract and hash the spec stored on a run's `template_config`.
pub fn template_spec_hash(template_config: Option<&Value>) -> Option<String> {
    let spec = template_config?.get(PROTOCOL_SPEC_KEY)?;
    if spec.is_null() {
        return None;
    }
    Some(protocol_spec_hash(spec))
}

// --- Lookup helpers ---

/// Find the spec entry for a step by file name. Returns `None` (never an
/// error) when the template, the spec, or the entry is missing so callers
/// can fall back to legacy defaults.
pub fn get_step_spec(template_config: Option<&Value>, step_name: &str) -> Option<StepSpec> {
    let spec = template_config?.get(PROTOCOL_SPEC_KEY)?;
    let spec = ProtocolSpec::from_value(spec).ok()?;
    spec.step_by_name(step_name).cloned()
}

// --- Path resolution and validation ---

/// Normalize a path lexically: fold `.` and apply `..` without touching
/// the filesystem, so validation works on not-yet-created outputs.
fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    // Escaped above the anchor; keep the component so the
                    // containment check fails.
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn is_within(candidate: &Path, root: &Path) -> bool {
    lexical_normalize(candidate).starts_with(lexical_normalize(root))
}

/// Resolve a spec-declared path against the protocol root, falling back to
/// the workspace when the protocol-root candidate does not exist on disk.
pub fn resolve_spec_path(reference: &str, protocol_root: &Path, workspace: &Path) -> PathBuf {
    let reference = Path::new(reference);
    if reference.is_absolute() {
        return reference.to_path_buf();
    }
    let under_root = protocol_root.join(reference);
    if under_root.exists() {
        return under_root;
    }
    let under_workspace = workspace.join(reference);
    if under_workspace.exists() {
        return under_workspace;
    }
    under_root
}

fn check_contained(
    reference: &str,
    kind: &str,
    step_name: &str,
    protocol_root: &Path,
    workspace: &Path,
    errors: &mut Vec<String>,
) {
    let path = Path::new(reference);
    let candidate = if path.is_absolute() {
        path.to_path_buf()
    } else {
        protocol_root.join(path)
    };
    let workspace_candidate = if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace.join(path)
    };
    if !is_within(&candidate, protocol_root) && !is_within(&workspace_candidate, workspace) {
        errors.push(format!(
            "step {step_name}: {kind} path {reference:?} escapes the protocol root and workspace"
        ));
    }
}

/// Validate every path referenced by one step spec. Returns one error
/// string per offending path.
pub fn validate_step_spec_paths(
    protocol_root: &Path,
    step: &StepSpec,
    workspace: &Path,
) -> Vec<String> {
    let mut errors = Vec::new();
    if let Some(prompt_ref) = &step.prompt_ref {
        check_contained(
            prompt_ref,
            "prompt_ref",
            &step.name,
            protocol_root,
            workspace,
            &mut errors,
        );
    }
    if let Some(outputs) = &step.outputs {
        if let Some(protocol) = &outputs.protocol {
            check_contained(
                protocol,
                "outputs.protocol",
                &step.name,
                protocol_root,
                workspace,
                &mut errors,
            );
        }
        if let Some(aux) = &outputs.aux {
            for (label, path) in aux {
                check_contained(
                    path,
                    &format!("outputs.aux.{label}"),
                    &step.name,
                    protocol_root,
                    workspace,
                    &mut errors,
                );
            }
        }
    }
    if let Some(qa) = &step.qa {
        if let Some(prompt) = &qa.prompt {
            check_contained(
                prompt,
                "qa.prompt",
                &step.name,
                protocol_root,
                workspace,
                &mut errors,
            );
        }
    }
    errors
}

/// Validate the whole spec: unique step ids and names, contained paths.
pub fn validate_protocol_spec(
    protocol_root: &Path,
    spec: &ProtocolSpec,
    workspace: &Path,
) -> Vec<String> {
    let mut errors = Vec::new();
    let mut seen_ids = std::collections::HashSet::new();
    let mut seen_names = std::collections::HashSet::new();
    for step in &spec.steps {
        if !seen_ids.insert(step.id.as_str()) {
            errors.push(format!("duplicate step id {:?}", step.id));
        }
        if !seen_names.insert(step.name.as_str()) {
            errors.push(format!("duplicate step name {:?}", step.name));
        }
        errors.extend(validate_step_spec_paths(protocol_root, step, workspace));
    }
    errors
}

/// Resolved output destinations for a step execution.
#[derive(Debug, Clone)]
pub struct ResolvedOutputs {
    pub protocol: PathBuf,
    pub aux: BTreeMap<String, PathBuf>,
}

/// Resolve the output map for a step: spec-declared `outputs.protocol` and
/// `outputs.aux.<label>` override the provided defaults. The primary path
/// resolves against `base` (the protocol root); aux paths resolve against
/// the workspace when `prefer_workspace` is set, matching the alternate
/// workspace layout.
pub fn resolve_outputs_map(
    outputs: Option<&OutputsSpec>,
    base: &Path,
    workspace: &Path,
    default_protocol: PathBuf,
    default_aux: BTreeMap<String, PathBuf>,
    prefer_workspace: bool,
) -> ResolvedOutputs {
    let mut protocol = default_protocol;
    let mut aux = default_aux;

    if let Some(outputs) = outputs {
        if let Some(declared) = &outputs.protocol {
            let path = Path::new(declared);
            protocol = if path.is_absolute() {
                path.to_path_buf()
            } else {
                base.join(path)
            };
        }
        if let Some(declared_aux) = &outputs.aux {
            for (label, declared) in declared_aux {
                let path = Path::new(declared);
                let resolved = if path.is_absolute() {
                    path.to_path_buf()
                } else if prefer_workspace {
                    workspace.join(path)
                } else {
                    base.join(path)
                };
                aux.insert(label.clone(), resolved);
            }
        }
    }

    ResolvedOutputs { protocol, aux }
}

// --- Spec construction from on-disk protocol files ---

/// Build a spec from the markdown step files in a protocol directory.
///
/// Files sort by name; reserved artefacts (plan, context, log, QA report)
/// are skipped. The step id is the file stem, the name the full file name.
pub fn build_spec_from_protocol_files(protocol_root: &Path) -> Result<ProtocolSpec, SpecError> {
    let entries = std::fs::read_dir(protocol_root).map_err(|source| SpecError::ReadDir {
        path: protocol_root.to_path_buf(),
        source,
    })?;

    let mut names: Vec<String> = entries
        .filter_map(Result::ok)
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "md"))
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|name| !RESERVED_FILES.contains(&name.as_str()))
        .collect();
    names.sort();

    let steps = names
        .into_iter()
        .map(|name| {
            let id = Path::new(&name)
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or(&name)
                .to_string();
            StepSpec::new(id, name)
        })
        .collect();

    Ok(ProtocolSpec { steps })
}
