pub mod budget;
pub mod config;
pub mod events;
pub mod policy;
pub mod prompt;
pub mod spec;
pub mod types;

pub use budget::{enforce_token_budget, estimate_tokens, BudgetError};
pub use config::{Config, ConfigError, TokenBudgetMode};
pub use events::EventKind;
pub use policy::{
    decode_policies, LoopAction, PolicyDecision, PolicyDescriptor, PolicyReason,
};
pub use spec::{
    build_spec_from_protocol_files, get_step_spec, protocol_spec_hash, resolve_outputs_map,
    resolve_spec_path, template_spec_hash, validate_protocol_spec, validate_step_spec_paths,
    OutputsSpec, ProtocolSpec, QaPolicy, QaSpec, ResolvedOutputs, SpecError, StepSpec,
    PROTOCOL_SPEC_KEY,
};
pub use types::{
    Event, Project, ProtocolRun, ProtocolStatus, StepRun, StepStatus, StepType,
};
