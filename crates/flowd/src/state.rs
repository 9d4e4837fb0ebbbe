//! Terminal-state propagation for protocol runs.

use flow_core::events::EventKind;
use flow_core::types::ProtocolStatus;
use tracing::info;

use crate::{AppContext, HandlerResult};

/// Close out a protocol run once every step run is in the
/// terminal-success set (`completed`, `cancelled`). The predicate is
/// vacuously true for zero steps, so an empty protocol completes on the
/// first check after planning. This is the single choke point that
/// transitions a run to `completed`.
///
/// Returns whether the run was transitioned.
pub async fn maybe_complete_protocol(ctx: &AppContext, protocol_run_id: i64) -> HandlerResult<bool> {
    let run = ctx.storage.get_protocol_run(protocol_run_id).await?;
    if run.status.is_terminal() {
        return Ok(false);
    }

    let steps = ctx.storage.list_step_runs(protocol_run_id).await?;
    if steps.iter().any(|s| !s.status.is_terminal_success()) {
        return Ok(false);
    }

    ctx.storage
        .update_protocol_status(protocol_run_id, ProtocolStatus::Completed)
        .await?;
    ctx.storage
        .append_event(
            protocol_run_id,
            None,
            EventKind::ProtocolCompleted.as_str(),
            "All steps completed; protocol closed.",
            None,
        )
        .await?;
    info!(protocol_run_id, "protocol completed");
    Ok(true)
}
