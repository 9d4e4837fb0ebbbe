//! Webhook reducer: folds inbound CI/PR notifications into state
//! transitions.
//!
//! Two provider adapters share the entry point: GitHub verifies an
//! HMAC-SHA256 body signature, GitLab a literal header token. Folding is
//! idempotent, and a later success never overwrites an already-failed
//! step; recovery from CI failure is an explicit operator action.

use flow_core::types::{ProtocolStatus, StepStatus};
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;
use tracing::{info, warn};

use crate::storage::{StepUpdate, StorageError};
use crate::{AppContext, HandlerError};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("invalid webhook signature")]
    Unauthorized,
    #[error("protocol run not found for webhook")]
    RunNotFound,
    #[error(transparent)]
    Handler(#[from] HandlerError),
}

impl From<StorageError> for WebhookError {
    fn from(e: StorageError) -> Self {
        Self::Handler(HandlerError::Storage(e))
    }
}

/// Webhook provider adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    GitHub,
    GitLab,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GitHub => "github",
            Self::GitLab => "gitlab",
        }
    }
}

/// One inbound delivery, already split out of the HTTP request.
#[derive(Debug, Clone, Default)]
pub struct WebhookDelivery {
    pub body: Vec<u8>,
    /// `X-GitHub-Event` / `X-Gitlab-Event` header.
    pub event_type: Option<String>,
    /// `X-Hub-Signature-256` (GitHub) or `X-Gitlab-Token` (GitLab).
    pub signature: Option<String>,
    /// Explicit run association from the query string.
    pub protocol_run_id: Option<i64>,
}

/// Verify a GitHub `sha256=<hex>` signature over the raw body.
/// Comparison is constant-time via the MAC verifier.
pub fn verify_github_signature(secret: &str, body: &[u8], signature_header: &str) -> bool {
    let hex_digest = signature_header
        .strip_prefix("sha256=")
        .unwrap_or(signature_header);
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Fold one delivery into step/protocol state. Authentication failures
/// are counted but never journaled.
pub async fn handle_webhook(
    ctx: &AppContext,
    provider: Provider,
    delivery: WebhookDelivery,
) -> Result<(), WebhookError> {
    if let Some(token) = &ctx.config.webhook_token {
        let authorized = match provider {
            Provider::GitHub => delivery
                .signature
                .as_deref()
                .is_some_and(|sig| verify_github_signature(token, &delivery.body, sig)),
            Provider::GitLab => delivery.signature.as_deref() == Some(token.as_str()),
        };
        if !authorized {
            ctx.metrics.inc_webhook(provider.as_str(), "unauthorized");
            warn!(provider = provider.as_str(), "webhook rejected");
            return Err(WebhookError::Unauthorized);
        }
    }
    ctx.metrics.inc_webhook(provider.as_str(), "received");

    let payload: Value = serde_json::from_slice(&delivery.body).unwrap_or(Value::Null);
    let (branch, verdict, message) = match provider {
        Provider::GitHub => {
            let conclusion = payload
                .pointer("/workflow_run/conclusion")
                .and_then(Value::as_str)
                .unwrap_or("");
            let branch = payload
                .pointer("/workflow_run/head_branch")
                .and_then(Value::as_str)
                .or_else(|| payload.get("ref").and_then(Value::as_str))
                .unwrap_or("");
            let action = payload.get("action").and_then(Value::as_str).unwrap_or("");
            let event_type = delivery.event_type.as_deref().unwrap_or("github");
            let verdict = match conclusion {
                "success" | "neutral" => CiVerdict::Passed,
                "failure" | "timed_out" | "cancelled" => CiVerdict::Failed,
                _ => CiVerdict::Ignored,
            };
            let message = format!(
                "GitHub webhook {event_type} action={action} branch={branch} conclusion={conclusion}"
            );
            (branch.to_string(), verdict, message)
        }
        Provider::GitLab => {
            let status = payload
                .pointer("/object_attributes/status")
                .and_then(Value::as_str)
                .unwrap_or("");
            let reference = payload.get("ref").and_then(Value::as_str).unwrap_or("");
            let event_type = delivery.event_type.as_deref().unwrap_or("gitlab");
            let verdict = match status {
                "success" | "passed" => CiVerdict::Passed,
                "failed" | "canceled" => CiVerdict::Failed,
                _ => CiVerdict::Ignored,
            };
            let message = format!("GitLab webhook {event_type} status={status} ref={reference}");
            (reference.to_string(), verdict, message)
        }
    };

    let run = match delivery.protocol_run_id {
        Some(id) => match ctx.storage.get_protocol_run(id).await {
            Ok(run) => Some(run),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        },
        None => ctx.storage.find_protocol_run_by_branch(&branch).await?,
    };
    let Some(run) = run else {
        return Err(WebhookError::RunNotFound);
    };

    let step = ctx.storage.latest_step_run(run.id).await?;
    ctx.storage
        .append_event(
            run.id,
            step.as_ref().map(|s| s.id),
            delivery
                .event_type
                .as_deref()
                .unwrap_or(provider.as_str()),
            &message,
            None,
        )
        .await?;

    match (verdict, step) {
        (CiVerdict::Passed, Some(step)) => {
            // A later success never overwrites a recorded failure.
            if step.status != StepStatus::Failed {
                ctx.storage
                    .update_step_status(
                        step.id,
                        StepStatus::Completed,
                        StepUpdate {
                            summary: Some("CI passed".to_string()),
                            ..StepUpdate::default()
                        },
                    )
                    .await?;
            }
        }
        (CiVerdict::Failed, Some(step)) => {
            ctx.storage
                .update_step_status(
                    step.id,
                    StepStatus::Failed,
                    StepUpdate {
                        summary: Some("CI failed".to_string()),
                        ..StepUpdate::default()
                    },
                )
                .await?;
            ctx.storage
                .update_protocol_status(run.id, ProtocolStatus::Blocked)
                .await?;
        }
        _ => {}
    }

    info!(
        provider = provider.as_str(),
        protocol_run_id = run.id,
        branch = %branch,
        "webhook folded"
    );
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CiVerdict {
    Passed,
    Failed,
    Ignored,
}
