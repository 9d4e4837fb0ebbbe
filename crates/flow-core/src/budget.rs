//! Token estimation and budget enforcement.

use crate::config::TokenBudgetMode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BudgetError {
    #[error(
        "estimated prompt tokens ({estimated}) exceed configured limit ({limit}) for {context}"
    )]
    Exceeded {
        estimated: u64,
        limit: u64,
        context: String,
    },
}

/// Rough token estimator: four characters per token, rounded up, never
/// below one.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() as u64).div_ceil(4).max(1)
}

/// Enforce a soft token budget before invoking an engine.
///
/// Strict mode errors when the estimate exceeds the limit; warn logs and
/// proceeds; off skips the check entirely. Returns the estimate either
/// way so callers can record it in event metadata.
pub fn enforce_token_budget(
    prompt: &str,
    limit: Option<u64>,
    context: &str,
    mode: TokenBudgetMode,
) -> Result<u64, BudgetError> {
    let estimated = estimate_tokens(prompt);
    let Some(limit) = limit else {
        return Ok(estimated);
    };
    if mode == TokenBudgetMode::Off {
        return Ok(estimated);
    }
    if estimated > limit {
        if mode == TokenBudgetMode::Warn {
            eprintln!("Warning: token budget exceeded for {context}: {estimated} > {limit}");
            return Ok(estimated);
        }
        return Err(BudgetError::Exceeded {
            estimated,
            limit,
            context: context.to_string(),
        });
    }
    Ok(estimated)
}
