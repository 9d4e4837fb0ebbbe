//! Daemon configuration loaded from environment variables.
//!
//! All keys are prefixed `FLOWD_`, except the per-phase model defaults
//! which keep the `PROTOCOL_*_MODEL` names used by operator tooling.

use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
    #[error("invalid value for {key}: {value} (expected {expected})")]
    InvalidChoice {
        key: String,
        value: String,
        expected: &'static str,
    },
}

/// How token budget violations are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TokenBudgetMode {
    /// Exceeding the budget fails the step.
    #[default]
    Strict,
    /// Log and proceed.
    Warn,
    /// Budgets disabled.
    Off,
}

impl TokenBudgetMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Warn => "warn",
            Self::Off => "off",
        }
    }
}

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database URL; takes precedence over `db_path` when set.
    pub db_url: Option<String>,
    /// SQLite fallback path.
    pub db_path: PathBuf,
    pub environment: String,
    /// Bearer token guarding mutating HTTP endpoints.
    pub api_token: Option<String>,
    /// Enables the remote queue when set; absent means in-memory.
    pub redis_url: Option<String>,
    pub log_level: String,
    /// Shared secret for webhook verification.
    pub webhook_token: Option<String>,
    pub planning_model: Option<String>,
    pub decompose_model: Option<String>,
    pub exec_model: Option<String>,
    pub qa_model: Option<String>,
    pub max_tokens_per_step: Option<u64>,
    pub max_tokens_per_protocol: Option<u64>,
    pub token_budget_mode: TokenBudgetMode,
    /// Enqueue QA immediately after step execution.
    pub auto_qa_after_exec: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_url: None,
            db_path: PathBuf::from(".flowd.sqlite"),
            environment: "local".to_string(),
            api_token: None,
            redis_url: None,
            log_level: "info".to_string(),
            webhook_token: None,
            planning_model: None,
            decompose_model: None,
            exec_model: None,
            qa_model: None,
            max_tokens_per_step: None,
            max_tokens_per_protocol: None,
            token_budget_mode: TokenBudgetMode::Strict,
            auto_qa_after_exec: false,
        }
    }
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an injected lookup, so tests can drive
    /// it without touching process-global state.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        config.db_url = lookup("FLOWD_DB_URL");
        if let Some(path) = lookup("FLOWD_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }
        if let Some(env) = lookup("FLOWD_ENV") {
            config.environment = env;
        }
        config.api_token = lookup("FLOWD_API_TOKEN");
        config.redis_url = lookup("FLOWD_REDIS_URL");
        if let Some(level) = lookup("FLOWD_LOG_LEVEL") {
            config.log_level = level;
        }
        config.webhook_token = lookup("FLOWD_WEBHOOK_TOKEN");
        config.planning_model = lookup("PROTOCOL_PLANNING_MODEL");
        config.decompose_model = lookup("PROTOCOL_DECOMPOSE_MODEL");
        config.exec_model = lookup("PROTOCOL_EXEC_MODEL");
        config.qa_model = lookup("PROTOCOL_QA_MODEL");
        config.max_tokens_per_step = parse_opt_int(&lookup, "FLOWD_MAX_TOKENS_PER_STEP")?;
        config.max_tokens_per_protocol = parse_opt_int(&lookup, "FLOWD_MAX_TOKENS_PER_PROTOCOL")?;
        if let Some(mode) = lookup("FLOWD_TOKEN_BUDGET_MODE") {
            config.token_budget_mode = match mode.as_str() {
                "strict" => TokenBudgetMode::Strict,
                "warn" => TokenBudgetMode::Warn,
                "off" => TokenBudgetMode::Off,
                _ => {
                    return Err(ConfigError::InvalidChoice {
                        key: "FLOWD_TOKEN_BUDGET_MODE".to_string(),
                        value: mode,
                        expected: "strict|warn|off",
                    })
                }
            };
        }
        if let Some(raw) = lookup("FLOWD_AUTO_QA") {
            config.auto_qa_after_exec =
                matches!(raw.to_lowercase().as_str(), "true" | "1" | "yes" | "on");
        }

        Ok(config)
    }

    /// Effective token budget: the per-step limit wins over per-protocol.
    pub fn token_budget_limit(&self) -> Option<u64> {
        self.max_tokens_per_step.or(self.max_tokens_per_protocol)
    }

    /// Phase -> model mapping from the `PROTOCOL_*_MODEL` variables.
    pub fn default_models(&self) -> BTreeMap<String, String> {
        let mut models = BTreeMap::new();
        for (phase, model) in [
            ("planning", &self.planning_model),
            ("decompose", &self.decompose_model),
            ("exec", &self.exec_model),
            ("qa", &self.qa_model),
        ] {
            if let Some(model) = model {
                models.insert(phase.to_string(), model.clone());
            }
        }
        models
    }
}

fn parse_opt_int(
    lookup: impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<u64>, ConfigError> {
    match lookup(key) {
        Some(raw) if !raw.is_empty() => {
            raw.parse().map(Some).map_err(|_| ConfigError::InvalidInt {
                key: key.to_string(),
                value: raw,
            })
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_from<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |key| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| (*v).to_string())
        }
    }

    #[test]
    fn defaults_without_environment() {
        let config = Config::from_lookup(|_| None).unwrap();
        assert_eq!(config.db_path, PathBuf::from(".flowd.sqlite"));
        assert_eq!(config.environment, "local");
        assert_eq!(config.token_budget_mode, TokenBudgetMode::Strict);
        assert!(config.token_budget_limit().is_none());
        assert!(!config.auto_qa_after_exec);
    }

    #[test]
    fn reads_all_keys() {
        let pairs = [
            ("FLOWD_DB_PATH", "/var/lib/flowd/db.sqlite"),
            ("FLOWD_API_TOKEN", "tok"),
            ("FLOWD_REDIS_URL", "redis://localhost:6379"),
            ("FLOWD_WEBHOOK_TOKEN", "hook"),
            ("FLOWD_LOG_LEVEL", "debug"),
            ("FLOWD_MAX_TOKENS_PER_STEP", "1000"),
            ("FLOWD_TOKEN_BUDGET_MODE", "warn"),
            ("FLOWD_AUTO_QA", "true"),
            ("PROTOCOL_EXEC_MODEL", "codex-5.1"),
            ("PROTOCOL_QA_MODEL", "codex-qa"),
        ];
        let config = Config::from_lookup(lookup_from(&pairs)).unwrap();
        assert_eq!(config.db_path, PathBuf::from("/var/lib/flowd/db.sqlite"));
        assert_eq!(config.api_token.as_deref(), Some("tok"));
        assert_eq!(config.redis_url.as_deref(), Some("redis://localhost:6379"));
        assert_eq!(config.token_budget_mode, TokenBudgetMode::Warn);
        assert_eq!(config.token_budget_limit(), Some(1000));
        assert!(config.auto_qa_after_exec);
        let models = config.default_models();
        assert_eq!(models.get("exec").map(String::as_str), Some("codex-5.1"));
        assert_eq!(models.get("qa").map(String::as_str), Some("codex-qa"));
        assert!(!models.contains_key("planning"));
    }

    #[test]
    fn per_step_limit_wins_over_per_protocol() {
        let pairs = [
            ("FLOWD_MAX_TOKENS_PER_STEP", "100"),
            ("FLOWD_MAX_TOKENS_PER_PROTOCOL", "5000"),
        ];
        let config = Config::from_lookup(lookup_from(&pairs)).unwrap();
        assert_eq!(config.token_budget_limit(), Some(100));
    }

    #[test]
    fn invalid_int_is_an_error() {
        let pairs = [("FLOWD_MAX_TOKENS_PER_STEP", "lots")];
        assert!(matches!(
            Config::from_lookup(lookup_from(&pairs)),
            Err(ConfigError::InvalidInt { .. })
        ));
    }

    #[test]
    fn invalid_budget_mode_is_an_error() {
        let pairs = [("FLOWD_TOKEN_BUDGET_MODE", "maybe")];
        assert!(matches!(
            Config::from_lookup(lookup_from(&pairs)),
            Err(ConfigError::InvalidChoice { .. })
        ));
    }
}
