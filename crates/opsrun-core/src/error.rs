use crate::retry::CallError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OpsError {
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("invalid tag filter '{expression}': {reason}")]
    InvalidTagFilter { expression: String, reason: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    #[error("invalid transition from {from} to {to}: {reason}")]
    InvalidTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("ledger write left {unprocessed} item(s) unprocessed after {attempts} attempt(s)")]
    PartialLedgerWrite { unprocessed: usize, attempts: u32 },

    #[error("instance {instance} did not complete within {timeout_minutes} minute(s)")]
    CompletionTimeout {
        instance: String,
        timeout_minutes: u32,
    },

    #[error("ledger error: {0}")]
    Ledger(String),

    #[error(transparent)]
    Remote(#[from] CallError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl OpsError {
    pub(crate) fn cron(expression: &str, reason: impl Into<String>) -> Self {
        OpsError::InvalidCron {
            expression: expression.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn tag_filter(expression: &str, reason: impl Into<String>) -> Self {
        OpsError::InvalidTagFilter {
            expression: expression.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, OpsError>;
