use thiserror::Error;

use crate::orchestrator::DeployPhase;

#[derive(Error, Debug)]
pub enum RotorError {
    #[error("Account not found: {0}")]
    NotFound(String),
    #[error("Credential error for '{username}': {reason}")]
    Credential { username: String, reason: String },
    #[error("Profile operation failed: {0}")]
    Profile(String),
    #[error("Account '{username}' has insufficient balance (${balance:.2} < ${threshold:.2})")]
    InsufficientBalance {
        username: String,
        balance: f64,
        threshold: f64,
    },
    #[error("No available accounts with sufficient balance")]
    NoAvailableAccount,
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("{phase} failed with exit code {code}: {stderr}")]
    DeployFailed {
        phase: DeployPhase,
        code: i32,
        stderr: String,
    },
    #[error("Failed to run platform command: {0}")]
    Command(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RotorError {
    /// Timeouts are distinguished from hard failures so callers may choose to retry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, RotorError::Timeout(_))
    }

    /// Errors that make one account unusable for the current attempt without saying
    /// anything about the rest of the pool. Failover moves on to the next candidate
    /// for these and aborts on everything else.
    pub fn is_account_scoped(&self) -> bool {
        matches!(
            self,
            RotorError::Credential { .. }
                | RotorError::Profile(_)
                | RotorError::InsufficientBalance { .. }
                | RotorError::Conflict(_)
                | RotorError::Timeout(_)
                | RotorError::DeployFailed { .. }
        )
    }
}

pub type Result<T, E = RotorError> = std::result::Result<T, E>;
