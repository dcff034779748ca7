//! Application error taxonomy.
//!
//! Each variant has a prescribed propagation: validation, not-found and
//! conflict surface synchronously to the caller; transient upstream errors
//! are retried with bounded backoff; permanent upstream errors fail the
//! current attempt terminally; cancellation is not a failure and is
//! finalized as such by the job runner.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("not found: {resource} '{id}'")]
    NotFound { resource: &'static str, id: String },

    #[error("conflict: {message}")]
    Conflict { message: String },

    /// Timeouts, 5xx, DNS and TLS failures: retry with backoff.
    #[error("transient upstream error ({host}): {message}")]
    UpstreamTransient { host: String, message: String },

    /// 4xx and parse errors: retrying will not help.
    #[error("permanent upstream error ({host}): {message}")]
    UpstreamPermanent { host: String, message: String },

    /// Circuit breaker refused the request without touching the host.
    #[error("circuit open for host {host}")]
    CircuitOpen { host: String },

    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("sandbox error: {0}")]
    Sandbox(#[from] sandbox_fs::SandboxError),

    #[error("internal error: {message}")]
    Internal { message: String },

    /// Cooperative cancellation. Never logged as an error.
    #[error("operation cancelled")]
    Cancelled,
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn not_found(resource: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource,
            id: id.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn upstream_transient(host: impl Into<String>, message: impl Into<String>) -> Self {
        Self::UpstreamTransient {
            host: host.into(),
            message: message.into(),
        }
    }

    pub fn upstream_permanent(host: impl Into<String>, message: impl Into<String>) -> Self {
        Self::UpstreamPermanent {
            host: host.into(),
            message: message.into(),
        }
    }

    /// Whether the error is worth another attempt at the job level.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::UpstreamTransient { .. } | Self::CircuitOpen { .. } | Self::Database(_)
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(AppError::upstream_transient("host", "timeout").is_retryable());
        assert!(!AppError::upstream_permanent("host", "404").is_retryable());
        assert!(!AppError::validation("bad expression").is_retryable());
        assert!(!AppError::Cancelled.is_retryable());
    }
}
