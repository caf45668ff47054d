//! Typed error taxonomy shared across the gateway core.
//!
//! Handlers never leak raw backend messages; everything that crosses a
//! process boundary — HTTP response, queue nack decision, webhook failure
//! payload — is mapped from this enum rather than formatted ad hoc.

use thiserror::Error;

/// The seven error classes from the gateway's error handling design.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("auth: {0}")]
    Auth(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("external dependency failed: {0}")]
    External(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Validation(_) => "VALIDATION_ERROR",
            GatewayError::Auth(_) => "AUTH_ERROR",
            GatewayError::Conflict(_) => "CONFLICT",
            GatewayError::NotFound(_) => "NOT_FOUND",
            GatewayError::RateLimited { .. } => "RATE_LIMITED",
            GatewayError::External(_) => "EXTERNAL_ERROR",
            GatewayError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            GatewayError::Validation(_) => 422,
            GatewayError::Auth(_) => 401,
            GatewayError::Conflict(_) => 409,
            GatewayError::NotFound(_) => 404,
            GatewayError::RateLimited { .. } => 429,
            GatewayError::External(_) => 502,
            GatewayError::Internal(_) => 500,
        }
    }

    /// External errors are the only class retried by Queue Bus handlers;
    /// everything else is terminal per §7 propagation policy.
    pub fn retryable(&self) -> bool {
        matches!(self, GatewayError::External(_))
    }
}

impl From<sqlx::Error> for GatewayError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => GatewayError::NotFound("row not found".into()),
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                GatewayError::Conflict(format!("unique constraint violated: {db_err}"))
            }
            other => GatewayError::Internal(format!("database error: {other}")),
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        GatewayError::External(format!("http transport error: {e}"))
    }
}

impl From<lapin::Error> for GatewayError {
    fn from(e: lapin::Error) -> Self {
        GatewayError::External(format!("broker error: {e}"))
    }
}
