use std::time::Duration;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything that can go wrong while serving one aggregation request.
///
/// Variants other than `MissingParameter`, `Config` and `Internal` are
/// scope-local: the collector turns them into failure records instead of
/// failing the request.
#[derive(Debug, Error)]
pub enum Error {
    #[error("missing required parameter: {0}")]
    MissingParameter(String),

    #[error("authentication failed for {scope}: {message}")]
    Auth { scope: String, message: String },

    /// The identity platform answered and refused this app in this tenant,
    /// e.g. no service principal exists for it there.
    #[error("authentication refused for {scope}: token endpoint returned {code}")]
    GrantRefused { scope: String, code: String },

    #[error("{operation} failed: {message}")]
    Fetch { operation: String, message: String },

    #[error("{service} is rate limiting requests; gave up after {attempts} attempts")]
    RateLimited { service: String, attempts: u32 },

    #[error("malformed response from {operation}: {message}")]
    Malformed { operation: String, message: String },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable machine-readable category, reported alongside each failure.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::MissingParameter(_) => "missing_parameter",
            Error::Auth { .. } | Error::GrantRefused { .. } => "auth",
            Error::Fetch { .. } => "fetch",
            Error::RateLimited { .. } => "rate_limited",
            Error::Malformed { .. } => "malformed",
            Error::Timeout(_) => "timeout",
            Error::Config(_) => "config",
            Error::Internal(_) => "internal",
        }
    }

    /// Whether the error is recorded per scope rather than failing the request.
    pub fn is_scope_local(&self) -> bool {
        !matches!(
            self,
            Error::MissingParameter(_) | Error::Config(_) | Error::Internal(_)
        )
    }

    /// A definitive refusal, as opposed to a network or transient failure.
    pub fn is_grant_refused(&self) -> bool {
        matches!(self, Error::GrantRefused { .. })
    }

    pub fn auth(scope: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Auth {
            scope: scope.into(),
            message: message.into(),
        }
    }

    pub fn fetch(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Fetch {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn malformed(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Malformed {
            operation: operation.into(),
            message: message.into(),
        }
    }
}
