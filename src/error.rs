//! Unified security error model.
//! Every gate, resolver and admin operation reports one of these synchronously; nothing here retries.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SecurityError {
    /// No roles, operation not permitted, inactive account, bad credentials or an invalid token.
    #[error("{message}")]
    AccessDenied { message: String },

    #[error("invalid security resource '{resource}'")]
    InvalidResource {
        resource: String,
        #[source]
        source: anyhow::Error,
    },

    /// Definition-time problems (schema custom attributes, policy bound onto a composite index, role cycles).
    #[error("{message}")]
    Configuration { message: String },

    /// Never carries the predicate text; the cause chain stays available for diagnostics.
    #[error("Cannot execute security predicate")]
    PredicateEvaluation {
        #[source]
        source: anyhow::Error,
    },

    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("security catalog storage failure")]
    Storage {
        #[source]
        source: anyhow::Error,
    },
}

pub type SecurityResult<T> = Result<T, SecurityError>;

impl SecurityError {
    pub fn access_denied<S: Into<String>>(msg: S) -> Self { SecurityError::AccessDenied { message: msg.into() } }
    pub fn configuration<S: Into<String>>(msg: S) -> Self { SecurityError::Configuration { message: msg.into() } }
    pub fn not_found<S: Into<String>>(kind: &'static str, name: S) -> Self { SecurityError::NotFound { kind, name: name.into() } }
    pub fn invalid_resource<S: Into<String>>(resource: S, source: anyhow::Error) -> Self {
        SecurityError::InvalidResource { resource: resource.into(), source }
    }
    pub fn predicate(source: anyhow::Error) -> Self { SecurityError::PredicateEvaluation { source } }
    pub fn storage(source: anyhow::Error) -> Self { SecurityError::Storage { source } }

    pub fn code_str(&self) -> &'static str {
        match self {
            SecurityError::AccessDenied { .. } => "access_denied",
            SecurityError::InvalidResource { .. } => "invalid_resource",
            SecurityError::Configuration { .. } => "configuration",
            SecurityError::PredicateEvaluation { .. } => "predicate_evaluation",
            SecurityError::NotFound { .. } => "not_found",
            SecurityError::Storage { .. } => "storage",
        }
    }

    pub fn is_access_denied(&self) -> bool { matches!(self, SecurityError::AccessDenied { .. }) }
}

impl From<anyhow::Error> for SecurityError {
    fn from(err: anyhow::Error) -> Self {
        // Opaque collaborator failures surface as evaluation failures
        SecurityError::PredicateEvaluation { source: err }
    }
}

impl From<serde_json::Error> for SecurityError {
    fn from(err: serde_json::Error) -> Self { SecurityError::Storage { source: err.into() } }
}
