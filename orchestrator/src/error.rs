//! Error taxonomy shared by the compiler, registry, orchestrator and API.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// What kind of entity a `NotFound` refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Task,
    Server,
    Rule,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Server => "server",
            Self::Rule => "rule",
        }
    }
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// A rule record could not be compiled
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    #[error("{} not found: {id}", kind.as_str())]
    NotFound { kind: EntityKind, id: String },

    /// A rebuild is already in flight for the server
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// The executor failed to apply one or more commands; rendered as the
    /// executor's own message so it can be stored on the task
    #[error("{0}")]
    Execution(String),

    /// A rebuild exceeded its wall-clock budget
    #[error("{0}")]
    Timeout(String),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn not_found(kind: EntityKind, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Stable machine-readable code used in the API error envelope
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::NotFound { kind, .. } => match kind {
                EntityKind::Task => "TASK_NOT_FOUND",
                EntityKind::Server => "SERVER_NOT_FOUND",
                EntityKind::Rule => "RULE_NOT_FOUND",
            },
            Self::Conflict(_) => "CONFLICT",
            Self::InvalidOperation(_) => "INVALID_OPERATION",
            Self::Execution(_) => "EXECUTION_FAILED",
            Self::Timeout(_) => "TIMEOUT",
            Self::Storage(_) | Self::Config(_) | Self::Io(_) | Self::Internal(_) => {
                "INTERNAL_ERROR"
            }
        }
    }

    /// HTTP status code for this error
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation { .. } | Self::InvalidOperation(_) => 400,
            Self::NotFound { .. } => 404,
            Self::Conflict(_) => 409,
            Self::Execution(_) => 502,
            Self::Timeout(_) => 504,
            Self::Storage(_) | Self::Config(_) | Self::Io(_) | Self::Internal(_) => 500,
        }
    }
}
