use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::types::{CallbackToken, RunId};

/// Classification of a collaborator failure. Retry decisions are made from
/// the kind alone; message text is informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transport could not reach the collaborator.
    Connection,
    /// Collaborator did not answer in time.
    Timeout,
    /// Response arrived but a required field was absent.
    MissingField,
    /// Response violated the collaborator contract (wrong type, out of range).
    InvalidResponse,
    /// Collaborator refused the request.
    Rejected,
    /// Collaborator is not configured or permanently unavailable.
    Unavailable,
}

impl ErrorKind {
    /// Connection and timeout failures are the transient kinds.
    pub fn is_transient(self) -> bool {
        matches!(self, ErrorKind::Connection | ErrorKind::Timeout)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Timeout => "timeout",
            ErrorKind::MissingField => "missing_field",
            ErrorKind::InvalidResponse => "invalid_response",
            ErrorKind::Rejected => "rejected",
            ErrorKind::Unavailable => "unavailable",
        };
        f.write_str(label)
    }
}

/// Failure reported by an external collaborator (scorer, notifier).
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind} error: {message}")]
pub struct CollaboratorError {
    pub kind: ErrorKind,
    pub message: String,
}

impl CollaboratorError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connection, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn missing_field(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MissingField, message)
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidResponse, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Rejected, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, message)
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

/// A step name that already holds a recorded success was appended again.
/// Always a step-naming bug in the workflow definition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("step '{step_name}' already has a recorded success in run {run_id}")]
pub struct DuplicateStepError {
    pub run_id: RunId,
    pub step_name: String,
}

/// Input rejected before any step executes. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid input: {reason}")]
pub struct InvalidInputError {
    pub field: Option<String>,
    pub reason: String,
}

impl InvalidInputError {
    pub fn missing(field: &str) -> Self {
        Self {
            field: Some(field.to_string()),
            reason: format!("required field '{field}' is missing"),
        }
    }

    pub fn invalid(field: &str, reason: impl Into<String>) -> Self {
        Self {
            field: Some(field.to_string()),
            reason: reason.into(),
        }
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        Self {
            field: None,
            reason: reason.into(),
        }
    }
}

/// Errors that can occur while reading or writing durable state
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("State corruption detected: {reason}")]
    StateCorruption { reason: String },

    #[error("Store unavailable: {reason}")]
    Unavailable { reason: String },
}

/// Engine-level error taxonomy.
///
/// `Suspended` is not a failure: it unwinds a replay when a waiter is still
/// pending and is converted into `RunStatus::Suspended` by the controller.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    InvalidInput(#[from] InvalidInputError),

    #[error("step '{step_name}' failed permanently: {last_error}")]
    StepFailedPermanently {
        step_name: String,
        last_error: CollaboratorError,
    },

    #[error(transparent)]
    DuplicateStep(#[from] DuplicateStepError),

    #[error("persistence failure: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("run {run_id} suspended awaiting external input")]
    Suspended { run_id: RunId },

    #[error("run {run_id} not found")]
    RunNotFound { run_id: RunId },

    #[error("unknown callback token {token}")]
    UnknownCallback { token: CallbackToken },

    #[error("step '{step_name}' produced a value that could not be (de)serialized: {source}")]
    StepSerialization {
        step_name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {reason}")]
    InvalidConfiguration { reason: String },
}

impl EngineError {
    pub fn is_suspension(&self) -> bool {
        matches!(self, EngineError::Suspended { .. })
    }

    /// Errors a parallel branch may absorb into its failure counter instead
    /// of failing the whole run.
    pub fn is_branch_failure(&self) -> bool {
        matches!(self, EngineError::StepFailedPermanently { .. })
    }

    /// Client-visible errors (the 400-equivalent class).
    pub fn is_client_error(&self) -> bool {
        matches!(self, EngineError::InvalidInput(_))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_connection_and_timeout_are_transient() {
        assert!(ErrorKind::Connection.is_transient());
        assert!(ErrorKind::Timeout.is_transient());
        assert!(!ErrorKind::MissingField.is_transient());
        assert!(!ErrorKind::InvalidResponse.is_transient());
        assert!(!ErrorKind::Rejected.is_transient());
        assert!(!ErrorKind::Unavailable.is_transient());
    }

    #[test]
    fn test_error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::MissingField).unwrap();
        assert_eq!(json, "\"missing_field\"");
    }

    #[test]
    fn test_engine_error_classification() {
        let suspended = EngineError::Suspended {
            run_id: RunId::new("run-1"),
        };
        assert!(suspended.is_suspension());
        assert!(!suspended.is_branch_failure());

        let failed = EngineError::StepFailedPermanently {
            step_name: "notify".to_string(),
            last_error: CollaboratorError::rejected("bad address"),
        };
        assert!(failed.is_branch_failure());
        assert!(!failed.is_client_error());

        let invalid: EngineError = InvalidInputError::missing("amount").into();
        assert!(invalid.is_client_error());
        assert!(invalid.to_string().contains("amount"));
    }
}
