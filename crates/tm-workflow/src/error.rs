use tm_audit::AuditError;
use tm_db::{DbError, RepoError};
use tm_schemas::WorkflowAction;

/// Every way a workflow call can fail. Degraded success (mutation committed,
/// audit gap) is not an error; see `TransitionOutcome::Degraded`.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("{label} '{code}' not found")]
    NotFound { label: &'static str, code: String },

    /// The guard table refused the transition. `reason` is shown to users.
    #[error("{action} not allowed: {reason}")]
    IllegalTransition {
        action: WorkflowAction,
        reason: String,
    },

    #[error("validation failed: {0}")]
    Validation(String),

    /// The entity changed between read and write.
    #[error("{label} '{code}' was modified concurrently")]
    Conflict { label: &'static str, code: String },

    /// The store did not confirm the mutation. `detail` is backend text for
    /// operators.
    #[error("storage operation failed: {detail}")]
    WriteFailed { detail: String },

    #[error("data store unavailable: {0}")]
    Unavailable(DbError),
}

impl WorkflowError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WorkflowError::Conflict { .. } | WorkflowError::Unavailable(_)
        )
    }

    /// Text safe to show an end user. Never contains backend error text.
    pub fn user_message(&self) -> String {
        match self {
            WorkflowError::NotFound { label, code } => format!("{label} '{code}' was not found."),
            WorkflowError::IllegalTransition { reason, .. } => reason.clone(),
            WorkflowError::Validation(msg) => msg.clone(),
            WorkflowError::Conflict { label, code } => format!(
                "{label} '{code}' was changed by someone else. Reload it and try again."
            ),
            WorkflowError::WriteFailed { .. } => {
                "The change could not be saved. Please try again later.".to_string()
            }
            WorkflowError::Unavailable(_) => {
                "The data store is temporarily unavailable. Please retry shortly.".to_string()
            }
        }
    }

    pub(crate) fn from_repo(err: RepoError, label: &'static str) -> Self {
        match err {
            RepoError::NotFound { code, .. } => WorkflowError::NotFound { label, code },
            RepoError::Duplicate { code, .. } => {
                WorkflowError::Validation(format!("{label} '{code}' already exists."))
            }
            RepoError::Conflict { code, .. } => WorkflowError::Conflict { label, code },
            RepoError::WriteFailed { table, detail } => WorkflowError::WriteFailed {
                detail: format!("{table}: {detail}"),
            },
            RepoError::InvalidFilter(msg) => WorkflowError::Validation(msg),
            RepoError::Db(e) if e.is_retryable() => WorkflowError::Unavailable(e),
            RepoError::Db(e) => WorkflowError::WriteFailed {
                detail: e.to_string(),
            },
        }
    }

    pub(crate) fn from_audit(err: AuditError) -> Self {
        match err {
            AuditError::Db(e) if e.is_retryable() => WorkflowError::Unavailable(e),
            AuditError::InvalidFilter(msg) => WorkflowError::Validation(msg),
            other => WorkflowError::WriteFailed {
                detail: other.to_string(),
            },
        }
    }
}
