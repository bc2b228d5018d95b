use tracing::debug;

use crate::catalog::CatalogError;
use crate::policy::PolicyError;
use crate::query::{FilterError, ValidationError};
use crate::repository::interface::Error as RepositoryError;

/// Everything a records operation can fail with. Raw driver errors are
/// classified into this before they leave the engine.
#[derive(Debug, thiserror::Error)]
pub enum RecordsError {
    /// Unknown table, unknown row, or a row the caller may not read
    #[error("The requested resource wasn't found.")]
    NotFound,

    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Write denied by policy
    #[error("You are not allowed to perform this request.")]
    Forbidden,

    #[error("The record violates a uniqueness or integrity constraint.")]
    Conflict { detail: String },

    #[error("The request was cancelled before it completed.")]
    Cancelled,

    #[error("This table is unavailable because of an invalid policy.")]
    Unusable(PolicyError),

    #[error("Something went wrong while processing your request.")]
    Internal(String),
}

impl RecordsError {
    /// Stable machine-readable code, shared by the HTTP envelope and metrics.
    pub fn code(&self) -> &'static str {
        match self {
            RecordsError::NotFound => "not_found",
            RecordsError::Filter(_) => "filter_error",
            RecordsError::Validation(_) => "validation_error",
            RecordsError::Forbidden => "forbidden",
            RecordsError::Conflict { .. } => "conflict",
            RecordsError::Cancelled => "request_timeout",
            RecordsError::Unusable(_) | RecordsError::Internal(_) => "internal_error",
        }
    }
}

impl From<CatalogError> for RecordsError {
    fn from(error: CatalogError) -> Self {
        match error {
            CatalogError::TableDoesNotExist { .. } => RecordsError::NotFound,
            CatalogError::TableUnusable { reason, .. } => RecordsError::Unusable(reason),
            CatalogError::IntrospectionError(e) => RecordsError::Internal(e.to_string()),
        }
    }
}

impl From<RepositoryError> for RecordsError {
    fn from(error: RepositoryError) -> Self {
        match error {
            RepositoryError::UniqueConstraintViolation(_)
            | RepositoryError::CheckConstraintViolation(_)
            | RepositoryError::FKConstraintViolation(_) => {
                debug!("Constraint violation: {error}");
                RecordsError::Conflict {
                    detail: error.to_string(),
                }
            }
            RepositoryError::NotNullViolation(_) => {
                RecordsError::Validation(ValidationError::RequiredValueMissing)
            }
            RepositoryError::SqlxError(e) => RecordsError::Internal(e.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for RecordsError {
    fn from(error: tokio::task::JoinError) -> Self {
        RecordsError::Internal(format!("write task failed: {error}"))
    }
}
