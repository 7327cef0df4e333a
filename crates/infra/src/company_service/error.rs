use thiserror::Error;

use companies_core::{Company, CompanyId};

use crate::store::StoreError;

/// Failure of one company operation, as seen by the caller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// Token missing, invalid, expired, or lacking the required permission.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("company not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("validation failed: {0}")]
    Validation(String),

    /// The store could not be reached; nothing was written.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Re-publishing failed; the stored state is unchanged.
    #[error("event channel unavailable: {0}")]
    PublishUnavailable(String),

    /// The mutation committed but its change event was not confirmed by the channel.
    #[error("change committed but event for {} (sequence {}) was not confirmed: {cause}", company.id, company.revision)]
    EmitIncomplete { company: Box<Company>, cause: String },

    /// The store did not answer in time (or dropped the connection) while a
    /// mutation was in flight, so it may or may not have committed.
    #[error("outcome of the change is unknown: {detail}")]
    AmbiguousCommit {
        company_id: Option<CompanyId>,
        detail: String,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Stable machine-readable code.
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::Unauthenticated(_) => "unauthenticated",
            ServiceError::NotFound => "not_found",
            ServiceError::Conflict(_) => "conflict",
            ServiceError::Validation(_) => "validation_error",
            ServiceError::StorageUnavailable(_) => "storage_unavailable",
            ServiceError::PublishUnavailable(_) => "publish_unavailable",
            ServiceError::EmitIncomplete { .. } => "emit_incomplete",
            ServiceError::AmbiguousCommit { .. } => "ambiguous_commit",
            ServiceError::Internal(_) => "internal_error",
        }
    }

    /// Whether repeating the identical request can not produce a second effect.
    ///
    /// `EmitIncomplete` and `AmbiguousCommit` are not: recover with an
    /// idempotency key (create), or by reading and re-publishing.
    pub fn retry_safe(&self) -> bool {
        matches!(
            self,
            ServiceError::StorageUnavailable(_) | ServiceError::PublishUnavailable(_)
        )
    }

    pub(crate) fn from_store(err: StoreError, company_id: Option<CompanyId>) -> Self {
        match err {
            StoreError::NotFound => ServiceError::NotFound,
            StoreError::Conflict(msg) => ServiceError::Conflict(msg),
            StoreError::Validation(msg) => ServiceError::Validation(msg),
            StoreError::Unavailable(msg) => ServiceError::StorageUnavailable(msg),
            StoreError::Ambiguous(detail) => ServiceError::AmbiguousCommit { company_id, detail },
            StoreError::Internal(msg) => ServiceError::Internal(msg),
        }
    }
}
