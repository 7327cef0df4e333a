use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use companies_core::{
    Company, CompanyDraft, CompanyId, CompanyPatch, CompanyRecord, DomainError, IdempotencyKey,
    Page,
};

/// Result of [`CompanyStore::create`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Created {
    /// Latest state of the company.
    pub company: Company,
    /// `true` when the idempotency key had already been used with the same
    /// attributes and nothing new was written.
    pub replayed: bool,
}

/// Company store operation error.
///
/// The split between `Unavailable` and `Ambiguous` matters to callers:
/// `Unavailable` means the statement was provably not applied (safe to retry),
/// `Ambiguous` means the connection failed while a write was in flight.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("company not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("write outcome unknown: {0}")]
    Ambiguous(String),

    #[error("internal storage error: {0}")]
    Internal(String),
}

impl From<DomainError> for StoreError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => StoreError::Validation(msg),
            DomainError::NotFound => StoreError::NotFound,
            DomainError::Conflict(msg) => StoreError::Conflict(msg),
        }
    }
}

/// Durable, single-document CRUD over companies.
///
/// ## Contract
///
/// - Every mutation touches exactly one company document and is atomic with
///   respect to that document. No multi-document transactions.
/// - Mutations never read-modify-write blindly: `update`/`delete` compare-and-set
///   on `revision`, so concurrent writers to one id cannot lose updates.
/// - Each committed mutation bumps `revision` by one; the returned snapshot is
///   the post-mutation state.
/// - Delete writes a tombstone. Tombstones are invisible to `get`, `update`,
///   `delete` and `list`, and release the name; only `latest` returns them.
///
/// Implementations must be safe to share across tasks (`Send + Sync`).
#[async_trait]
pub trait CompanyStore: Send + Sync {
    /// Assign an id and persist revision 1.
    ///
    /// Fails with `Conflict` if a live company has the same name, or if
    /// `idempotency_key` was used before with different attributes.
    async fn create(
        &self,
        draft: CompanyDraft,
        idempotency_key: Option<IdempotencyKey>,
    ) -> Result<Created, StoreError>;

    async fn get(&self, id: CompanyId) -> Result<Company, StoreError>;

    async fn update(&self, id: CompanyId, patch: CompanyPatch) -> Result<Company, StoreError>;

    /// Tombstone the company and return the tombstone snapshot.
    async fn delete(&self, id: CompanyId) -> Result<Company, StoreError>;

    /// Latest stored state, tombstones included.
    async fn latest(&self, id: CompanyId) -> Result<CompanyRecord, StoreError>;

    /// Live companies ordered by id.
    async fn list(&self, page: Page) -> Result<Vec<Company>, StoreError>;
}

#[async_trait]
impl<S> CompanyStore for Arc<S>
where
    S: CompanyStore + ?Sized,
{
    async fn create(
        &self,
        draft: CompanyDraft,
        idempotency_key: Option<IdempotencyKey>,
    ) -> Result<Created, StoreError> {
        (**self).create(draft, idempotency_key).await
    }

    async fn get(&self, id: CompanyId) -> Result<Company, StoreError> {
        (**self).get(id).await
    }

    async fn update(&self, id: CompanyId, patch: CompanyPatch) -> Result<Company, StoreError> {
        (**self).update(id, patch).await
    }

    async fn delete(&self, id: CompanyId) -> Result<Company, StoreError> {
        (**self).delete(id).await
    }

    async fn latest(&self, id: CompanyId) -> Result<CompanyRecord, StoreError> {
        (**self).latest(id).await
    }

    async fn list(&self, page: Page) -> Result<Vec<Company>, StoreError> {
        (**self).list(page).await
    }
}
