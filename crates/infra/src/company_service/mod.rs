//! Company operation pipeline (application-level orchestration).
//!
//! Every request runs the same straight-line state machine:
//!
//! ```text
//! Authorizing ──► Mutating ──► Emitting ──► Done
//!      │              │            │
//!      └──────────────┴────────────┴──► Failed(reason)
//! ```
//!
//! - **Authorizing**: verify the bearer token and check the required
//!   permission. Rejection happens before the store is touched.
//! - **Mutating**: one store call. `StorageUnavailable` is retried a bounded
//!   number of times; everything else fails immediately. A failed mutation never
//!   produces an event.
//! - **Emitting**: build the [`ChangeEvent`] from the state the store returned
//!   and publish it with bounded retries. If the channel never confirms, the
//!   caller gets [`ServiceError::EmitIncomplete`]; the committed change is
//!   never rolled back.
//!
//! ## Ordering
//!
//! The event sequence is the store revision, so it is strictly increasing per
//! company regardless of which process committed. Within this process,
//! Mutating and Emitting for one company run under a per-company lock so
//! events leave in commit order.
//!
//! ## Cancellation
//!
//! Mutating and Emitting run on a spawned task. A caller that goes away (client
//! disconnect, request timeout) does not interrupt a mutation half way or skip
//! its event. The same holds when the store phase times out: the caller is told
//! the outcome is ambiguous, and the task keeps driving the store call; if it
//! commits after all, its event is still emitted. [`CompanyService::drain`]
//! waits for these tasks, so shutdown does not cut an emit short.

mod error;
mod policy;
mod subject_locks;


pub use error::ServiceError;
pub use policy::{Backoff, ServicePolicy};
pub use subject_locks::{SubjectGuard, SubjectLocks};

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use companies_auth::{JwtValidator, Permission, Principal, authorize};
use companies_core::{
    Company, CompanyDraft, CompanyId, CompanyPatch, CompanyRecord, IdempotencyKey, Page,
};
use companies_events::{ChangeEvent, ChangeKind, EventKey, EventPublisher, PublishError};

use crate::store::{CompanyStore, Created, StoreError};

/// Request lifecycle state, used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Authorizing,
    Mutating,
    Emitting,
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Authorizing => "authorizing",
            Phase::Mutating => "mutating",
            Phase::Emitting => "emitting",
            Phase::Done => "done",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Get,
    List,
    Update,
    Delete,
    Republish,
}

impl Operation {
    /// Permission a caller needs for this operation.
    pub fn required_permission(self) -> Permission {
        match self {
            Operation::Get | Operation::List => Permission::COMPANIES_READ,
            Operation::Create | Operation::Update | Operation::Delete | Operation::Republish => {
                Permission::COMPANIES_WRITE
            }
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Create => "create",
            Operation::Get => "get",
            Operation::List => "list",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Republish => "republish",
        })
    }
}

/// What a successful Mutating phase hands to Emitting.
#[derive(Debug, Clone)]
struct Mutated {
    event: ChangeEvent,
    replayed: bool,
}

type StoreFuture = Pin<Box<dyn Future<Output = Result<Mutated, StoreError>> + Send>>;

/// Orchestrates authorize → mutate → emit for company operations.
///
/// Cheap to clone; all collaborators are shared.
#[derive(Clone)]
pub struct CompanyService {
    verifier: Arc<dyn JwtValidator>,
    store: Arc<dyn CompanyStore>,
    publisher: Arc<dyn EventPublisher>,
    policy: ServicePolicy,
    locks: SubjectLocks,
    pipelines: Arc<Mutex<JoinSet<()>>>,
}

impl fmt::Debug for CompanyService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompanyService")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl CompanyService {
    pub fn new(
        verifier: Arc<dyn JwtValidator>,
        store: Arc<dyn CompanyStore>,
        publisher: Arc<dyn EventPublisher>,
        policy: ServicePolicy,
    ) -> Self {
        Self {
            verifier,
            store,
            publisher,
            policy,
            locks: SubjectLocks::new(),
            pipelines: Arc::default(),
        }
    }

    pub fn policy(&self) -> &ServicePolicy {
        &self.policy
    }

    /// Wait until every detached mutation has finished Emitting.
    ///
    /// Returns how many were still running. Dropping the returned future
    /// aborts the remaining tasks.
    pub async fn drain(&self) -> usize {
        let mut tasks = std::mem::take(&mut *self.pipeline_set());
        while tasks.try_join_next().is_some() {}

        let running = tasks.len();
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "pipeline task failed while draining");
            }
        }
        running
    }

    fn pipeline_set(&self) -> std::sync::MutexGuard<'_, JoinSet<()>> {
        self.pipelines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create a company.
    ///
    /// With an idempotency key, repeating the same request returns the existing
    /// company (`replayed = true`) and re-publishes the event for its latest
    /// revision, which is how a client finishes a create that ended in
    /// `EmitIncomplete`. If the company was updated in the meantime, that is an
    /// `updated` event; the snapshot payload still carries the full state.
    pub async fn create(
        &self,
        token: &str,
        draft: CompanyDraft,
        idempotency_key: Option<IdempotencyKey>,
    ) -> Result<Created, ServiceError> {
        let principal = self.authenticate(Operation::Create, token, &Permission::COMPANIES_WRITE)?;
        draft
            .validate()
            .map_err(|e| ServiceError::Validation(e.to_string()))?;
        debug!(operation = %Operation::Create, subject = %principal.subject, "authorized");

        let store = Arc::clone(&self.store);
        let mutated = self
            .mutate_and_emit(Operation::Create, None, move || -> StoreFuture {
                let store = Arc::clone(&store);
                let draft = draft.clone();
                let key = idempotency_key.clone();
                Box::pin(async move {
                    let created = store.create(draft, key).await?;
                    let event = if created.replayed {
                        // Replaced by the latest revision once the company lock is held.
                        ChangeEvent::for_record(&CompanyRecord::live(created.company))
                    } else {
                        ChangeEvent::committed(ChangeKind::Created, &created.company)
                    };
                    Ok(Mutated {
                        event,
                        replayed: created.replayed,
                    })
                })
            })
            .await?;

        Ok(Created {
            company: mutated.event.payload().clone(),
            replayed: mutated.replayed,
        })
    }

    pub async fn get(&self, token: &str, id: CompanyId) -> Result<Company, ServiceError> {
        self.authenticate(Operation::Get, token, &Permission::COMPANIES_READ)?;
        self.read(Operation::Get, Some(id), || self.store.get(id)).await
    }

    pub async fn list(&self, token: &str, page: Page) -> Result<Vec<Company>, ServiceError> {
        self.authenticate(Operation::List, token, &Permission::COMPANIES_READ)?;
        self.read(Operation::List, None, || self.store.list(page)).await
    }

    /// Apply `patch` to a live company. A full replacement is a patch with every field set.
    pub async fn update(
        &self,
        token: &str,
        id: CompanyId,
        patch: CompanyPatch,
    ) -> Result<Company, ServiceError> {
        self.authenticate(Operation::Update, token, &Permission::COMPANIES_WRITE)?;
        if patch.is_empty() {
            return Err(ServiceError::Validation(
                "update must change at least one field".to_string(),
            ));
        }

        let store = Arc::clone(&self.store);
        let mutated = self
            .mutate_and_emit(Operation::Update, Some(id), move || -> StoreFuture {
                let store = Arc::clone(&store);
                let patch = patch.clone();
                Box::pin(async move {
                    let company = store.update(id, patch).await?;
                    Ok(Mutated {
                        event: ChangeEvent::committed(ChangeKind::Updated, &company),
                        replayed: false,
                    })
                })
            })
            .await?;

        Ok(mutated.event.payload().clone())
    }

    /// Delete a live company. Returns the tombstone snapshot.
    pub async fn delete(&self, token: &str, id: CompanyId) -> Result<Company, ServiceError> {
        self.authenticate(Operation::Delete, token, &Permission::COMPANIES_WRITE)?;

        let store = Arc::clone(&self.store);
        let mutated = self
            .mutate_and_emit(Operation::Delete, Some(id), move || -> StoreFuture {
                let store = Arc::clone(&store);
                Box::pin(async move {
                    let tombstone = store.delete(id).await?;
                    Ok(Mutated {
                        event: ChangeEvent::committed(ChangeKind::Deleted, &tombstone),
                        replayed: false,
                    })
                })
            })
            .await?;

        Ok(mutated.event.payload().clone())
    }

    /// Publish the event for the company's current revision again.
    ///
    /// Works on tombstones too, so a delete whose event was not confirmed can be
    /// completed. Consumers drop the copy if they already have it.
    pub async fn republish(&self, token: &str, id: CompanyId) -> Result<EventKey, ServiceError> {
        self.authenticate(Operation::Republish, token, &Permission::COMPANIES_WRITE)?;

        let _guard = self.locks.lock(id).await;
        let record = self
            .read(Operation::Republish, Some(id), || self.store.latest(id))
            .await?;
        let event = ChangeEvent::for_record(&record);

        debug!(operation = %Operation::Republish, phase = %Phase::Emitting, company_id = %id, sequence = event.sequence(), "phase transition");
        match self.emit(&event).await {
            Ok(()) => {
                info!(company_id = %id, sequence = event.sequence(), kind = event.kind().as_str(), "change event re-published");
                Ok(event.key())
            }
            Err(err) => {
                warn!(company_id = %id, sequence = event.sequence(), error = %err, "re-publish failed");
                Err(ServiceError::PublishUnavailable(err.to_string()))
            }
        }
    }

    /// Run only the Authorizing phase for `operation`.
    ///
    /// Lets an edge reject bad credentials before it looks at the request
    /// itself. The operation methods authorize again on their own.
    pub fn check_access(&self, token: &str, operation: Operation) -> Result<(), ServiceError> {
        self.authenticate(operation, token, &operation.required_permission())
            .map(|_| ())
    }

    fn authenticate(
        &self,
        operation: Operation,
        token: &str,
        required: &Permission,
    ) -> Result<Principal, ServiceError> {
        debug!(operation = %operation, phase = %Phase::Authorizing, "phase transition");

        let claims = self.verifier.validate(token, Utc::now()).map_err(|err| {
            warn!(operation = %operation, phase = %Phase::Authorizing, error = %err, "token rejected");
            ServiceError::Unauthenticated(err.to_string())
        })?;
        let principal = Principal::from_claims(claims);

        authorize(&principal, required).map_err(|err| {
            warn!(operation = %operation, phase = %Phase::Authorizing, subject = %principal.subject, error = %err, "permission denied");
            ServiceError::Unauthenticated(err.to_string())
        })?;

        Ok(principal)
    }

    /// Run a store call, retrying `Unavailable` up to `store_retries` extra times.
    async fn with_store_retry<T, F, Fut>(
        &self,
        operation: Operation,
        mut call: F,
    ) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Err(StoreError::Unavailable(reason)) if attempt <= self.policy.store_retries => {
                    warn!(operation = %operation, attempt, reason = %reason, "store unavailable, retrying");
                    tokio::time::sleep(self.policy.store_backoff.delay(attempt)).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn read<T, F, Fut>(
        &self,
        operation: Operation,
        company_id: Option<CompanyId>,
        call: F,
    ) -> Result<T, ServiceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(
            self.policy.store_timeout,
            self.with_store_retry(operation, call),
        )
        .await
        {
            Ok(result) => result.map_err(|err| ServiceError::from_store(err, company_id)),
            Err(_) => {
                warn!(operation = %operation, timeout_ms = self.policy.store_timeout.as_millis() as u64, "store read timed out");
                Err(ServiceError::StorageUnavailable(format!(
                    "store did not answer within {:?}",
                    self.policy.store_timeout
                )))
            }
        }
    }

    /// Publish with bounded exponential backoff and a per-attempt timeout.
    async fn emit(&self, event: &ChangeEvent) -> Result<(), PublishError> {
        let attempts = self.policy.emit_attempts.max(1);
        let mut attempt = 1;
        loop {
            let result =
                match tokio::time::timeout(self.policy.emit_timeout, self.publisher.publish(event))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(PublishError::Unavailable(format!(
                        "publish did not complete within {:?}",
                        self.policy.emit_timeout
                    ))),
                };

            match result {
                Ok(()) => return Ok(()),
                Err(err) if err.is_transient() && attempt < attempts => {
                    warn!(
                        company_id = %event.subject_id(),
                        sequence = event.sequence(),
                        attempt,
                        error = %err,
                        "publish failed, backing off"
                    );
                    tokio::time::sleep(self.policy.emit_backoff.delay(attempt)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Run Mutating and Emitting on a detached task and wait for its verdict.
    async fn mutate_and_emit<F>(
        &self,
        operation: Operation,
        company_id: Option<CompanyId>,
        mutate: F,
    ) -> Result<Mutated, ServiceError>
    where
        F: Fn() -> StoreFuture + Send + Sync + 'static,
    {
        let (reply, verdict) = oneshot::channel();
        let service = self.clone();
        {
            let mut tasks = self.pipeline_set();
            while tasks.try_join_next().is_some() {}
            tasks.spawn(async move {
                service
                    .run_pipeline(operation, company_id, mutate, reply)
                    .await;
            });
        }

        verdict.await.map_err(|_| {
            error!(operation = %operation, "pipeline task ended without a verdict");
            ServiceError::Internal("operation task ended unexpectedly".to_string())
        })?
    }

    async fn run_pipeline<F>(
        self,
        operation: Operation,
        company_id: Option<CompanyId>,
        mutate: F,
        reply: oneshot::Sender<Result<Mutated, ServiceError>>,
    ) where
        F: Fn() -> StoreFuture + Send + Sync + 'static,
    {
        let mut reply = Some(reply);
        let mut held = match company_id {
            Some(id) => Some(self.locks.lock(id).await),
            None => None,
        };

        debug!(operation = %operation, phase = %Phase::Mutating, company_id = ?company_id, "phase transition");
        let mut store_call = Box::pin(self.with_store_retry(operation, || mutate()));
        let mutated = match tokio::time::timeout(self.policy.store_timeout, &mut store_call).await {
            Ok(Ok(mutated)) => mutated,
            Ok(Err(err)) => {
                warn!(operation = %operation, phase = %Phase::Mutating, company_id = ?company_id, error = %err, "mutation failed");
                send(&mut reply, Err(ServiceError::from_store(err, company_id)));
                return;
            }
            Err(_) => {
                warn!(
                    operation = %operation,
                    phase = %Phase::Mutating,
                    company_id = ?company_id,
                    timeout_ms = self.policy.store_timeout.as_millis() as u64,
                    "mutation timed out, outcome unknown"
                );
                send(
                    &mut reply,
                    Err(ServiceError::AmbiguousCommit {
                        company_id,
                        detail: format!(
                            "store did not confirm the {operation} within {:?}",
                            self.policy.store_timeout
                        ),
                    }),
                );
                // Keep driving the store call so a late commit still gets its event.
                match (&mut store_call).await {
                    Ok(mutated) => {
                        warn!(operation = %operation, company_id = %mutated.event.subject_id(), sequence = mutated.event.sequence(), "mutation committed after timeout");
                        mutated
                    }
                    Err(err) => {
                        warn!(operation = %operation, company_id = ?company_id, error = %err, "timed-out mutation failed");
                        return;
                    }
                }
            }
        };

        // A replayed create learns its company id from the store. Publish the
        // latest revision under the company lock so it cannot overtake a newer
        // update's event.
        let mutated = if held.is_none() && mutated.replayed {
            let id = mutated.event.subject_id();
            held = Some(self.locks.lock(id).await);
            match self.read(operation, Some(id), || self.store.latest(id)).await {
                Ok(record) => Mutated {
                    event: ChangeEvent::for_record(&record),
                    replayed: true,
                },
                Err(err) => {
                    warn!(operation = %operation, company_id = %id, error = %err, "re-reading replayed company failed");
                    send(&mut reply, Err(err));
                    return;
                }
            }
        } else {
            mutated
        };

        let event = &mutated.event;
        debug!(
            operation = %operation,
            phase = %Phase::Emitting,
            company_id = %event.subject_id(),
            sequence = event.sequence(),
            "phase transition"
        );

        let outcome = match self.emit(event).await {
            Ok(()) => {
                info!(
                    operation = %operation,
                    phase = %Phase::Done,
                    company_id = %event.subject_id(),
                    sequence = event.sequence(),
                    kind = event.kind().as_str(),
                    replayed = mutated.replayed,
                    "change committed and published"
                );
                Ok(mutated)
            }
            Err(err) => {
                error!(
                    operation = %operation,
                    phase = %Phase::Emitting,
                    company_id = %event.subject_id(),
                    sequence = event.sequence(),
                    error = %err,
                    "change committed but event not confirmed"
                );
                Err(ServiceError::EmitIncomplete {
                    company: Box::new(event.payload().clone()),
                    cause: err.to_string(),
                })
            }
        };
        send(&mut reply, outcome);
        drop(held);
    }
}

fn send(
    reply: &mut Option<oneshot::Sender<Result<Mutated, ServiceError>>>,
    outcome: Result<Mutated, ServiceError>,
) {
    if let Some(tx) = reply.take() {
        if tx.send(outcome).is_err() {
            debug!("caller went away before the outcome was ready");
        }
    }
}
