//! Postgres-backed company store.
//!
//! Each company is one row in `companies`: the full document as JSONB plus the
//! columns needed for constraints and lookups (`name`, `revision`,
//! `idempotency_key`, `deleted_at`). Uniqueness of live names and of
//! idempotency keys is enforced by partial unique indexes, so concurrent
//! creates race safely at the database.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database (unique violation) | `23505` | `Conflict` | Live name taken, or idempotency key race |
//! | Database (check violation) | `23514` | `Validation` | Revision out of range |
//! | Database (other) | Any other | `Internal` | Unexpected database error |
//! | PoolTimedOut / PoolClosed | N/A | `Unavailable` | No connection was acquired, nothing was sent |
//! | Io / Tls / Protocol | N/A | `Unavailable` (reads), `Ambiguous` (writes) | Connection lost mid-statement |
//! | Other | N/A | `Internal` | Decode failures and the like |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::{instrument, Span};

use companies_core::{
    Company, CompanyDraft, CompanyId, CompanyPatch, CompanyRecord, IdempotencyKey, Page,
};

use super::r#trait::{CompanyStore, Created, StoreError};

/// Idempotent schema bootstrap, run once at startup.
pub const SCHEMA: &str = include_str!("../../migrations/0001_companies.sql");

const LIVE_NAME_INDEX: &str = "companies_live_name_idx";
const IDEMPOTENCY_KEY_INDEX: &str = "companies_idempotency_key_idx";

/// Upper bound on compare-and-set retries when concurrent writers race on one id.
const MAX_CAS_ATTEMPTS: usize = 8;

/// Postgres-backed company store.
///
/// `update` and `delete` are compare-and-set on `revision`: the row is read,
/// the next revision is computed in memory, and the UPDATE only applies if the
/// stored revision is still the one that was read. On a lost race the cycle is
/// repeated against the fresh row.
#[derive(Debug, Clone)]
pub struct PostgresCompanyStore {
    pool: Arc<PgPool>,
}

impl PostgresCompanyStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Open a pool against `database_url`.
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e, Access::Read))?;
        Ok(Self::new(pool))
    }

    /// Create the table and indexes if they do not exist yet.
    #[instrument(skip(self), err)]
    pub async fn bootstrap_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("bootstrap_schema", e, Access::Write))?;
        Ok(())
    }

    async fn fetch(&self, id: CompanyId, live_only: bool) -> Result<Option<CompanyRow>, StoreError> {
        let sql = if live_only {
            "SELECT document, create_request, deleted_at FROM companies \
             WHERE id = $1 AND deleted_at IS NULL"
        } else {
            "SELECT document, create_request, deleted_at FROM companies WHERE id = $1"
        };
        let row = sqlx::query(sql)
            .bind(*id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch", e, Access::Read))?;
        row.as_ref().map(CompanyRow::decode).transpose()
    }

    async fn fetch_by_key(&self, key: &IdempotencyKey) -> Result<Option<CompanyRow>, StoreError> {
        let row = sqlx::query(
            "SELECT document, create_request, deleted_at FROM companies WHERE idempotency_key = $1",
        )
        .bind(key.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_by_key", e, Access::Read))?;
        row.as_ref().map(CompanyRow::decode).transpose()
    }
}

#[async_trait]
impl CompanyStore for PostgresCompanyStore {
    #[instrument(
        skip(self, draft, idempotency_key),
        fields(
            company_name = %draft.name,
            company_id = tracing::field::Empty,
            replayed = tracing::field::Empty
        ),
        err
    )]
    async fn create(
        &self,
        draft: CompanyDraft,
        idempotency_key: Option<IdempotencyKey>,
    ) -> Result<Created, StoreError> {
        draft.validate()?;
        let span = Span::current();

        if let Some(key) = &idempotency_key {
            if let Some(existing) = self.fetch_by_key(key).await? {
                span.record("replayed", true);
                return existing.replay(&draft);
            }
        }

        let company = Company::create(CompanyId::new(), draft.clone(), Utc::now())?;
        let document = encode(&company)?;
        let create_request = match &idempotency_key {
            Some(_) => Some(encode(&draft)?),
            None => None,
        };

        let inserted = sqlx::query(
            r#"
            INSERT INTO companies (
                id, name, revision, document, idempotency_key, create_request,
                created_at, updated_at, deleted_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $7, NULL)
            "#,
        )
        .bind(*company.id.as_uuid())
        .bind(company.name.as_str())
        .bind(sql_revision(company.revision)?)
        .bind(&document)
        .bind(idempotency_key.as_ref().map(IdempotencyKey::as_str))
        .bind(&create_request)
        .bind(company.created_at)
        .execute(&*self.pool)
        .await;

        match inserted {
            Ok(_) => {
                span.record("company_id", tracing::field::display(company.id));
                Ok(Created {
                    company,
                    replayed: false,
                })
            }
            Err(err) if violated_constraint(&err).as_deref() == Some(IDEMPOTENCY_KEY_INDEX) => {
                // A concurrent create with the same key committed first.
                span.record("replayed", true);
                let key = idempotency_key
                    .as_ref()
                    .ok_or_else(|| StoreError::Internal("key index hit without a key".into()))?;
                match self.fetch_by_key(key).await? {
                    Some(existing) => existing.replay(&draft),
                    None => Err(StoreError::Conflict(
                        "idempotency key is being used concurrently".to_string(),
                    )),
                }
            }
            Err(err) => Err(map_sqlx_error("create", err, Access::Write)),
        }
    }

    #[instrument(skip(self), fields(company_id = %id), err)]
    async fn get(&self, id: CompanyId) -> Result<Company, StoreError> {
        match self.fetch(id, true).await? {
            Some(row) => Ok(row.record.company),
            None => Err(StoreError::NotFound),
        }
    }

    #[instrument(skip(self, patch), fields(company_id = %id, revision = tracing::field::Empty), err)]
    async fn update(&self, id: CompanyId, patch: CompanyPatch) -> Result<Company, StoreError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self
                .fetch(id, true)
                .await?
                .ok_or(StoreError::NotFound)?
                .record
                .company;
            let next = current.patched(&patch, Utc::now())?;

            let result = sqlx::query(
                r#"
                UPDATE companies
                SET name = $3, revision = $4, document = $5, updated_at = $6
                WHERE id = $1 AND revision = $2 AND deleted_at IS NULL
                "#,
            )
            .bind(*id.as_uuid())
            .bind(sql_revision(current.revision)?)
            .bind(next.name.as_str())
            .bind(sql_revision(next.revision)?)
            .bind(encode(&next)?)
            .bind(next.updated_at)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("update", e, Access::Write))?;

            if result.rows_affected() == 1 {
                Span::current().record("revision", next.revision);
                return Ok(next);
            }
            tracing::debug!(company_id = %id, "revision moved during update, retrying");
        }
        Err(StoreError::Conflict(
            "too many concurrent modifications, try again".to_string(),
        ))
    }

    #[instrument(skip(self), fields(company_id = %id, revision = tracing::field::Empty), err)]
    async fn delete(&self, id: CompanyId) -> Result<Company, StoreError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self
                .fetch(id, true)
                .await?
                .ok_or(StoreError::NotFound)?
                .record
                .company;
            let tombstone = current.tombstoned(Utc::now());

            let result = sqlx::query(
                r#"
                UPDATE companies
                SET revision = $3, document = $4, updated_at = $5, deleted_at = $5
                WHERE id = $1 AND revision = $2 AND deleted_at IS NULL
                "#,
            )
            .bind(*id.as_uuid())
            .bind(sql_revision(current.revision)?)
            .bind(sql_revision(tombstone.revision)?)
            .bind(encode(&tombstone)?)
            .bind(tombstone.updated_at)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete", e, Access::Write))?;

            if result.rows_affected() == 1 {
                Span::current().record("revision", tombstone.revision);
                return Ok(tombstone);
            }
            tracing::debug!(company_id = %id, "revision moved during delete, retrying");
        }
        Err(StoreError::Conflict(
            "too many concurrent modifications, try again".to_string(),
        ))
    }

    #[instrument(skip(self), fields(company_id = %id), err)]
    async fn latest(&self, id: CompanyId) -> Result<CompanyRecord, StoreError> {
        match self.fetch(id, false).await? {
            Some(row) => Ok(row.record),
            None => Err(StoreError::NotFound),
        }
    }

    #[instrument(skip(self), fields(limit = page.limit, offset = page.offset, company_count = tracing::field::Empty), err)]
    async fn list(&self, page: Page) -> Result<Vec<Company>, StoreError> {
        let offset = i64::try_from(page.offset)
            .map_err(|_| StoreError::Validation("offset out of range".to_string()))?;

        let rows = sqlx::query(
            r#"
            SELECT document, create_request, deleted_at
            FROM companies
            WHERE deleted_at IS NULL
            ORDER BY id ASC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(i64::from(page.limit))
        .bind(offset)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list", e, Access::Read))?;

        let companies = rows
            .iter()
            .map(|row| CompanyRow::decode(row).map(|r| r.record.company))
            .collect::<Result<Vec<_>, _>>()?;
        Span::current().record("company_count", companies.len());
        Ok(companies)
    }
}

/// Whether a failed statement may have been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Read,
    Write,
}

fn map_sqlx_error(operation: &str, err: sqlx::Error, access: Access) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => match db_err.constraint() {
                    Some(LIVE_NAME_INDEX) => {
                        StoreError::Conflict("company name is already taken".to_string())
                    }
                    Some(IDEMPOTENCY_KEY_INDEX) => {
                        StoreError::Conflict("idempotency key is already in use".to_string())
                    }
                    _ => StoreError::Conflict(msg),
                },
                Some("23514") => StoreError::Validation(msg),
                _ => StoreError::Internal(msg),
            }
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            StoreError::Unavailable(format!("no database connection in {}: {}", operation, err))
        }
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::WorkerCrashed => {
            let msg = format!("connection failure in {}: {}", operation, err);
            match access {
                Access::Read => StoreError::Unavailable(msg),
                Access::Write => StoreError::Ambiguous(msg),
            }
        }
        sqlx::Error::RowNotFound => StoreError::NotFound,
        _ => StoreError::Internal(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// Name of the unique index a statement violated, if any.
fn violated_constraint(err: &sqlx::Error) -> Option<String> {
    if let sqlx::Error::Database(db_err) = err {
        if db_err.code().as_deref() == Some("23505") {
            return db_err.constraint().map(str::to_owned);
        }
    }
    None
}

fn sql_revision(revision: u64) -> Result<i64, StoreError> {
    i64::try_from(revision).map_err(|_| StoreError::Internal("revision overflow".to_string()))
}

fn encode<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(value)
        .map_err(|e| StoreError::Internal(format!("failed to encode document: {e}")))
}

// SQLx row types

#[derive(Debug)]
struct CompanyRow {
    record: CompanyRecord,
    create_request: Option<CompanyDraft>,
}

impl CompanyRow {
    fn decode(row: &sqlx::postgres::PgRow) -> Result<Self, StoreError> {
        let corrupt = |e: &dyn std::fmt::Display| {
            StoreError::Internal(format!("failed to decode company row: {e}"))
        };

        let document: serde_json::Value = row.try_get("document").map_err(|e| corrupt(&e))?;
        let create_request: Option<serde_json::Value> =
            row.try_get("create_request").map_err(|e| corrupt(&e))?;
        let deleted_at: Option<DateTime<Utc>> =
            row.try_get("deleted_at").map_err(|e| corrupt(&e))?;

        let company: Company = serde_json::from_value(document).map_err(|e| corrupt(&e))?;
        let create_request = create_request
            .map(serde_json::from_value::<CompanyDraft>)
            .transpose()
            .map_err(|e| corrupt(&e))?;

        Ok(Self {
            record: CompanyRecord {
                company,
                deleted_at,
            },
            create_request,
        })
    }

    fn replay(self, draft: &CompanyDraft) -> Result<Created, StoreError> {
        if self.create_request.as_ref() != Some(draft) {
            return Err(StoreError::Conflict(
                "idempotency key was used with different attributes".to_string(),
            ));
        }
        if self.record.is_deleted() {
            return Err(StoreError::Conflict(
                "idempotency key refers to a deleted company".to_string(),
            ));
        }
        Ok(Created {
            company: self.record.company,
            replayed: true,
        })
    }
}
