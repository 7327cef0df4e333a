use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use companies_core::{
    Company, CompanyDraft, CompanyId, CompanyName, CompanyPatch, CompanyRecord, IdempotencyKey,
    Page,
};

use super::r#trait::{CompanyStore, Created, StoreError};

/// Injected behaviour for the next store call (tests/dev).
#[derive(Debug, Clone)]
pub enum Fault {
    /// Fail the call before touching state.
    Fail(StoreError),
    /// Sleep before executing the call normally.
    Delay(Duration),
}

#[derive(Debug, Clone)]
struct Entry {
    record: CompanyRecord,
    origin: Option<(IdempotencyKey, CompanyDraft)>,
}

#[derive(Debug, Default)]
struct State {
    // BTreeMap keeps `list` ordered by id (UUIDv7, so roughly by creation time).
    companies: BTreeMap<CompanyId, Entry>,
    live_names: HashMap<CompanyName, CompanyId>,
    idempotency: HashMap<IdempotencyKey, CompanyId>,
}

/// In-memory company store.
///
/// Intended for tests/dev. Not optimized for performance.
#[derive(Debug, Default)]
pub struct InMemoryCompanyStore {
    state: RwLock<State>,
    faults: Mutex<VecDeque<Fault>>,
    calls: AtomicU64,
}

impl InMemoryCompanyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a fault; each store call consumes at most one.
    pub fn inject(&self, fault: Fault) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.push_back(fault);
        }
    }

    /// Number of store operations invoked so far (including failed ones).
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let fault = self.faults.lock().ok().and_then(|mut f| f.pop_front());
        match fault {
            Some(Fault::Fail(err)) => Err(err),
            Some(Fault::Delay(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, State>, StoreError> {
        self.state
            .read()
            .map_err(|_| StoreError::Internal("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, State>, StoreError> {
        self.state
            .write()
            .map_err(|_| StoreError::Internal("lock poisoned".to_string()))
    }
}

fn replay(entry: &Entry, draft: &CompanyDraft) -> Result<Created, StoreError> {
    let same_request = entry
        .origin
        .as_ref()
        .is_some_and(|(_, original)| original == draft);
    if !same_request {
        return Err(StoreError::Conflict(
            "idempotency key was used with different attributes".to_string(),
        ));
    }
    if entry.record.is_deleted() {
        return Err(StoreError::Conflict(
            "idempotency key refers to a deleted company".to_string(),
        ));
    }
    Ok(Created {
        company: entry.record.company.clone(),
        replayed: true,
    })
}

fn live_entry(state: &State, id: CompanyId) -> Result<&Entry, StoreError> {
    match state.companies.get(&id) {
        Some(entry) if !entry.record.is_deleted() => Ok(entry),
        _ => Err(StoreError::NotFound),
    }
}

#[async_trait]
impl CompanyStore for InMemoryCompanyStore {
    async fn create(
        &self,
        draft: CompanyDraft,
        idempotency_key: Option<IdempotencyKey>,
    ) -> Result<Created, StoreError> {
        self.enter().await?;
        draft.validate()?;

        let mut state = self.write()?;

        if let Some(key) = &idempotency_key {
            if let Some(id) = state.idempotency.get(key) {
                let entry = state
                    .companies
                    .get(id)
                    .ok_or_else(|| StoreError::Internal("dangling idempotency key".to_string()))?;
                return replay(entry, &draft);
            }
        }

        if state.live_names.contains_key(&draft.name) {
            return Err(StoreError::Conflict(format!(
                "company name '{}' is already taken",
                draft.name
            )));
        }

        let company = Company::create(CompanyId::new(), draft.clone(), Utc::now())?;
        let id = company.id;

        state.live_names.insert(company.name.clone(), id);
        if let Some(key) = &idempotency_key {
            state.idempotency.insert(key.clone(), id);
        }
        state.companies.insert(
            id,
            Entry {
                record: CompanyRecord::live(company.clone()),
                origin: idempotency_key.map(|key| (key, draft)),
            },
        );

        Ok(Created {
            company,
            replayed: false,
        })
    }

    async fn get(&self, id: CompanyId) -> Result<Company, StoreError> {
        self.enter().await?;
        let state = self.read()?;
        live_entry(&state, id).map(|e| e.record.company.clone())
    }

    async fn update(&self, id: CompanyId, patch: CompanyPatch) -> Result<Company, StoreError> {
        self.enter().await?;
        let mut state = self.write()?;

        let current = live_entry(&state, id)?.record.company.clone();
        let next = current.patched(&patch, Utc::now())?;

        if next.name != current.name {
            if let Some(owner) = state.live_names.get(&next.name) {
                if *owner != id {
                    return Err(StoreError::Conflict(format!(
                        "company name '{}' is already taken",
                        next.name
                    )));
                }
            }
            state.live_names.remove(&current.name);
            state.live_names.insert(next.name.clone(), id);
        }

        // The write lock makes the read-check-write above atomic per document.
        if let Some(entry) = state.companies.get_mut(&id) {
            entry.record.company = next.clone();
        }
        Ok(next)
    }

    async fn delete(&self, id: CompanyId) -> Result<Company, StoreError> {
        self.enter().await?;
        let mut state = self.write()?;

        let current = live_entry(&state, id)?.record.company.clone();
        let now = Utc::now();
        let tombstone = current.tombstoned(now);

        state.live_names.remove(&current.name);
        if let Some(entry) = state.companies.get_mut(&id) {
            entry.record = CompanyRecord {
                company: tombstone.clone(),
                deleted_at: Some(now),
            };
        }
        Ok(tombstone)
    }

    async fn latest(&self, id: CompanyId) -> Result<CompanyRecord, StoreError> {
        self.enter().await?;
        let state = self.read()?;
        state
            .companies
            .get(&id)
            .map(|e| e.record.clone())
            .ok_or(StoreError::NotFound)
    }

    async fn list(&self, page: Page) -> Result<Vec<Company>, StoreError> {
        self.enter().await?;
        let state = self.read()?;
        Ok(state
            .companies
            .values()
            .filter(|e| !e.record.is_deleted())
            .skip(usize::try_from(page.offset).unwrap_or(usize::MAX))
            .take(page.limit as usize)
            .map(|e| e.record.company.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use companies_core::CompanyType;

    fn draft(name: &str) -> CompanyDraft {
        CompanyDraft {
            name: CompanyName::parse(name).unwrap(),
            description: None,
            employees: 5,
            registered: false,
            kind: CompanyType::Cooperative,
        }
    }

    fn key(raw: &str) -> IdempotencyKey {
        IdempotencyKey::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn create_then_get_roundtrips() {
        let store = InMemoryCompanyStore::new();
        let created = store.create(draft("Acme"), None).await.unwrap();
        assert!(!created.replayed);
        assert_eq!(created.company.revision, 1);

        let fetched = store.get(created.company.id).await.unwrap();
        assert_eq!(fetched, created.company);
    }

    #[tokio::test]
    async fn live_names_are_unique() {
        let store = InMemoryCompanyStore::new();
        store.create(draft("Acme"), None).await.unwrap();
        let err = store.create(draft("Acme"), None).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn update_missing_is_not_found() {
        let store = InMemoryCompanyStore::new();
        let err = store
            .update(CompanyId::new(), CompanyPatch::default())
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::NotFound);
    }

    #[tokio::test]
    async fn update_rejects_name_taken_by_other_company() {
        let store = InMemoryCompanyStore::new();
        store.create(draft("Acme"), None).await.unwrap();
        let other = store.create(draft("Globex"), None).await.unwrap().company;

        let patch = CompanyPatch {
            name: Some(CompanyName::parse("Acme").unwrap()),
            ..Default::default()
        };
        let err = store.update(other.id, patch).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        // Renaming frees the old name.
        let patch = CompanyPatch {
            name: Some(CompanyName::parse("Initech").unwrap()),
            ..Default::default()
        };
        let renamed = store.update(other.id, patch).await.unwrap();
        assert_eq!(renamed.revision, 2);
        store.create(draft("Globex"), None).await.unwrap();
    }

    #[tokio::test]
    async fn delete_tombstones_and_releases_name() {
        let store = InMemoryCompanyStore::new();
        let company = store.create(draft("Acme"), None).await.unwrap().company;

        let tombstone = store.delete(company.id).await.unwrap();
        assert_eq!(tombstone.revision, 2);

        assert_eq!(store.get(company.id).await.unwrap_err(), StoreError::NotFound);
        assert_eq!(store.delete(company.id).await.unwrap_err(), StoreError::NotFound);
        assert_eq!(
            store
                .update(company.id, CompanyPatch::default())
                .await
                .unwrap_err(),
            StoreError::NotFound
        );

        let latest = store.latest(company.id).await.unwrap();
        assert!(latest.is_deleted());
        assert_eq!(latest.company, tombstone);

        assert!(store.list(Page::default()).await.unwrap().is_empty());
        store.create(draft("Acme"), None).await.unwrap();
    }

    #[tokio::test]
    async fn idempotent_create_replays_same_request() {
        let store = InMemoryCompanyStore::new();
        let first = store.create(draft("Acme"), Some(key("k-1"))).await.unwrap();
        let second = store.create(draft("Acme"), Some(key("k-1"))).await.unwrap();

        assert!(second.replayed);
        assert_eq!(second.company.id, first.company.id);
        assert_eq!(store.list(Page::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn idempotent_create_rejects_different_attributes() {
        let store = InMemoryCompanyStore::new();
        store.create(draft("Acme"), Some(key("k-1"))).await.unwrap();
        let err = store
            .create(draft("Globex"), Some(key("k-1")))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn idempotent_create_after_delete_is_a_conflict() {
        let store = InMemoryCompanyStore::new();
        let first = store.create(draft("Acme"), Some(key("k-1"))).await.unwrap();
        store.delete(first.company.id).await.unwrap();

        let err = store
            .create(draft("Acme"), Some(key("k-1")))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert!(store.list(Page::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_is_paged() {
        let store = InMemoryCompanyStore::new();
        for name in ["A", "B", "C"] {
            store.create(draft(name), None).await.unwrap();
        }
        let page = store.list(Page::new(Some(2), Some(1))).await.unwrap();
        assert_eq!(page.len(), 2);
        let all = store.list(Page::default()).await.unwrap();
        assert_eq!(page[0].id, all[1].id);
    }

    #[tokio::test]
    async fn injected_fault_is_consumed_once() {
        let store = InMemoryCompanyStore::new();
        store.inject(Fault::Fail(StoreError::Unavailable("down".to_string())));

        let err = store.create(draft("Acme"), None).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        store.create(draft("Acme"), None).await.unwrap();
        assert_eq!(store.calls(), 2);
    }
}
