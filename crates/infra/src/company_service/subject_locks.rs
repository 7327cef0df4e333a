use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use companies_core::CompanyId;

/// Per-company async locks.
///
/// Held across Mutating and Emitting so that, within this process, events for
/// one company are published in the order their mutations committed. Entries
/// are removed once no task holds or waits for them, including waiters that
/// were cancelled before they got the lock.
#[derive(Debug, Default, Clone)]
pub struct SubjectLocks {
    inner: Arc<Mutex<HashMap<CompanyId, Arc<AsyncMutex<()>>>>>,
}

/// Releases the company's lock on drop.
#[derive(Debug)]
pub struct SubjectGuard {
    // Field order matters: the lock is released before the entry is checked.
    _guard: OwnedMutexGuard<()>,
    _release: Release,
}

type Acquire = Pin<Box<dyn Future<Output = OwnedMutexGuard<()>> + Send>>;

/// An in-progress `lock` call.
struct Waiting {
    acquire: Acquire,
    release: Release,
}

/// Removes the map entry for `id` when dropped, if nothing else refers to it.
#[derive(Debug)]
struct Release {
    id: CompanyId,
    locks: SubjectLocks,
}

impl SubjectLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> MutexGuard<'_, HashMap<CompanyId, Arc<AsyncMutex<()>>>> {
        // The map is only touched in short non-panicking sections.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub async fn lock(&self, id: CompanyId) -> SubjectGuard {
        let mutex = self.map().entry(id).or_default().clone();
        let mut waiting = Waiting {
            acquire: Box::pin(mutex.lock_owned()),
            release: Release {
                id,
                locks: self.clone(),
            },
        };
        let guard = (&mut waiting.acquire).await;
        SubjectGuard {
            _guard: guard,
            _release: waiting.release,
        }
    }

    /// Number of companies with a held or awaited lock.
    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for Release {
    fn drop(&mut self) {
        let mut map = self.locks.map();
        if let Some(mutex) = map.get(&self.id) {
            // Clones are only made under the map lock, so a count of one means
            // nobody else holds or waits for this entry.
            if Arc::strong_count(mutex) == 1 {
                map.remove(&self.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_subject_is_serialized() {
        let locks = SubjectLocks::new();
        let id = CompanyId::new();

        let first = locks.lock(id).await;
        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock(id).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(first);
        contender.await.unwrap();
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn cancelled_waiter_does_not_leak_its_entry() {
        let locks = SubjectLocks::new();
        let id = CompanyId::new();

        let first = locks.lock(id).await;
        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock(id).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        drop(first);
        waiter.abort();
        let _ = waiter.await;

        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn different_subjects_do_not_block() {
        let locks = SubjectLocks::new();
        let _a = locks.lock(CompanyId::new()).await;
        let _b = tokio::time::timeout(Duration::from_millis(50), locks.lock(CompanyId::new()))
            .await
            .unwrap();
        assert_eq!(locks.len(), 2);
    }
}
