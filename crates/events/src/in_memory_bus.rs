//! In-memory event bus for tests/dev.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, mpsc};

use async_trait::async_trait;
use tracing::debug;

use crate::bus::{EventPublisher, PublishError, Subscription};
use crate::ChangeEvent;

/// In-memory pub/sub bus.
///
/// - No IO
/// - Fan-out to every live subscriber
/// - Outage switch (`set_available`, `fail_next`) to exercise the emit-failure path
#[derive(Debug)]
pub struct InMemoryEventBus {
    subscribers: Mutex<Vec<mpsc::Sender<ChangeEvent>>>,
    available: AtomicBool,
    fail_next: AtomicU32,
    attempts: AtomicU32,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription<ChangeEvent> {
        let (tx, rx) = mpsc::channel();

        // A poisoned lock still yields a subscription; it just never receives.
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }

        Subscription::new(rx)
    }

    /// Simulate a broker outage (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Reject the next `n` publish attempts, then recover.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Total publish attempts seen, including rejected ones.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            available: AtomicBool::new(true),
            fail_next: AtomicU32::new(0),
            attempts: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventBus {
    async fn publish(&self, event: &ChangeEvent) -> Result<(), PublishError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if !self.available.load(Ordering::SeqCst) {
            return Err(PublishError::Unavailable("in-memory bus is down".to_string()));
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(PublishError::Unavailable("injected publish failure".to_string()));
        }

        let mut subs = self
            .subscribers
            .lock()
            .map_err(|_| PublishError::Unavailable("subscriber lock poisoned".to_string()))?;

        // Drop any dead subscribers while publishing.
        subs.retain(|tx| tx.send(event.clone()).is_ok());
        debug!(
            subject_id = %event.subject_id(),
            sequence = event.sequence(),
            kind = %event.kind(),
            subscribers = subs.len(),
            "event published"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use companies_core::{Company, CompanyDraft, CompanyId, CompanyName, CompanyType};

    use crate::ChangeKind;

    fn event() -> ChangeEvent {
        let draft = CompanyDraft {
            name: CompanyName::parse("Acme").unwrap(),
            description: None,
            employees: 1,
            registered: false,
            kind: CompanyType::NonProfit,
        };
        let c = Company::create(CompanyId::new(), draft, Utc::now()).unwrap();
        ChangeEvent::committed(ChangeKind::Created, &c)
    }

    #[tokio::test]
    async fn fans_out_to_all_subscribers() {
        let bus = InMemoryEventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();
        let ev = event();

        bus.publish(&ev).await.unwrap();

        assert_eq!(a.drain(), vec![ev.clone()]);
        assert_eq!(b.drain(), vec![ev]);
    }

    #[tokio::test]
    async fn outage_rejects_until_recovered() {
        let bus = InMemoryEventBus::new();
        let sub = bus.subscribe();
        let ev = event();

        bus.set_available(false);
        assert!(matches!(bus.publish(&ev).await, Err(PublishError::Unavailable(_))));
        assert!(sub.drain().is_empty());

        bus.set_available(true);
        bus.publish(&ev).await.unwrap();
        assert_eq!(sub.drain().len(), 1);
        assert_eq!(bus.attempts(), 2);
    }

    #[tokio::test]
    async fn fail_next_is_consumed() {
        let bus = InMemoryEventBus::new();
        bus.fail_next(2);
        let ev = event();
        assert!(bus.publish(&ev).await.is_err());
        assert!(bus.publish(&ev).await.is_err());
        assert!(bus.publish(&ev).await.is_ok());
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let bus = InMemoryEventBus::new();
        drop(bus.subscribe());
        let live = bus.subscribe();
        bus.publish(&event()).await.unwrap();
        assert_eq!(live.drain().len(), 1);
        assert_eq!(bus.subscribers.lock().unwrap().len(), 1);
    }
}
