//! Consumer-side deduplication for at-least-once delivery.

use std::collections::HashMap;

use companies_core::CompanyId;

use crate::ChangeEvent;

/// Tracks the highest sequence applied per subject.
///
/// An event is accepted only if its sequence is above everything already
/// applied for that subject. Because payloads are full snapshots, dropping an
/// older event that arrives late loses nothing.
#[derive(Debug, Default)]
pub struct EventDeduplicator {
    applied: HashMap<CompanyId, u64>,
}

impl EventDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the event should be applied.
    pub fn accept(&mut self, event: &ChangeEvent) -> bool {
        let last = self.applied.entry(event.subject_id()).or_insert(0);
        if event.sequence() <= *last {
            return false;
        }
        *last = event.sequence();
        true
    }

    pub fn last_applied(&self, subject_id: CompanyId) -> Option<u64> {
        self.applied.get(&subject_id).copied()
    }
}
