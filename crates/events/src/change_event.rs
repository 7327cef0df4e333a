use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use companies_core::{Company, CompanyId, CompanyRecord};

/// What happened to the subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Created => "created",
            ChangeKind::Updated => "updated",
            ChangeKind::Deleted => "deleted",
        }
    }
}

impl core::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Consumer-side deduplication key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventKey {
    pub subject_id: CompanyId,
    pub sequence: u64,
}

/// Record of one committed company mutation, as published to the channel.
///
/// Notes:
/// - `sequence` is the company revision the mutation produced, so it is
///   assigned by the store and strictly increasing per subject.
/// - `event_id` is derived from `(subject_id, sequence)`: re-publishing the same
///   mutation yields an identical event.
/// - `payload` is a snapshot of the post-mutation document (the tombstone for
///   `deleted`).
///
/// Events are only ever built from state the store returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    event_id: Uuid,
    kind: ChangeKind,
    subject_id: CompanyId,
    sequence: u64,
    occurred_at: DateTime<Utc>,
    payload: Company,
}

impl ChangeEvent {
    /// Build the event for a mutation the store has just committed.
    pub fn committed(kind: ChangeKind, company: &Company) -> Self {
        Self {
            event_id: derive_event_id(company.id, company.revision),
            kind,
            subject_id: company.id,
            sequence: company.revision,
            occurred_at: company.updated_at,
            payload: company.clone(),
        }
    }

    /// Rebuild the event for the latest committed revision of a record.
    ///
    /// Yields the same event the original mutation produced, so it is safe to
    /// publish again (consumers deduplicate on [`EventKey`]).
    pub fn for_record(record: &CompanyRecord) -> Self {
        let kind = if record.is_deleted() {
            ChangeKind::Deleted
        } else if record.company.revision == 1 {
            ChangeKind::Created
        } else {
            ChangeKind::Updated
        };
        Self::committed(kind, &record.company)
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn kind(&self) -> ChangeKind {
        self.kind
    }

    pub fn subject_id(&self) -> CompanyId {
        self.subject_id
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn payload(&self) -> &Company {
        &self.payload
    }

    pub fn key(&self) -> EventKey {
        EventKey {
            subject_id: self.subject_id,
            sequence: self.sequence,
        }
    }
}

fn derive_event_id(subject_id: CompanyId, sequence: u64) -> Uuid {
    Uuid::new_v5(subject_id.as_uuid(), &sequence.to_be_bytes())
}
