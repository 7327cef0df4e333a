use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::CompanyId;

/// Maximum number of characters in a company name.
pub const MAX_NAME_LEN: usize = 15;

/// Maximum number of characters in a company description.
pub const MAX_DESCRIPTION_LEN: usize = 3000;

/// Company name (trimmed, non-empty, at most [`MAX_NAME_LEN`] characters).
///
/// Names are unique among live companies; uniqueness is enforced by the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CompanyName(String);

impl CompanyName {
    pub fn parse(raw: impl Into<String>) -> DomainResult<Self> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(DomainError::validation("name must not be empty"));
        }
        if trimmed.chars().count() > MAX_NAME_LEN {
            return Err(DomainError::validation(format!(
                "name must be at most {MAX_NAME_LEN} characters"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for CompanyName {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<CompanyName> for String {
    fn from(value: CompanyName) -> Self {
        value.0
    }
}

impl core::fmt::Display for CompanyName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Legal form of a company.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompanyType {
    Corporations,
    NonProfit,
    Cooperative,
    SoleProprietorship,
}

impl CompanyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompanyType::Corporations => "corporations",
            CompanyType::NonProfit => "non_profit",
            CompanyType::Cooperative => "cooperative",
            CompanyType::SoleProprietorship => "sole_proprietorship",
        }
    }
}

fn validate_description(description: Option<&str>) -> DomainResult<()> {
    match description {
        Some(d) if d.chars().count() > MAX_DESCRIPTION_LEN => Err(DomainError::validation(
            format!("description must be at most {MAX_DESCRIPTION_LEN} characters"),
        )),
        _ => Ok(()),
    }
}

/// Caller-supplied attributes for a new company (also used for full replacement).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyDraft {
    pub name: CompanyName,
    #[serde(default)]
    pub description: Option<String>,
    pub employees: u32,
    pub registered: bool,
    #[serde(rename = "type")]
    pub kind: CompanyType,
}

impl CompanyDraft {
    pub fn validate(&self) -> DomainResult<()> {
        validate_description(self.description.as_deref())
    }
}

/// Partial update. `None` keeps the current value.
///
/// `description: Some(None)` clears the description.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompanyPatch {
    pub name: Option<CompanyName>,
    pub description: Option<Option<String>>,
    pub employees: Option<u32>,
    pub registered: Option<bool>,
    pub kind: Option<CompanyType>,
}

impl CompanyPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.employees.is_none()
            && self.registered.is_none()
            && self.kind.is_none()
    }
}

impl From<CompanyDraft> for CompanyPatch {
    fn from(draft: CompanyDraft) -> Self {
        Self {
            name: Some(draft.name),
            description: Some(draft.description),
            employees: Some(draft.employees),
            registered: Some(draft.registered),
            kind: Some(draft.kind),
        }
    }
}

/// The persisted company document.
///
/// `revision` starts at 1 and is bumped by every committed mutation (including
/// the delete tombstone). It doubles as the change-event sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Company {
    pub id: CompanyId,
    pub name: CompanyName,
    pub description: Option<String>,
    pub employees: u32,
    pub registered: bool,
    #[serde(rename = "type")]
    pub kind: CompanyType,
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Company {
    /// Build revision 1 of a new company.
    pub fn create(id: CompanyId, draft: CompanyDraft, now: DateTime<Utc>) -> DomainResult<Self> {
        draft.validate()?;
        Ok(Self {
            id,
            name: draft.name,
            description: draft.description,
            employees: draft.employees,
            registered: draft.registered,
            kind: draft.kind,
            revision: 1,
            created_at: now,
            updated_at: now,
        })
    }

    /// Compute the next revision with `patch` applied. Does not mutate `self`.
    pub fn patched(&self, patch: &CompanyPatch, now: DateTime<Utc>) -> DomainResult<Self> {
        let mut next = self.clone();
        if let Some(name) = &patch.name {
            next.name = name.clone();
        }
        if let Some(description) = &patch.description {
            validate_description(description.as_deref())?;
            next.description = description.clone();
        }
        if let Some(employees) = patch.employees {
            next.employees = employees;
        }
        if let Some(registered) = patch.registered {
            next.registered = registered;
        }
        if let Some(kind) = patch.kind {
            next.kind = kind;
        }
        next.revision = self.revision + 1;
        next.updated_at = now;
        Ok(next)
    }

    /// The final revision written when the company is deleted.
    pub fn tombstoned(&self, now: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        next.revision = self.revision + 1;
        next.updated_at = now;
        next
    }
}

/// Latest stored state of a company, tombstones included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyRecord {
    pub company: Company,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl CompanyRecord {
    pub fn live(company: Company) -> Self {
        Self {
            company,
            deleted_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}
