//! `companies-core`: company domain model.
//!
//! This crate contains **pure domain** types and validation (no IO, no HTTP, no storage).

pub mod company;
pub mod error;
pub mod id;
pub mod page;

pub use company::{
    Company, CompanyDraft, CompanyName, CompanyPatch, CompanyRecord, CompanyType,
    MAX_DESCRIPTION_LEN, MAX_NAME_LEN,
};
pub use error::{DomainError, DomainResult};
pub use id::{CompanyId, IdempotencyKey};
pub use page::Page;
