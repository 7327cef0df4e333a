//! Infrastructure layer: company store backends, broker publishers, and the
//! operation pipeline that ties them to the credential verifier.

pub mod company_service;
pub mod event_bus;
pub mod store;

pub use company_service::{CompanyService, Operation, ServiceError, ServicePolicy};
pub use store::{CompanyStore, Created, InMemoryCompanyStore, PostgresCompanyStore, StoreError};
