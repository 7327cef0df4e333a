//! Company document store boundary.
//!
//! The trait is storage-agnostic; `in_memory` backs dev/tests and `postgres`
//! backs deployments (one JSONB document per company).

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryCompanyStore;
pub use postgres::PostgresCompanyStore;
pub use r#trait::{CompanyStore, Created, StoreError};
