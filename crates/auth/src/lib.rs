//! `companies-auth`: pure authentication/authorization boundary.
//!
//! This crate is intentionally decoupled from HTTP and storage.

pub mod authorize;
pub mod claims;
pub mod permissions;
pub mod principal;
pub mod roles;
pub mod verifier;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use authorize::{AuthzError, authorize, permissions_from_roles};
pub use claims::{JwtClaims, TokenValidationError, validate_claims};
pub use permissions::Permission;
pub use principal::Principal;
pub use roles::Role;
pub use jsonwebtoken::Algorithm;
pub use verifier::{JwtValidator, KeyError, PublicKeyValidator};
