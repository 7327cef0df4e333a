use crate::{JwtClaims, Permission, Role};

/// An authenticated caller, derived from verified claims for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub subject: String,
    pub scopes: Vec<Permission>,
    pub roles: Vec<Role>,
}

impl Principal {
    pub fn from_claims(claims: JwtClaims) -> Self {
        Self {
            subject: claims.sub,
            scopes: claims.scopes,
            roles: claims.roles,
        }
    }
}
