use std::collections::HashSet;

use thiserror::Error;

use crate::{Permission, Principal, Role};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthzError {
    #[error("forbidden: missing permission '{0}'")]
    Forbidden(String),
}

/// Authorize a principal for one permission.
///
/// - No IO
/// - No panics
/// - No business logic (pure policy check)
pub fn authorize(principal: &Principal, required: &Permission) -> Result<(), AuthzError> {
    let role_grants = permissions_from_roles(&principal.roles);
    let perms: HashSet<&str> = principal
        .scopes
        .iter()
        .chain(role_grants.iter())
        .map(|p| p.as_str())
        .collect();

    if perms.contains("*") || perms.contains(required.as_str()) {
        Ok(())
    } else {
        Err(AuthzError::Forbidden(required.as_str().to_string()))
    }
}

/// Static role→permission mapping.
///
/// Convention: "admin" grants all permissions. Unknown roles grant nothing.
pub fn permissions_from_roles(roles: &[Role]) -> Vec<Permission> {
    if roles.iter().any(|r| r == &Role::ADMIN) {
        return vec![Permission::WILDCARD];
    }
    if roles.iter().any(|r| r.as_str() == "viewer") {
        return vec![Permission::COMPANIES_READ];
    }
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn principal(scopes: Vec<Permission>, roles: Vec<Role>) -> Principal {
        Principal {
            subject: "caller".to_string(),
            scopes,
            roles,
        }
    }

    #[test]
    fn scope_grants_exact_permission_only() {
        let p = principal(vec![Permission::COMPANIES_READ], vec![]);
        assert!(authorize(&p, &Permission::COMPANIES_READ).is_ok());
        assert_eq!(
            authorize(&p, &Permission::COMPANIES_WRITE),
            Err(AuthzError::Forbidden("companies.write".to_string()))
        );
    }

    #[test]
    fn admin_role_grants_everything() {
        let p = principal(vec![], vec![Role::ADMIN]);
        assert!(authorize(&p, &Permission::COMPANIES_WRITE).is_ok());
        assert!(authorize(&p, &Permission::new("anything.else")).is_ok());
    }

    #[test]
    fn viewer_role_reads_but_cannot_write() {
        let p = principal(vec![], vec![Role::new("viewer")]);
        assert!(authorize(&p, &Permission::COMPANIES_READ).is_ok());
        assert!(authorize(&p, &Permission::COMPANIES_WRITE).is_err());
    }

    #[test]
    fn no_grants_means_forbidden() {
        let p = principal(vec![], vec![Role::new("intern")]);
        assert!(authorize(&p, &Permission::COMPANIES_READ).is_err());
    }
}
