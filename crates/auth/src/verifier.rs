//! Signature verification for bearer tokens.

use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use thiserror::Error;
use tracing::debug;

use crate::{JwtClaims, TokenValidationError, validate_claims};

/// Verifies a signed token and yields its claims.
///
/// Implementations are pure given their configured key material, and must be
/// safe to share across request tasks.
pub trait JwtValidator: Send + Sync {
    fn validate(&self, token: &str, now: DateTime<Utc>) -> Result<JwtClaims, TokenValidationError>;
}

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("symmetric algorithm {0:?} cannot be used with a public key")]
    SymmetricAlgorithm(Algorithm),

    #[error("invalid public key: {0}")]
    InvalidKey(String),
}

/// Asymmetric JWT validator backed by a single, process-wide public key.
///
/// Time checks are done by [`validate_claims`] against the caller-supplied `now`,
/// so jsonwebtoken's own clock-based `exp` check is disabled.
pub struct PublicKeyValidator {
    key: DecodingKey,
    validation: Validation,
}

impl PublicKeyValidator {
    /// Build a validator from a PEM-encoded public key.
    ///
    /// RSA (`RS*`/`PS*`), EC (`ES*`) and Ed25519 (`EdDSA`) keys are accepted.
    pub fn from_pem(algorithm: Algorithm, pem: &[u8]) -> Result<Self, KeyError> {
        let key = match algorithm {
            Algorithm::RS256
            | Algorithm::RS384
            | Algorithm::RS512
            | Algorithm::PS256
            | Algorithm::PS384
            | Algorithm::PS512 => DecodingKey::from_rsa_pem(pem),
            Algorithm::ES256 | Algorithm::ES384 => DecodingKey::from_ec_pem(pem),
            Algorithm::EdDSA => DecodingKey::from_ed_pem(pem),
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
                return Err(KeyError::SymmetricAlgorithm(algorithm));
            }
        }
        .map_err(|e| KeyError::InvalidKey(e.to_string()))?;

        let mut validation = Validation::new(algorithm);
        validation.validate_exp = false;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Ok(Self { key, validation })
    }
}

impl core::fmt::Debug for PublicKeyValidator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PublicKeyValidator")
            .field("algorithms", &self.validation.algorithms)
            .finish_non_exhaustive()
    }
}

impl JwtValidator for PublicKeyValidator {
    fn validate(&self, token: &str, now: DateTime<Utc>) -> Result<JwtClaims, TokenValidationError> {
        let data = jsonwebtoken::decode::<JwtClaims>(token, &self.key, &self.validation)
            .map_err(|e| {
                debug!(error = %e, "token failed signature verification");
                match e.kind() {
                    ErrorKind::InvalidSignature => TokenValidationError::BadSignature,
                    ErrorKind::ExpiredSignature => TokenValidationError::Expired,
                    _ => TokenValidationError::Malformed(e.to_string()),
                }
            })?;

        if let Err(err) = validate_claims(&data.claims, now) {
            debug!(subject = %data.claims.sub, error = %err, "token claims rejected");
            return Err(err);
        }
        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, TEST_PUBLIC_KEY_PEM};
    use crate::{Permission, Role};
    use chrono::Duration;
    use jsonwebtoken::{EncodingKey, Header};

    fn validator() -> PublicKeyValidator {
        PublicKeyValidator::from_pem(Algorithm::EdDSA, TEST_PUBLIC_KEY_PEM.as_bytes()).unwrap()
    }

    #[test]
    fn accepts_token_signed_by_matching_key() {
        let token = testing::mint(vec![Permission::COMPANIES_WRITE], vec![Role::new("ops")]);
        let claims = validator().validate(&token, Utc::now()).unwrap();
        assert_eq!(claims.sub, testing::TEST_SUBJECT);
        assert_eq!(claims.scopes, vec![Permission::COMPANIES_WRITE]);
    }

    #[test]
    fn rejects_token_signed_by_other_key() {
        let token = testing::mint_with_key(
            testing::OTHER_PRIVATE_KEY_PEM,
            testing::claims(vec![Permission::COMPANIES_WRITE], vec![]),
        );
        assert_eq!(
            validator().validate(&token, Utc::now()),
            Err(TokenValidationError::BadSignature)
        );
    }

    #[test]
    fn rejects_expired_token() {
        let mut claims = testing::claims(vec![Permission::COMPANIES_READ], vec![]);
        claims.issued_at = Utc::now() - Duration::hours(2);
        claims.expires_at = Utc::now() - Duration::hours(1);
        let token = testing::mint_claims(claims);
        assert_eq!(
            validator().validate(&token, Utc::now()),
            Err(TokenValidationError::Expired)
        );
    }

    #[test]
    fn rejects_garbage_and_wrong_algorithm() {
        assert!(matches!(
            validator().validate("not.a.jwt", Utc::now()),
            Err(TokenValidationError::Malformed(_))
        ));

        let hs = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &testing::claims(vec![Permission::WILDCARD], vec![]),
            &EncodingKey::from_secret(b"guessable"),
        )
        .unwrap();
        assert!(matches!(
            validator().validate(&hs, Utc::now()),
            Err(TokenValidationError::Malformed(_))
        ));
    }

    #[test]
    fn refuses_symmetric_algorithms_and_bad_pem() {
        assert!(matches!(
            PublicKeyValidator::from_pem(Algorithm::HS256, b"secret"),
            Err(KeyError::SymmetricAlgorithm(Algorithm::HS256))
        ));
        assert!(matches!(
            PublicKeyValidator::from_pem(Algorithm::RS256, b"-----BEGIN NOTHING-----"),
            Err(KeyError::InvalidKey(_))
        ));
    }
}
