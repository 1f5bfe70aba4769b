//! Access-token signing and validation.
//!
//! Two tokens exist per authenticated session: a signed short-lived access
//! token (HS256, default 15 minutes) validated statelessly except for the
//! revocation check the session service performs, and an opaque
//! high-entropy refresh token generated here and stored on the session row.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto;
use crate::error::AuthError;

/// Default access-token lifetime.
pub const DEFAULT_ACCESS_TTL: Duration = Duration::from_secs(15 * 60);

/// Claims carried by an access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    /// User ID.
    pub sub: Uuid,
    /// Auth-session ID, checked against the session cache for revocation.
    pub sid: Uuid,
    pub iat: i64,
    pub exp: i64,
    /// Free-form claims (SSO enrichment, device info).
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Signs and validates access tokens with a symmetric key.
pub struct TokenSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl TokenSigner {
    /// Build a signer. The secret must be at least 32 bytes; config
    /// validation enforces that before we get here.
    #[must_use]
    pub fn new(secret: &[u8], ttl: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            ttl,
        }
    }

    /// Sign an access token for the given user and session.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Token`] if encoding fails.
    pub fn sign(
        &self,
        user_id: Uuid,
        session_id: Uuid,
        extra: HashMap<String, serde_json::Value>,
    ) -> Result<String, AuthError> {
        let now = Utc::now().timestamp();
        #[allow(clippy::cast_possible_wrap)]
        let claims = AccessClaims {
            sub: user_id,
            sid: session_id,
            iat: now,
            exp: now + self.ttl.as_secs() as i64,
            extra,
        };
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding).map_err(
            |e| AuthError::Token {
                reason: e.to_string(),
            },
        )
    }

    /// Validate a token's signature and expiry, returning its claims.
    ///
    /// This is the stateless half of validation; the caller still checks
    /// the session's revocation state.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Expired`] for an expired token and
    /// [`AuthError::Token`] for any other validation failure.
    pub fn verify(&self, token: &str) -> Result<AccessClaims, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        jsonwebtoken::decode::<AccessClaims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Token {
                    reason: e.to_string(),
                },
            })
    }
}

impl std::fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSigner")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

/// Generate a fresh opaque refresh token.
#[must_use]
pub fn generate_refresh_token() -> String {
    crypto::generate_token(crypto::DEFAULT_TOKEN_LEN)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn signer() -> TokenSigner {
        TokenSigner::new(&[7u8; 32], DEFAULT_ACCESS_TTL)
    }

    #[test]
    fn sign_verify_roundtrip() {
        let signer = signer();
        let user = Uuid::new_v4();
        let session = Uuid::new_v4();
        let token = signer.sign(user, session, HashMap::new()).unwrap();
        let claims = signer.verify(&token).unwrap();
        assert_eq!(claims.sub, user);
        assert_eq!(claims.sid, session);
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn wrong_key_fails_verification() {
        let token = signer()
            .sign(Uuid::new_v4(), Uuid::new_v4(), HashMap::new())
            .unwrap();
        let other = TokenSigner::new(&[9u8; 32], DEFAULT_ACCESS_TTL);
        assert!(matches!(
            other.verify(&token),
            Err(AuthError::Token { .. })
        ));
    }

    #[test]
    fn extra_claims_survive_the_roundtrip() {
        let signer = signer();
        let mut extra = HashMap::new();
        extra.insert(
            "sso_provider".to_owned(),
            serde_json::Value::String("oidc".to_owned()),
        );
        let token = signer
            .sign(Uuid::new_v4(), Uuid::new_v4(), extra)
            .unwrap();
        let claims = signer.verify(&token).unwrap();
        assert_eq!(
            claims.extra.get("sso_provider").and_then(|v| v.as_str()),
            Some("oidc")
        );
    }

    #[test]
    fn garbage_token_is_rejected() {
        assert!(signer().verify("not-a-jwt").is_err());
    }

    #[test]
    fn refresh_tokens_have_default_length() {
        let token = generate_refresh_token();
        assert_eq!(token.len(), 48);
    }
}
