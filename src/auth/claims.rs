/// JWT Claims structure
///
/// Represents the payload of an access token: the identity it asserts plus
/// the standard JWT claims (RFC 7519).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AuthError;

/// JWT Claims for access tokens
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// Subject (identity ID as UUID string)
    pub sub: String,
    pub username: String,
    /// Unique token id, for tracing a token through logs
    pub jti: String,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    pub iss: String,
    pub aud: String,
}

impl Claims {
    /// Create claims for one access token
    ///
    /// # Arguments
    /// * `identity_id` - Subject of the token
    /// * `username` - Subject's username
    /// * `expiry_seconds` - Token lifetime in seconds from now
    /// * `issuer` / `audience` - Values downstream verifiers expect
    pub fn new(
        identity_id: Uuid,
        username: String,
        expiry_seconds: i64,
        issuer: String,
        audience: String,
    ) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            sub: identity_id.to_string(),
            username,
            jti: Uuid::new_v4().to_string(),
            exp: now + expiry_seconds,
            iat: now,
            iss: issuer,
            aud: audience,
        }
    }

    /// Extract identity ID from claims
    ///
    /// # Errors
    /// Returns `InvalidToken` if the subject is not a valid UUID
    pub fn identity_id(&self) -> Result<Uuid, AuthError> {
        Uuid::parse_str(&self.sub).map_err(|_| AuthError::InvalidToken)
    }

    pub fn is_expired(&self) -> bool {
        let now = chrono::Utc::now().timestamp();
        self.exp < now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims_for(identity_id: Uuid) -> Claims {
        Claims::new(
            identity_id,
            "alice".to_string(),
            3600,
            "test".to_string(),
            "test-clients".to_string(),
        )
    }

    #[test]
    fn test_claims_creation() {
        let identity_id = Uuid::new_v4();
        let claims = claims_for(identity_id);

        assert_eq!(claims.sub, identity_id.to_string());
        assert_eq!(claims.username, "alice");
        assert_eq!(claims.iss, "test");
        assert_eq!(claims.aud, "test-clients");
        assert!(!claims.is_expired());
    }

    #[test]
    fn test_each_token_gets_its_own_id() {
        let identity_id = Uuid::new_v4();
        assert_ne!(claims_for(identity_id).jti, claims_for(identity_id).jti);
    }

    #[test]
    fn test_identity_id_extraction() {
        let identity_id = Uuid::new_v4();
        assert_eq!(claims_for(identity_id).identity_id().unwrap(), identity_id);
    }

    #[test]
    fn test_invalid_identity_id() {
        let mut claims = claims_for(Uuid::new_v4());
        claims.sub = "invalid-uuid".to_string();

        assert_eq!(claims.identity_id().unwrap_err(), AuthError::InvalidToken);
    }
}
