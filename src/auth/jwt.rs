/// JWT Token Generation and Validation
///
/// Access tokens are HS256-signed and verified statelessly. They cannot be
/// revoked before `exp`.

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use uuid::Uuid;

use crate::auth::claims::Claims;
use crate::configuration::JwtSettings;
use crate::error::{AppError, AuthError};

/// A signed access token and the facts a response needs about it
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    pub token_id: String,
    pub expires_at: DateTime<Utc>,
}

/// Generate a new access token for an identity
///
/// # Errors
/// Returns error if token encoding fails
pub fn generate_access_token(
    identity_id: Uuid,
    username: &str,
    config: &JwtSettings,
) -> Result<AccessToken, AppError> {
    let claims = Claims::new(
        identity_id,
        username.to_string(),
        config.access_token_expiry_minutes * 60,
        config.issuer.clone(),
        config.audience.clone(),
    );

    let token = encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(config.secret.as_bytes()),
    )
    .map_err(|e| AppError::Internal(format!("Token generation failed: {}", e)))?;

    let expires_at = Utc
        .timestamp_opt(claims.exp, 0)
        .single()
        .ok_or_else(|| AppError::Internal("Token expiry out of range".to_string()))?;

    Ok(AccessToken {
        token,
        token_id: claims.jti,
        expires_at,
    })
}

/// Validate and extract claims from an access token
///
/// Checks signature, issuer, audience and expiry.
///
/// # Errors
/// `ExpiredToken` once `exp` has passed, `InvalidToken` for anything else
pub fn validate_access_token(token: &str, config: &JwtSettings) -> Result<Claims, AuthError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_issuer(&[&config.issuer]);
    validation.set_audience(&[&config.audience]);

    decode::<Claims>(
        token,
        &DecodingKey::from_secret(config.secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|e| {
        tracing::warn!("JWT validation error: {}", e);
        match e.kind() {
            ErrorKind::ExpiredSignature => AuthError::ExpiredToken,
            _ => AuthError::InvalidToken,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get_test_config() -> JwtSettings {
        JwtSettings {
            secret: "test-secret-key-at-least-32-characters-long".to_string(),
            issuer: "test".to_string(),
            audience: "test-clients".to_string(),
            access_token_expiry_minutes: 15,
            refresh_token_expiry_days: 7,
        }
    }

    #[test]
    fn test_generate_and_validate_token() {
        let config = get_test_config();
        let identity_id = Uuid::new_v4();

        let access = generate_access_token(identity_id, "alice", &config)
            .expect("Failed to generate token");
        let claims = validate_access_token(&access.token, &config).expect("Failed to validate token");

        assert_eq!(claims.sub, identity_id.to_string());
        assert_eq!(claims.username, "alice");
        assert_eq!(claims.jti, access.token_id);
        assert_eq!(claims.exp, access.expires_at.timestamp());
    }

    #[test]
    fn test_lifetime_is_configured_minutes() {
        let config = get_test_config();
        let access = generate_access_token(Uuid::new_v4(), "alice", &config).unwrap();

        let remaining = access.expires_at - Utc::now();
        assert!(remaining <= chrono::Duration::minutes(15));
        assert!(remaining > chrono::Duration::minutes(14));
    }

    #[test]
    fn test_invalid_token() {
        let config = get_test_config();
        let result = validate_access_token("invalid.token.here", &config);

        assert_eq!(result.unwrap_err(), AuthError::InvalidToken);
    }

    #[test]
    fn test_tampered_token() {
        let config = get_test_config();
        let access = generate_access_token(Uuid::new_v4(), "alice", &config).unwrap();

        let tampered = format!("{}X", access.token);
        assert!(validate_access_token(&tampered, &config).is_err());
    }

    #[test]
    fn test_wrong_issuer() {
        let mut config = get_test_config();
        let access = generate_access_token(Uuid::new_v4(), "alice", &config).unwrap();

        config.issuer = "wrong-issuer".to_string();
        assert_eq!(
            validate_access_token(&access.token, &config).unwrap_err(),
            AuthError::InvalidToken
        );
    }

    #[test]
    fn test_wrong_audience() {
        let mut config = get_test_config();
        let access = generate_access_token(Uuid::new_v4(), "alice", &config).unwrap();

        config.audience = "someone-else".to_string();
        assert!(validate_access_token(&access.token, &config).is_err());
    }

    #[test]
    fn test_expired_token() {
        let mut config = get_test_config();
        // Past the default 60s validation leeway
        config.access_token_expiry_minutes = -5;
        let access = generate_access_token(Uuid::new_v4(), "alice", &config).unwrap();

        assert_eq!(
            validate_access_token(&access.token, &config).unwrap_err(),
            AuthError::ExpiredToken
        );
    }
}
