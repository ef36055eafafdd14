/// Token Issuer
///
/// Mints access/refresh pairs. Access tokens are signed and stateless;
/// refresh tokens are persisted through the store, which rejects a duplicate
/// digest. A collision is answered with a fresh token, never an overwrite.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use crate::auth::claims::Claims;
use crate::auth::jwt::{generate_access_token, validate_access_token, AccessToken};
use crate::auth::refresh_token::{generate_refresh_token, hash_refresh_token};
use crate::configuration::JwtSettings;
use crate::error::{AppError, AuthError, StoreError, UniqueKey};
use crate::store::{AuthStore, Identity, NewRefreshToken, RefreshTokenRecord};

const MAX_ISSUE_ATTEMPTS: usize = 3;

/// A refresh token as handed to the client, with its stored record
#[derive(Debug, Clone)]
pub struct IssuedRefreshToken {
    pub token: String,
    pub record: RefreshTokenRecord,
}

/// Access and refresh token issued together
#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access: AccessToken,
    pub refresh: IssuedRefreshToken,
}

#[derive(Clone)]
pub struct TokenIssuer {
    jwt: JwtSettings,
    store: Arc<dyn AuthStore>,
}

impl TokenIssuer {
    pub fn new(jwt: JwtSettings, store: Arc<dyn AuthStore>) -> Self {
        Self { jwt, store }
    }

    pub fn settings(&self) -> &JwtSettings {
        &self.jwt
    }

    pub fn issue_access_token(&self, identity: &Identity) -> Result<AccessToken, AppError> {
        generate_access_token(identity.id, &identity.username, &self.jwt)
    }

    pub fn verify_access_token(&self, token: &str) -> Result<Claims, AuthError> {
        validate_access_token(token, &self.jwt)
    }

    /// Generate and persist a refresh token for `identity`
    pub async fn issue_refresh_token(
        &self,
        identity: &Identity,
    ) -> Result<IssuedRefreshToken, AppError> {
        for attempt in 1..=MAX_ISSUE_ATTEMPTS {
            let (token, new) = self.new_refresh_token(identity, Utc::now());
            match self.store.insert_refresh_token(new).await {
                Ok(record) => return Ok(IssuedRefreshToken { token, record }),
                Err(StoreError::UniqueViolation(UniqueKey::RefreshToken)) => {
                    tracing::warn!(attempt, "Refresh token collision, regenerating");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(AppError::Internal(
            "Could not generate a unique refresh token".to_string(),
        ))
    }

    pub async fn issue_pair(&self, identity: &Identity) -> Result<TokenPair, AppError> {
        let access = self.issue_access_token(identity)?;
        let refresh = self.issue_refresh_token(identity).await?;
        Ok(TokenPair { access, refresh })
    }

    /// Exchange `old` for a new pair bound to the same identity
    ///
    /// Returns `None` when `old` was consumed first by someone else.
    pub async fn rotate(
        &self,
        old: &RefreshTokenRecord,
        identity: &Identity,
    ) -> Result<Option<TokenPair>, AppError> {
        for attempt in 1..=MAX_ISSUE_ATTEMPTS {
            let (token, new) = self.new_refresh_token(identity, Utc::now());
            match self.store.rotate_refresh_token(old.id, new).await {
                Ok(Some(record)) => {
                    let access = self.issue_access_token(identity)?;
                    return Ok(Some(TokenPair {
                        access,
                        refresh: IssuedRefreshToken { token, record },
                    }));
                }
                Ok(None) => return Ok(None),
                Err(StoreError::UniqueViolation(UniqueKey::RefreshToken)) => {
                    tracing::warn!(attempt, "Refresh token collision during rotation, regenerating");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(AppError::Internal(
            "Could not generate a unique refresh token".to_string(),
        ))
    }

    fn new_refresh_token(
        &self,
        identity: &Identity,
        now: DateTime<Utc>,
    ) -> (String, NewRefreshToken) {
        let token = generate_refresh_token();
        let new = NewRefreshToken {
            identity_id: identity.id,
            token_hash: hash_refresh_token(&token),
            issued_at: now,
            expires_at: now + Duration::days(self.jwt.refresh_token_expiry_days),
        };
        (token, new)
    }
}
