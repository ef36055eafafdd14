/// Authentication Service
///
/// Orchestrates the session life cycle over the hasher, the token issuer and
/// the store:
///
/// `Anonymous -> Authenticated` via `login` / `register`,
/// `Authenticated -> Authenticated` via `refresh` (the presented refresh token
/// becomes terminal), and back to `Anonymous` when a refresh fails or on
/// `logout`. There is no grace window: a rotated token is dead even if the
/// client never received the replacement.

use chrono::{Duration, Utc};
use std::sync::Arc;
use tokio::sync::OnceCell;
use uuid::Uuid;

use crate::auth::issuer::{TokenIssuer, TokenPair};
use crate::auth::password::PasswordHasher;
use crate::auth::refresh_token::hash_refresh_token;
use crate::configuration::{AuthSettings, JwtSettings};
use crate::error::{AppError, AuthError, StoreError, UniqueKey};
use crate::store::{AuthStore, Identity, NewIdentity, Revocation};

const DEMO_USERNAME: &str = "demo";
const DEMO_PASSWORD: &str = "demo123";
const DEMO_EMAIL: &str = "demo@localhost";

/// Verified against when the username is unknown, so that path pays for a
/// bcrypt verification like a wrong password does
const TIMING_DECOY_PASSWORD: &str = "timing-decoy-password";

/// Minimum gap between two `last_active_at` writes for the same identity
const ACTIVITY_THRESHOLD_MINUTES: i64 = 15;

/// Outcome of a successful login, registration or refresh
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub identity: Identity,
    pub tokens: TokenPair,
}

#[derive(Clone)]
pub struct AuthenticationService {
    store: Arc<dyn AuthStore>,
    hasher: PasswordHasher,
    issuer: TokenIssuer,
    settings: AuthSettings,
    /// Hash of `TIMING_DECOY_PASSWORD` at the configured cost, built on first use
    decoy_hash: Arc<OnceCell<String>>,
}

impl AuthenticationService {
    pub fn new(store: Arc<dyn AuthStore>, jwt: JwtSettings, settings: AuthSettings) -> Self {
        let hasher = PasswordHasher::new(settings.password_hash_cost);
        let issuer = TokenIssuer::new(jwt, store.clone());
        Self {
            store,
            hasher,
            issuer,
            settings,
            decoy_hash: Arc::new(OnceCell::new()),
        }
    }

    pub fn jwt_settings(&self) -> &JwtSettings {
        self.issuer.settings()
    }

    /// Authenticate with username and password
    ///
    /// # Errors
    /// `InvalidCredentials` for an unknown username and for a wrong password alike
    pub async fn login(&self, username: &str, password: &str) -> Result<AuthSession, AppError> {
        let found = self.store.find_identity_by_username(username).await?;

        let mut identity = match found {
            Some(identity) => {
                if !self.verify_password(password, &identity.password_hash).await? {
                    tracing::warn!(identity_id = %identity.id, "Password verification failed");
                    return Err(AuthError::InvalidCredentials.into());
                }
                identity
            }
            None if self.is_demo_login(username, password) => self.provision_demo_account().await?,
            None => {
                self.verify_against_decoy(password).await?;
                tracing::warn!("Login attempt for unknown username");
                return Err(AuthError::InvalidCredentials.into());
            }
        };

        let now = Utc::now();
        self.store.record_login(identity.id, now).await?;
        identity.last_login_at = Some(now);
        identity.last_active_at = Some(now);

        let tokens = self.issuer.issue_pair(&identity).await?;
        tracing::info!(
            identity_id = %identity.id,
            token_id = %tokens.access.token_id,
            "Identity logged in"
        );
        Ok(AuthSession { identity, tokens })
    }

    /// Create an identity and sign it in
    ///
    /// Inputs are expected to have passed `validators::validate_registration`.
    ///
    /// # Errors
    /// `DuplicateUsername` / `DuplicateEmail` when the store's unique keys reject
    /// the insert; no identity is created in that case
    pub async fn register(
        &self,
        username: &str,
        email: &str,
        password: &str,
    ) -> Result<AuthSession, AppError> {
        let password_hash = self.hash_password(password).await?;

        let identity = self
            .store
            .create_identity(NewIdentity {
                username: username.to_string(),
                email: email.to_string(),
                password_hash,
            })
            .await
            .map_err(|e| -> AppError {
                match e {
                    StoreError::UniqueViolation(UniqueKey::Username) => {
                        AuthError::DuplicateUsername.into()
                    }
                    StoreError::UniqueViolation(UniqueKey::Email) => AuthError::DuplicateEmail.into(),
                    other => other.into(),
                }
            })?;

        let tokens = self.issuer.issue_pair(&identity).await?;
        tracing::info!(identity_id = %identity.id, "Identity registered");
        Ok(AuthSession { identity, tokens })
    }

    /// Exchange a refresh token for a new pair
    ///
    /// # Errors
    /// - `InvalidToken`: unknown token, token already used, or lost a concurrent exchange
    /// - `ExpiredToken`: past expiry (the record is consumed as a side effect)
    /// - `RevokedToken`: revoked by logout or a password change
    pub async fn refresh(&self, refresh_token: &str) -> Result<AuthSession, AppError> {
        let token_hash = hash_refresh_token(refresh_token);
        let lookup = self
            .store
            .lookup_refresh_token(&token_hash)
            .await?
            .ok_or_else(|| {
                tracing::warn!("Refresh token not found");
                AuthError::InvalidToken
            })?;
        let record = lookup.record;
        let identity = lookup.identity;
        let now = Utc::now();

        if !record.is_valid_at(now) {
            if record.is_expired_at(now) {
                if !record.consumed {
                    self.store
                        .consume_refresh_token(record.id, Revocation::Expired, now)
                        .await?;
                }
                tracing::info!(identity_id = %identity.id, "Refresh token expired");
                return Err(AuthError::ExpiredToken.into());
            }

            let explicit = record.revocation.map_or(false, |r| r.is_explicit());
            tracing::warn!(
                identity_id = %identity.id,
                revocation = record.revocation.map(|r| r.as_str()).unwrap_or("unknown"),
                "Attempt to reuse consumed refresh token"
            );
            let err = if explicit {
                AuthError::RevokedToken
            } else {
                AuthError::InvalidToken
            };
            return Err(err.into());
        }

        let tokens = match self.issuer.rotate(&record, &identity).await? {
            Some(tokens) => tokens,
            None => {
                tracing::warn!(identity_id = %identity.id, "Lost refresh token exchange race");
                return Err(AuthError::InvalidToken.into());
            }
        };

        tracing::info!(
            identity_id = %identity.id,
            token_id = %tokens.access.token_id,
            "Refresh token rotated"
        );
        Ok(AuthSession { identity, tokens })
    }

    /// Revoke a refresh token. Revoking an already consumed token is a no-op.
    ///
    /// # Errors
    /// `InvalidToken` if the token is unknown
    pub async fn logout(&self, refresh_token: &str) -> Result<(), AppError> {
        let token_hash = hash_refresh_token(refresh_token);
        let lookup = self
            .store
            .lookup_refresh_token(&token_hash)
            .await?
            .ok_or(AuthError::InvalidToken)?;

        if lookup.record.consumed {
            return Ok(());
        }

        let revoked = self
            .store
            .consume_refresh_token(lookup.record.id, Revocation::LoggedOut, Utc::now())
            .await?;
        if revoked {
            tracing::info!(identity_id = %lookup.identity.id, "Refresh token revoked on logout");
        }
        Ok(())
    }

    /// Replace the identity's password and revoke all of its live refresh tokens
    ///
    /// Returns the number of refresh tokens revoked.
    ///
    /// # Errors
    /// `InvalidCredentials` if `current_password` does not verify
    pub async fn change_password(
        &self,
        identity_id: Uuid,
        current_password: &str,
        new_password: &str,
    ) -> Result<u64, AppError> {
        let identity = self
            .store
            .find_identity_by_id(identity_id)
            .await?
            .ok_or(AuthError::InvalidToken)?;

        if !self
            .verify_password(current_password, &identity.password_hash)
            .await?
        {
            return Err(AuthError::InvalidCredentials.into());
        }

        let password_hash = self.hash_password(new_password).await?;
        let revoked = self
            .store
            .replace_credential(identity.id, &password_hash, Utc::now())
            .await?;

        tracing::info!(identity_id = %identity.id, revoked, "Password changed");
        Ok(revoked)
    }

    /// Load the identity behind a verified access token, recording activity
    ///
    /// # Errors
    /// `InvalidToken` if the identity no longer exists
    pub async fn current_identity(&self, identity_id: Uuid) -> Result<Identity, AppError> {
        let mut identity = self
            .store
            .find_identity_by_id(identity_id)
            .await?
            .ok_or(AuthError::InvalidToken)?;

        let now = Utc::now();
        let touched = self
            .store
            .touch_activity(
                identity.id,
                now,
                Duration::minutes(ACTIVITY_THRESHOLD_MINUTES),
            )
            .await?;
        if touched {
            identity.last_active_at = Some(now);
        }
        Ok(identity)
    }

    /// Delete refresh-token records that expired or were consumed more than
    /// `retention` ago
    pub async fn purge_expired_tokens(&self, retention: Duration) -> Result<u64, AppError> {
        let cutoff = Utc::now() - retention;
        Ok(self.store.purge_refresh_tokens(cutoff).await?)
    }

    fn is_demo_login(&self, username: &str, password: &str) -> bool {
        self.settings.demo_account && username == DEMO_USERNAME && password == DEMO_PASSWORD
    }

    async fn provision_demo_account(&self) -> Result<Identity, AppError> {
        let password_hash = self.hash_password(DEMO_PASSWORD).await?;
        let created = self
            .store
            .create_identity(NewIdentity {
                username: DEMO_USERNAME.to_string(),
                email: DEMO_EMAIL.to_string(),
                password_hash,
            })
            .await;

        match created {
            Ok(identity) => {
                tracing::info!(identity_id = %identity.id, "Demo account provisioned");
                Ok(identity)
            }
            // Provisioned concurrently; fall back to a normal verification.
            Err(StoreError::UniqueViolation(_)) => {
                let identity = self
                    .store
                    .find_identity_by_username(DEMO_USERNAME)
                    .await?
                    .ok_or(AuthError::InvalidCredentials)?;
                if !self
                    .verify_password(DEMO_PASSWORD, &identity.password_hash)
                    .await?
                {
                    return Err(AuthError::InvalidCredentials.into());
                }
                Ok(identity)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn verify_against_decoy(&self, password: &str) -> Result<(), AppError> {
        let hasher = self.hasher;
        let decoy_hash = self
            .decoy_hash
            .get_or_try_init(|| async move {
                tokio::task::spawn_blocking(move || hasher.hash(TIMING_DECOY_PASSWORD)).await?
            })
            .await?;
        self.verify_password(password, decoy_hash).await?;
        Ok(())
    }

    async fn hash_password(&self, password: &str) -> Result<String, AppError> {
        let hasher = self.hasher;
        let password = password.to_string();
        tokio::task::spawn_blocking(move || hasher.hash(&password)).await?
    }

    async fn verify_password(&self, password: &str, stored_hash: &str) -> Result<bool, AppError> {
        let hasher = self.hasher;
        let password = password.to_string();
        let stored_hash = stored_hash.to_string();
        Ok(tokio::task::spawn_blocking(move || hasher.verify(&password, &stored_hash)).await?)
    }
}
