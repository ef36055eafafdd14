/// Persistence for identities and refresh tokens
///
/// The store is the only synchronization point of the service. It must
/// enforce username/email uniqueness at insert time and make refresh-token
/// consumption a compare-and-set: the `consumed = false -> true` transition
/// succeeds for exactly one caller.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::StoreError;

/// A registered user together with its credential
#[derive(Clone, sqlx::FromRow)]
pub struct Identity {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
    pub last_login_at: Option<DateTime<Utc>>,
    pub last_active_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("email", &self.email)
            .field("password_hash", &"<redacted>")
            .field("created_at", &self.created_at)
            .field("last_login_at", &self.last_login_at)
            .field("last_active_at", &self.last_active_at)
            .finish()
    }
}

/// Input for `IdentityStore::create_identity`
#[derive(Clone)]
pub struct NewIdentity {
    pub username: String,
    pub email: String,
    pub password_hash: String,
}

/// Why a refresh token left the live state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Revocation {
    /// Exchanged for a new pair
    Rotated,
    /// Presented after its expiry
    Expired,
    LoggedOut,
    /// The owner's password was replaced
    CredentialChange,
}

impl Revocation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Revocation::Rotated => "rotated",
            Revocation::Expired => "expired",
            Revocation::LoggedOut => "logged_out",
            Revocation::CredentialChange => "credential_change",
        }
    }

    /// Revoked explicitly by the owner, as opposed to used up
    pub fn is_explicit(&self) -> bool {
        matches!(self, Revocation::LoggedOut | Revocation::CredentialChange)
    }
}

impl FromStr for Revocation {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rotated" => Ok(Revocation::Rotated),
            "expired" => Ok(Revocation::Expired),
            "logged_out" => Ok(Revocation::LoggedOut),
            "credential_change" => Ok(Revocation::CredentialChange),
            other => Err(StoreError::Corrupt(format!("unknown revocation '{}'", other))),
        }
    }
}

/// Server-side state of one refresh token. Only the SHA-256 digest of the
/// token is kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshTokenRecord {
    pub id: Uuid,
    pub identity_id: Uuid,
    pub token_hash: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub consumed: bool,
    pub consumed_at: Option<DateTime<Utc>>,
    pub revocation: Option<Revocation>,
}

impl RefreshTokenRecord {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Exchangeable iff not consumed and not yet expired
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        !self.consumed && !self.is_expired_at(now)
    }
}

/// Input for inserting a refresh token
#[derive(Debug, Clone)]
pub struct NewRefreshToken {
    pub identity_id: Uuid,
    pub token_hash: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// A refresh token joined with its owner
#[derive(Debug, Clone)]
pub struct RefreshTokenLookup {
    pub record: RefreshTokenRecord,
    pub identity: Identity,
}

#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn find_identity_by_username(&self, username: &str)
        -> Result<Option<Identity>, StoreError>;

    async fn find_identity_by_id(&self, id: Uuid) -> Result<Option<Identity>, StoreError>;

    /// Fails with `StoreError::UniqueViolation` naming the colliding key;
    /// nothing is written in that case.
    async fn create_identity(&self, new: NewIdentity) -> Result<Identity, StoreError>;

    /// Sets both `last_login_at` and `last_active_at`
    async fn record_login(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Updates `last_active_at` only when unset or older than `threshold`.
    /// Returns whether a write happened.
    async fn touch_activity(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        threshold: Duration,
    ) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait RefreshTokenStore: Send + Sync {
    async fn insert_refresh_token(
        &self,
        new: NewRefreshToken,
    ) -> Result<RefreshTokenRecord, StoreError>;

    async fn lookup_refresh_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshTokenLookup>, StoreError>;

    /// Compare-and-set on the consumed flag. Returns `true` only for the
    /// caller that performed the transition.
    async fn consume_refresh_token(
        &self,
        id: Uuid,
        reason: Revocation,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Consumes `old_id` as rotated and inserts `new` in one atomic step.
    /// Returns `None`, with nothing written, when `old_id` was already consumed.
    async fn rotate_refresh_token(
        &self,
        old_id: Uuid,
        new: NewRefreshToken,
    ) -> Result<Option<RefreshTokenRecord>, StoreError>;

    /// Deletes records that expired, or were consumed, before `cutoff`
    async fn purge_refresh_tokens(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Everything the authentication service needs from persistence, plus the
/// operations that span both tables
#[async_trait]
pub trait AuthStore: IdentityStore + RefreshTokenStore {
    /// Replaces the identity's password hash and revokes all of its live
    /// refresh tokens with `Revocation::CredentialChange`, as one unit: either
    /// both happen or neither does. Returns the number of tokens revoked.
    ///
    /// Fails with `StoreError::Query` if the identity does not exist.
    async fn replace_credential(
        &self,
        identity_id: Uuid,
        password_hash: &str,
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError>;
}
