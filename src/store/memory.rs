/// In-process store used by the test suites and for running without Postgres.
///
/// Every operation takes the single mutex for its whole read-modify-write, which
/// gives the same uniqueness and compare-and-set guarantees as the database
/// constraints. No lock is held across an `.await`.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{
    AuthStore, Identity, IdentityStore, NewIdentity, NewRefreshToken, RefreshTokenLookup,
    RefreshTokenRecord, RefreshTokenStore, Revocation,
};
use crate::error::{StoreError, UniqueKey};

#[derive(Default)]
struct State {
    identities: HashMap<Uuid, Identity>,
    refresh_tokens: HashMap<Uuid, RefreshTokenRecord>,
}

impl State {
    fn insert_token(&mut self, new: NewRefreshToken) -> Result<RefreshTokenRecord, StoreError> {
        if !self.identities.contains_key(&new.identity_id) {
            return Err(StoreError::Query(format!(
                "identity {} does not exist",
                new.identity_id
            )));
        }
        if self
            .refresh_tokens
            .values()
            .any(|t| t.token_hash == new.token_hash)
        {
            return Err(StoreError::UniqueViolation(UniqueKey::RefreshToken));
        }

        let record = RefreshTokenRecord {
            id: Uuid::new_v4(),
            identity_id: new.identity_id,
            token_hash: new.token_hash,
            issued_at: new.issued_at,
            expires_at: new.expires_at,
            consumed: false,
            consumed_at: None,
            revocation: None,
        };
        self.refresh_tokens.insert(record.id, record.clone());
        Ok(record)
    }

    fn revoke_all(&mut self, identity_id: Uuid, reason: Revocation, at: DateTime<Utc>) -> u64 {
        let mut revoked = 0;
        for record in self.refresh_tokens.values_mut() {
            if record.identity_id == identity_id && !record.consumed {
                record.consumed = true;
                record.consumed_at = Some(at);
                record.revocation = Some(reason);
                revoked += 1;
            }
        }
        revoked
    }

    fn consume(&mut self, id: Uuid, reason: Revocation, at: DateTime<Utc>) -> bool {
        match self.refresh_tokens.get_mut(&id) {
            Some(record) if !record.consumed => {
                record.consumed = true;
                record.consumed_at = Some(at);
                record.revocation = Some(reason);
                true
            }
            _ => false,
        }
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of refresh-token records currently held, consumed ones included
    pub fn refresh_token_count(&self) -> Result<usize, StoreError> {
        Ok(self.lock()?.refresh_tokens.len())
    }

    pub fn identity_count(&self) -> Result<usize, StoreError> {
        Ok(self.lock()?.identities.len())
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl IdentityStore for MemoryStore {
    async fn find_identity_by_username(
        &self,
        username: &str,
    ) -> Result<Option<Identity>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .identities
            .values()
            .find(|i| i.username == username)
            .cloned())
    }

    async fn find_identity_by_id(&self, id: Uuid) -> Result<Option<Identity>, StoreError> {
        Ok(self.lock()?.identities.get(&id).cloned())
    }

    async fn create_identity(&self, new: NewIdentity) -> Result<Identity, StoreError> {
        let mut state = self.lock()?;
        if state.identities.values().any(|i| i.username == new.username) {
            return Err(StoreError::UniqueViolation(UniqueKey::Username));
        }
        if state.identities.values().any(|i| i.email == new.email) {
            return Err(StoreError::UniqueViolation(UniqueKey::Email));
        }

        let identity = Identity {
            id: Uuid::new_v4(),
            username: new.username,
            email: new.email,
            password_hash: new.password_hash,
            created_at: Utc::now(),
            last_login_at: None,
            last_active_at: None,
        };
        state.identities.insert(identity.id, identity.clone());
        Ok(identity)
    }

    async fn record_login(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        if let Some(identity) = self.lock()?.identities.get_mut(&id) {
            identity.last_login_at = Some(at);
            identity.last_active_at = Some(at);
        }
        Ok(())
    }

    async fn touch_activity(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        threshold: Duration,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        match state.identities.get_mut(&id) {
            Some(identity) => {
                let stale = identity
                    .last_active_at
                    .map_or(true, |last| last < at - threshold);
                if stale {
                    identity.last_active_at = Some(at);
                }
                Ok(stale)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl RefreshTokenStore for MemoryStore {
    async fn insert_refresh_token(
        &self,
        new: NewRefreshToken,
    ) -> Result<RefreshTokenRecord, StoreError> {
        self.lock()?.insert_token(new)
    }

    async fn lookup_refresh_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshTokenLookup>, StoreError> {
        let state = self.lock()?;
        let Some(record) = state
            .refresh_tokens
            .values()
            .find(|t| t.token_hash == token_hash)
        else {
            return Ok(None);
        };

        let identity = state
            .identities
            .get(&record.identity_id)
            .cloned()
            .ok_or_else(|| {
                StoreError::Corrupt(format!("refresh token {} has no owner", record.id))
            })?;

        Ok(Some(RefreshTokenLookup {
            record: record.clone(),
            identity,
        }))
    }

    async fn consume_refresh_token(
        &self,
        id: Uuid,
        reason: Revocation,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        Ok(self.lock()?.consume(id, reason, at))
    }

    async fn rotate_refresh_token(
        &self,
        old_id: Uuid,
        new: NewRefreshToken,
    ) -> Result<Option<RefreshTokenRecord>, StoreError> {
        let mut state = self.lock()?;

        let live = state
            .refresh_tokens
            .get(&old_id)
            .map_or(false, |t| !t.consumed);
        if !live {
            return Ok(None);
        }

        // Insert first so a digest collision leaves the old token untouched.
        let at = new.issued_at;
        let record = state.insert_token(new)?;
        state.consume(old_id, Revocation::Rotated, at);
        Ok(Some(record))
    }

    async fn purge_refresh_tokens(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.lock()?;
        let before = state.refresh_tokens.len();
        state.refresh_tokens.retain(|_, t| {
            let expired = t.expires_at < cutoff;
            let consumed_long_ago = t.consumed && t.consumed_at.map_or(false, |at| at < cutoff);
            !(expired || consumed_long_ago)
        });
        Ok((before - state.refresh_tokens.len()) as u64)
    }
}

#[async_trait]
impl AuthStore for MemoryStore {
    async fn replace_credential(
        &self,
        identity_id: Uuid,
        password_hash: &str,
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut state = self.lock()?;
        let identity = state.identities.get_mut(&identity_id).ok_or_else(|| {
            StoreError::Query(format!("identity {} does not exist", identity_id))
        })?;
        identity.password_hash = password_hash.to_string();
        Ok(state.revoke_all(identity_id, Revocation::CredentialChange, at))
    }
}
