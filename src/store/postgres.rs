/// Postgres implementation of the identity and refresh-token stores.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{
    AuthStore, Identity, IdentityStore, NewIdentity, NewRefreshToken, RefreshTokenLookup,
    RefreshTokenRecord, RefreshTokenStore, Revocation,
};
use crate::error::StoreError;

const IDENTITY_COLUMNS: &str =
    "id, username, email, password_hash, created_at, last_login_at, last_active_at";

const TOKEN_COLUMNS: &str =
    "id, identity_id, token_hash, issued_at, expires_at, consumed, consumed_at, revocation";

/// Store backed by a Postgres connection pool
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct RefreshTokenRow {
    id: Uuid,
    identity_id: Uuid,
    token_hash: String,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    consumed: bool,
    consumed_at: Option<DateTime<Utc>>,
    revocation: Option<String>,
}

impl TryFrom<RefreshTokenRow> for RefreshTokenRecord {
    type Error = StoreError;

    fn try_from(row: RefreshTokenRow) -> Result<Self, Self::Error> {
        let revocation: Option<Revocation> = row
            .revocation
            .as_deref()
            .map(str::parse::<Revocation>)
            .transpose()?;
        Ok(RefreshTokenRecord {
            id: row.id,
            identity_id: row.identity_id,
            token_hash: row.token_hash,
            issued_at: row.issued_at,
            expires_at: row.expires_at,
            consumed: row.consumed,
            consumed_at: row.consumed_at,
            revocation,
        })
    }
}

/// Joined row for a refresh-token lookup; identity columns are prefixed `i_`
#[derive(sqlx::FromRow)]
struct LookupRow {
    id: Uuid,
    identity_id: Uuid,
    token_hash: String,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    consumed: bool,
    consumed_at: Option<DateTime<Utc>>,
    revocation: Option<String>,
    i_username: String,
    i_email: String,
    i_password_hash: String,
    i_created_at: DateTime<Utc>,
    i_last_login_at: Option<DateTime<Utc>>,
    i_last_active_at: Option<DateTime<Utc>>,
}

impl TryFrom<LookupRow> for RefreshTokenLookup {
    type Error = StoreError;

    fn try_from(row: LookupRow) -> Result<Self, Self::Error> {
        let identity = Identity {
            id: row.identity_id,
            username: row.i_username,
            email: row.i_email,
            password_hash: row.i_password_hash,
            created_at: row.i_created_at,
            last_login_at: row.i_last_login_at,
            last_active_at: row.i_last_active_at,
        };
        let record = RefreshTokenRow {
            id: row.id,
            identity_id: row.identity_id,
            token_hash: row.token_hash,
            issued_at: row.issued_at,
            expires_at: row.expires_at,
            consumed: row.consumed,
            consumed_at: row.consumed_at,
            revocation: row.revocation,
        }
        .try_into()?;
        Ok(RefreshTokenLookup { record, identity })
    }
}

#[async_trait]
impl IdentityStore for PgStore {
    async fn find_identity_by_username(
        &self,
        username: &str,
    ) -> Result<Option<Identity>, StoreError> {
        let query = format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE username = $1");
        let identity = sqlx::query_as::<_, Identity>(&query)
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        Ok(identity)
    }

    async fn find_identity_by_id(&self, id: Uuid) -> Result<Option<Identity>, StoreError> {
        let query = format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE id = $1");
        let identity = sqlx::query_as::<_, Identity>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(identity)
    }

    async fn create_identity(&self, new: NewIdentity) -> Result<Identity, StoreError> {
        // Uniqueness is decided by the constraints on this single INSERT, so two
        // concurrent registrations of the same name cannot both commit.
        let query = format!(
            "INSERT INTO identities (id, username, email, password_hash, created_at)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING {IDENTITY_COLUMNS}"
        );
        let identity = sqlx::query_as::<_, Identity>(&query)
            .bind(Uuid::new_v4())
            .bind(&new.username)
            .bind(&new.email)
            .bind(&new.password_hash)
            .bind(Utc::now())
            .fetch_one(&self.pool)
            .await?;
        Ok(identity)
    }

    async fn record_login(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE identities SET last_login_at = $2, last_active_at = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn touch_activity(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        threshold: Duration,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE identities SET last_active_at = $2
             WHERE id = $1 AND (last_active_at IS NULL OR last_active_at < $3)",
        )
        .bind(id)
        .bind(at)
        .bind(at - threshold)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl RefreshTokenStore for PgStore {
    async fn insert_refresh_token(
        &self,
        new: NewRefreshToken,
    ) -> Result<RefreshTokenRecord, StoreError> {
        let query = format!(
            "INSERT INTO refresh_tokens (id, identity_id, token_hash, issued_at, expires_at)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING {TOKEN_COLUMNS}"
        );
        let row = sqlx::query_as::<_, RefreshTokenRow>(&query)
            .bind(Uuid::new_v4())
            .bind(new.identity_id)
            .bind(&new.token_hash)
            .bind(new.issued_at)
            .bind(new.expires_at)
            .fetch_one(&self.pool)
            .await?;
        row.try_into()
    }

    async fn lookup_refresh_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshTokenLookup>, StoreError> {
        let row = sqlx::query_as::<_, LookupRow>(
            r#"
            SELECT t.id, t.identity_id, t.token_hash, t.issued_at, t.expires_at,
                   t.consumed, t.consumed_at, t.revocation,
                   i.username AS i_username, i.email AS i_email,
                   i.password_hash AS i_password_hash, i.created_at AS i_created_at,
                   i.last_login_at AS i_last_login_at, i.last_active_at AS i_last_active_at
            FROM refresh_tokens t
            JOIN identities i ON i.id = t.identity_id
            WHERE t.token_hash = $1
            "#,
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;

        row.map(RefreshTokenLookup::try_from).transpose()
    }

    async fn consume_refresh_token(
        &self,
        id: Uuid,
        reason: Revocation,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE refresh_tokens SET consumed = true, consumed_at = $2, revocation = $3
             WHERE id = $1 AND consumed = false",
        )
        .bind(id)
        .bind(at)
        .bind(reason.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn rotate_refresh_token(
        &self,
        old_id: Uuid,
        new: NewRefreshToken,
    ) -> Result<Option<RefreshTokenRecord>, StoreError> {
        let mut tx = self.pool.begin().await?;

        // The UPDATE takes the row lock; a concurrent rotation blocks here and
        // then re-reads `consumed = true`, affecting zero rows.
        let consumed = sqlx::query(
            "UPDATE refresh_tokens SET consumed = true, consumed_at = $2, revocation = $3
             WHERE id = $1 AND consumed = false",
        )
        .bind(old_id)
        .bind(new.issued_at)
        .bind(Revocation::Rotated.as_str())
        .execute(&mut tx)
        .await?;

        if consumed.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let query = format!(
            "INSERT INTO refresh_tokens (id, identity_id, token_hash, issued_at, expires_at)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING {TOKEN_COLUMNS}"
        );
        let row = sqlx::query_as::<_, RefreshTokenRow>(&query)
            .bind(Uuid::new_v4())
            .bind(new.identity_id)
            .bind(&new.token_hash)
            .bind(new.issued_at)
            .bind(new.expires_at)
            .fetch_one(&mut tx)
            .await?;

        tx.commit().await?;
        RefreshTokenRecord::try_from(row).map(Some)
    }

    async fn purge_refresh_tokens(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM refresh_tokens
             WHERE expires_at < $1 OR (consumed = true AND consumed_at < $1)",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl AuthStore for PgStore {
    async fn replace_credential(
        &self,
        identity_id: Uuid,
        password_hash: &str,
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query("UPDATE identities SET password_hash = $2 WHERE id = $1")
            .bind(identity_id)
            .bind(password_hash)
            .execute(&mut tx)
            .await?;
        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(StoreError::Query(format!(
                "identity {} does not exist",
                identity_id
            )));
        }

        let revoked = sqlx::query(
            "UPDATE refresh_tokens SET consumed = true, consumed_at = $2, revocation = $3
             WHERE identity_id = $1 AND consumed = false",
        )
        .bind(identity_id)
        .bind(at)
        .bind(Revocation::CredentialChange.as_str())
        .execute(&mut tx)
        .await?;

        tx.commit().await?;
        Ok(revoked.rows_affected())
    }
}
