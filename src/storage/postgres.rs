// ============================================================================
// Postgres Store
// ============================================================================
//
// Claims take a row lock (FOR UPDATE SKIP LOCKED) across the read-modify-
// write and commit before the lock is released, so two concurrent claims on
// the same pool can never select the same row. Mailbox grabs are a single
// DELETE .. RETURNING, atomic by itself.
//
// ============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};

use super::{
    ClaimedPrekey, Identity, KeyFamily, MailboxMessage, OneTimePrekey, RelayStore, SignedPrekey,
};

pub struct PgStore {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct IdentityRow {
    username: String,
    public_key: Vec<u8>,
}

#[derive(sqlx::FromRow)]
struct SignedPrekeyRow {
    public_key: Vec<u8>,
    signature: Vec<u8>,
}

#[derive(sqlx::FromRow)]
struct OtpRow {
    id: i64,
    public_key: Vec<u8>,
    signature: Option<Vec<u8>>,
}

#[derive(sqlx::FromRow)]
struct MailboxRow {
    recipient_username: String,
    sharer_username: String,
    sharer_identity_key: Vec<u8>,
    sharer_ephemeral_key: Vec<u8>,
    otp_hash: Vec<u8>,
    encrypted_message: Vec<u8>,
    kem_ciphertext: Vec<u8>,
    pq_otp_hash: Vec<u8>,
}

impl From<MailboxRow> for MailboxMessage {
    fn from(row: MailboxRow) -> Self {
        MailboxMessage {
            recipient_username: row.recipient_username,
            sharer_username: row.sharer_username,
            sharer_identity_key: row.sharer_identity_key,
            sharer_ephemeral_key: row.sharer_ephemeral_key,
            otp_hash: row.otp_hash,
            encrypted_message: row.encrypted_message,
            kem_ciphertext: row.kem_ciphertext,
            pq_otp_hash: row.pq_otp_hash,
        }
    }
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                username TEXT PRIMARY KEY,
                public_key BYTEA NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS signed_prekeys (
                username TEXT NOT NULL REFERENCES users(username),
                family TEXT NOT NULL,
                public_key BYTEA NOT NULL,
                signature BYTEA NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (username, family)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS one_time_prekeys (
                id BIGSERIAL PRIMARY KEY,
                username TEXT NOT NULL REFERENCES users(username),
                family TEXT NOT NULL,
                public_key BYTEA NOT NULL,
                signature BYTEA,
                used BOOLEAN NOT NULL DEFAULT FALSE,
                uploaded_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_otp_claimable
            ON one_time_prekeys (username, family, id) WHERE NOT used
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS mailbox_messages (
                id BIGSERIAL PRIMARY KEY,
                recipient_username TEXT NOT NULL REFERENCES users(username),
                sharer_username TEXT NOT NULL REFERENCES users(username),
                sharer_identity_key BYTEA NOT NULL,
                sharer_ephemeral_key BYTEA NOT NULL,
                otp_hash BYTEA NOT NULL,
                encrypted_message BYTEA NOT NULL,
                kem_ciphertext BYTEA NOT NULL,
                pq_otp_hash BYTEA NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to initialize relay schema")?;

        Ok(())
    }

    /// Lock and mark the oldest unused one-time prekey inside the given
    /// transaction. SKIP LOCKED makes concurrent claimers pick distinct rows
    /// instead of queueing on the same one.
    async fn claim_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        username: &str,
        family: KeyFamily,
    ) -> Result<Option<ClaimedPrekey>> {
        let row = sqlx::query_as::<_, OtpRow>(
            r#"
            SELECT id, public_key, signature
            FROM one_time_prekeys
            WHERE username = $1 AND family = $2 AND NOT used
            ORDER BY id ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(username)
        .bind(family.as_str())
        .fetch_optional(&mut **tx)
        .await?;

        let row = match row {
            Some(row) => row,
            None => return Ok(None),
        };

        sqlx::query("UPDATE one_time_prekeys SET used = TRUE WHERE id = $1")
            .bind(row.id)
            .execute(&mut **tx)
            .await?;

        tracing::info!(
            username = %username,
            family = %family,
            otp_id = row.id,
            "One-time prekey marked as used"
        );

        Ok(Some(ClaimedPrekey {
            public_key: row.public_key,
            signature: row.signature,
        }))
    }
}

#[async_trait]
impl RelayStore for PgStore {
    async fn create_identity(&self, username: &str, public_key: &[u8]) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO users (username, public_key)
            VALUES ($1, $2)
            ON CONFLICT (username) DO NOTHING
            "#,
        )
        .bind(username)
        .bind(public_key)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_identity(&self, username: &str) -> Result<Option<Identity>> {
        let row = sqlx::query_as::<_, IdentityRow>(
            "SELECT username, public_key FROM users WHERE username = $1",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| Identity {
            username: row.username,
            public_key: row.public_key,
        }))
    }

    async fn upsert_signed_prekey(
        &self,
        username: &str,
        family: KeyFamily,
        prekey: &SignedPrekey,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO signed_prekeys (username, family, public_key, signature)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (username, family) DO UPDATE
            SET public_key = EXCLUDED.public_key,
                signature = EXCLUDED.signature,
                updated_at = NOW()
            "#,
        )
        .bind(username)
        .bind(family.as_str())
        .bind(&prekey.public_key)
        .bind(&prekey.signature)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_signed_prekey(
        &self,
        username: &str,
        family: KeyFamily,
    ) -> Result<Option<SignedPrekey>> {
        let row = sqlx::query_as::<_, SignedPrekeyRow>(
            r#"
            SELECT public_key, signature
            FROM signed_prekeys
            WHERE username = $1 AND family = $2
            "#,
        )
        .bind(username)
        .bind(family.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| SignedPrekey {
            public_key: row.public_key,
            signature: row.signature,
        }))
    }

    async fn push_one_time_prekeys(
        &self,
        username: &str,
        family: KeyFamily,
        keys: &[OneTimePrekey],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for key in keys {
            sqlx::query(
                r#"
                INSERT INTO one_time_prekeys (username, family, public_key, signature)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(username)
            .bind(family.as_str())
            .bind(&key.public_key)
            .bind(&key.signature)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn claim_one_unused(
        &self,
        username: &str,
        family: KeyFamily,
    ) -> Result<Option<ClaimedPrekey>> {
        let mut tx = self.pool.begin().await?;
        match Self::claim_in_tx(&mut tx, username, family).await? {
            Some(claimed) => {
                tx.commit().await?;
                Ok(Some(claimed))
            }
            None => {
                tx.rollback().await?;
                Ok(None)
            }
        }
    }

    async fn claim_unused_pair(
        &self,
        username: &str,
    ) -> Result<Option<(ClaimedPrekey, ClaimedPrekey)>> {
        let mut tx = self.pool.begin().await?;

        let classical = match Self::claim_in_tx(&mut tx, username, KeyFamily::Classical).await? {
            Some(claimed) => claimed,
            None => {
                tx.rollback().await?;
                return Ok(None);
            }
        };

        // Rolling back here un-marks the classical key: an exhausted PQ pool
        // must not leak a claimed-but-undelivered classical key.
        let pq = match Self::claim_in_tx(&mut tx, username, KeyFamily::PostQuantum).await? {
            Some(claimed) => claimed,
            None => {
                tx.rollback().await?;
                return Ok(None);
            }
        };

        tx.commit().await?;
        Ok(Some((classical, pq)))
    }

    async fn store_message(&self, message: &MailboxMessage) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO mailbox_messages
                (recipient_username, sharer_username, sharer_identity_key,
                 sharer_ephemeral_key, otp_hash, encrypted_message,
                 kem_ciphertext, pq_otp_hash)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&message.recipient_username)
        .bind(&message.sharer_username)
        .bind(&message.sharer_identity_key)
        .bind(&message.sharer_ephemeral_key)
        .bind(&message.otp_hash)
        .bind(&message.encrypted_message)
        .bind(&message.kem_ciphertext)
        .bind(&message.pq_otp_hash)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn take_messages(&self, recipient: &str) -> Result<Vec<MailboxMessage>> {
        // Single-statement read+delete; a row deleted here can never show up
        // in a concurrent grab's result.
        let rows = sqlx::query_as::<_, MailboxRow>(
            r#"
            WITH grabbed AS (
                DELETE FROM mailbox_messages
                WHERE recipient_username = $1
                RETURNING id, recipient_username, sharer_username,
                          sharer_identity_key, sharer_ephemeral_key, otp_hash,
                          encrypted_message, kem_ciphertext, pq_otp_hash
            )
            SELECT recipient_username, sharer_username, sharer_identity_key,
                   sharer_ephemeral_key, otp_hash, encrypted_message,
                   kem_ciphertext, pq_otp_hash
            FROM grabbed
            ORDER BY id ASC
            "#,
        )
        .bind(recipient)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(MailboxMessage::from).collect())
    }
}
