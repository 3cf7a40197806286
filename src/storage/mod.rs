// ============================================================================
// Relay Storage
// ============================================================================
//
// Key material and mailbox persistence behind one trait. Two backends:
// - memory: per-identity mutex, single instance, state lost on restart
// - postgres: sqlx pool, row locks for claims, DELETE..RETURNING for grabs
//
// The claim and grab operations are the two race-sensitive spots in the
// whole relay; their at-most-once guarantees live in the backends, never in
// handler logic.
//
// ============================================================================

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use anyhow::Result;
use async_trait::async_trait;

/// Algorithm family a prekey belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyFamily {
    Classical,
    PostQuantum,
}

impl KeyFamily {
    /// Identifier used in database rows and log fields
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyFamily::Classical => "classical",
            KeyFamily::PostQuantum => "pq",
        }
    }
}

impl std::fmt::Display for KeyFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered identity: username plus long-term Ed25519 public key
#[derive(Debug, Clone)]
pub struct Identity {
    pub username: String,
    pub public_key: Vec<u8>,
}

/// Medium-term signed prekey; at most one live record per (identity, family)
#[derive(Debug, Clone)]
pub struct SignedPrekey {
    pub public_key: Vec<u8>,
    /// Signature over the prekey by the identity's long-term key
    pub signature: Vec<u8>,
}

/// A one-time prekey as uploaded. Classical keys carry no signature; PQ keys
/// always do.
#[derive(Debug, Clone)]
pub struct OneTimePrekey {
    pub public_key: Vec<u8>,
    pub signature: Option<Vec<u8>>,
}

/// A one-time prekey handed out by a claim. The backing row stays on record
/// with `used = true` and is never returned again.
#[derive(Debug, Clone)]
pub struct ClaimedPrekey {
    pub public_key: Vec<u8>,
    pub signature: Option<Vec<u8>>,
}

/// One stored encrypted initial message awaiting pickup
#[derive(Debug, Clone)]
pub struct MailboxMessage {
    pub recipient_username: String,
    pub sharer_username: String,
    pub sharer_identity_key: Vec<u8>,
    pub sharer_ephemeral_key: Vec<u8>,
    pub otp_hash: Vec<u8>,
    pub encrypted_message: Vec<u8>,
    pub kem_ciphertext: Vec<u8>,
    pub pq_otp_hash: Vec<u8>,
}

/// Persistence operations the relay core depends on.
///
/// Implementations must make `claim_one_unused`, `claim_unused_pair` and
/// `take_messages` linearizable per identity: two concurrent claims against
/// the same pool must never hand out the same key, and a mailbox row must
/// never appear in two grab results.
#[async_trait]
pub trait RelayStore: Send + Sync {
    /// Register a new identity. Returns false if the username is taken.
    async fn create_identity(&self, username: &str, public_key: &[u8]) -> Result<bool>;

    async fn get_identity(&self, username: &str) -> Result<Option<Identity>>;

    /// Replace the live signed prekey for (identity, family). Idempotent.
    async fn upsert_signed_prekey(
        &self,
        username: &str,
        family: KeyFamily,
        prekey: &SignedPrekey,
    ) -> Result<()>;

    async fn get_signed_prekey(
        &self,
        username: &str,
        family: KeyFamily,
    ) -> Result<Option<SignedPrekey>>;

    /// Append unused one-time prekeys to the identity's pool.
    async fn push_one_time_prekeys(
        &self,
        username: &str,
        family: KeyFamily,
        keys: &[OneTimePrekey],
    ) -> Result<()>;

    /// Atomically claim one unused one-time prekey, marking it used before
    /// any other requester can observe it. `None` means the pool is empty.
    async fn claim_one_unused(
        &self,
        username: &str,
        family: KeyFamily,
    ) -> Result<Option<ClaimedPrekey>>;

    /// Claim one classical and one PQ one-time prekey in a single
    /// transaction. If either pool is empty, neither key is marked used.
    async fn claim_unused_pair(
        &self,
        username: &str,
    ) -> Result<Option<(ClaimedPrekey, ClaimedPrekey)>>;

    /// Append one mailbox message. No deduplication.
    async fn store_message(&self, message: &MailboxMessage) -> Result<()>;

    /// Return and delete every pending message for the recipient in one
    /// transaction. An empty mailbox yields an empty vec.
    async fn take_messages(&self, recipient: &str) -> Result<Vec<MailboxMessage>>;
}
