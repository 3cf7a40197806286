// ============================================================================
// In-Memory Store
// ============================================================================
//
// Single-instance backend. Each identity owns one async mutex covering its
// prekey pools and mailbox; holding it across a read-modify-write gives the
// same serialization a row lock gives the Postgres backend.
//
// ============================================================================

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use super::{
    ClaimedPrekey, Identity, KeyFamily, MailboxMessage, OneTimePrekey, RelayStore, SignedPrekey,
};

#[derive(Debug)]
struct PoolEntry {
    key: OneTimePrekey,
    used: bool,
}

#[derive(Debug, Default)]
struct IdentityState {
    public_key: Vec<u8>,
    classical_signed_prekey: Option<SignedPrekey>,
    pq_signed_prekey: Option<SignedPrekey>,
    classical_otps: Vec<PoolEntry>,
    pq_otps: Vec<PoolEntry>,
    mailbox: Vec<MailboxMessage>,
}

impl IdentityState {
    fn signed_prekey_slot(&mut self, family: KeyFamily) -> &mut Option<SignedPrekey> {
        match family {
            KeyFamily::Classical => &mut self.classical_signed_prekey,
            KeyFamily::PostQuantum => &mut self.pq_signed_prekey,
        }
    }

    fn pool(&mut self, family: KeyFamily) -> &mut Vec<PoolEntry> {
        match family {
            KeyFamily::Classical => &mut self.classical_otps,
            KeyFamily::PostQuantum => &mut self.pq_otps,
        }
    }

    /// Index of the oldest unused entry, oldest-first like the Postgres
    /// backend's ORDER BY id.
    fn first_unused(&mut self, family: KeyFamily) -> Option<usize> {
        self.pool(family).iter().position(|entry| !entry.used)
    }

    fn claim_at(&mut self, family: KeyFamily, index: usize) -> ClaimedPrekey {
        let entry = &mut self.pool(family)[index];
        entry.used = true;
        ClaimedPrekey {
            public_key: entry.key.public_key.clone(),
            signature: entry.key.signature.clone(),
        }
    }
}

/// Process-local relay store
#[derive(Default)]
pub struct MemoryStore {
    identities: RwLock<HashMap<String, Arc<Mutex<IdentityState>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grab the per-identity lock handle, or None for unknown identities.
    /// The map read-lock is dropped before the caller awaits the identity
    /// mutex, so distinct identities never contend.
    async fn identity_handle(&self, username: &str) -> Option<Arc<Mutex<IdentityState>>> {
        self.identities.read().await.get(username).cloned()
    }
}

#[async_trait]
impl RelayStore for MemoryStore {
    async fn create_identity(&self, username: &str, public_key: &[u8]) -> Result<bool> {
        let mut identities = self.identities.write().await;
        if identities.contains_key(username) {
            return Ok(false);
        }
        identities.insert(
            username.to_string(),
            Arc::new(Mutex::new(IdentityState {
                public_key: public_key.to_vec(),
                ..IdentityState::default()
            })),
        );
        Ok(true)
    }

    async fn get_identity(&self, username: &str) -> Result<Option<Identity>> {
        match self.identity_handle(username).await {
            Some(handle) => {
                let state = handle.lock().await;
                Ok(Some(Identity {
                    username: username.to_string(),
                    public_key: state.public_key.clone(),
                }))
            }
            None => Ok(None),
        }
    }

    async fn upsert_signed_prekey(
        &self,
        username: &str,
        family: KeyFamily,
        prekey: &SignedPrekey,
    ) -> Result<()> {
        let handle = self
            .identity_handle(username)
            .await
            .ok_or_else(|| anyhow::anyhow!("unknown identity '{}'", username))?;
        let mut state = handle.lock().await;
        *state.signed_prekey_slot(family) = Some(prekey.clone());
        Ok(())
    }

    async fn get_signed_prekey(
        &self,
        username: &str,
        family: KeyFamily,
    ) -> Result<Option<SignedPrekey>> {
        match self.identity_handle(username).await {
            Some(handle) => {
                let mut state = handle.lock().await;
                Ok(state.signed_prekey_slot(family).clone())
            }
            None => Ok(None),
        }
    }

    async fn push_one_time_prekeys(
        &self,
        username: &str,
        family: KeyFamily,
        keys: &[OneTimePrekey],
    ) -> Result<()> {
        let handle = self
            .identity_handle(username)
            .await
            .ok_or_else(|| anyhow::anyhow!("unknown identity '{}'", username))?;
        let mut state = handle.lock().await;
        state.pool(family).extend(keys.iter().map(|key| PoolEntry {
            key: key.clone(),
            used: false,
        }));
        Ok(())
    }

    async fn claim_one_unused(
        &self,
        username: &str,
        family: KeyFamily,
    ) -> Result<Option<ClaimedPrekey>> {
        let handle = match self.identity_handle(username).await {
            Some(handle) => handle,
            None => return Ok(None),
        };
        let mut state = handle.lock().await;
        match state.first_unused(family) {
            Some(index) => Ok(Some(state.claim_at(family, index))),
            None => Ok(None),
        }
    }

    async fn claim_unused_pair(
        &self,
        username: &str,
    ) -> Result<Option<(ClaimedPrekey, ClaimedPrekey)>> {
        let handle = match self.identity_handle(username).await {
            Some(handle) => handle,
            None => return Ok(None),
        };
        let mut state = handle.lock().await;

        // Locate both before marking either; an empty pool must not leak a
        // claimed key from the other.
        let classical_index = match state.first_unused(KeyFamily::Classical) {
            Some(index) => index,
            None => return Ok(None),
        };
        let pq_index = match state.first_unused(KeyFamily::PostQuantum) {
            Some(index) => index,
            None => return Ok(None),
        };

        let classical = state.claim_at(KeyFamily::Classical, classical_index);
        let pq = state.claim_at(KeyFamily::PostQuantum, pq_index);
        Ok(Some((classical, pq)))
    }

    async fn store_message(&self, message: &MailboxMessage) -> Result<()> {
        let handle = self
            .identity_handle(&message.recipient_username)
            .await
            .ok_or_else(|| {
                anyhow::anyhow!("unknown recipient '{}'", message.recipient_username)
            })?;
        let mut state = handle.lock().await;
        state.mailbox.push(message.clone());
        Ok(())
    }

    async fn take_messages(&self, recipient: &str) -> Result<Vec<MailboxMessage>> {
        let handle = match self.identity_handle(recipient).await {
            Some(handle) => handle,
            None => return Ok(Vec::new()),
        };
        let mut state = handle.lock().await;
        Ok(std::mem::take(&mut state.mailbox))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn otp(tag: u8) -> OneTimePrekey {
        OneTimePrekey {
            public_key: vec![tag; 32],
            signature: None,
        }
    }

    fn pq_otp(tag: u8) -> OneTimePrekey {
        OneTimePrekey {
            public_key: vec![tag; 32],
            signature: Some(vec![tag; 64]),
        }
    }

    async fn store_with_user(username: &str) -> MemoryStore {
        let store = MemoryStore::new();
        assert!(store.create_identity(username, &[7u8; 32]).await.unwrap());
        store
    }

    #[tokio::test]
    async fn create_identity_rejects_duplicates() {
        let store = store_with_user("alice").await;
        assert!(!store.create_identity("alice", &[9u8; 32]).await.unwrap());

        // Original key survives the rejected re-registration
        let identity = store.get_identity("alice").await.unwrap().unwrap();
        assert_eq!(identity.public_key, vec![7u8; 32]);
    }

    #[tokio::test]
    async fn upsert_signed_prekey_replaces_previous_record() {
        let store = store_with_user("alice").await;
        let first = SignedPrekey {
            public_key: vec![1; 32],
            signature: vec![1; 64],
        };
        let second = SignedPrekey {
            public_key: vec![2; 32],
            signature: vec![2; 64],
        };

        store
            .upsert_signed_prekey("alice", KeyFamily::Classical, &first)
            .await
            .unwrap();
        store
            .upsert_signed_prekey("alice", KeyFamily::Classical, &second)
            .await
            .unwrap();

        let live = store
            .get_signed_prekey("alice", KeyFamily::Classical)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(live.public_key, vec![2; 32]);

        // Families are independent
        assert!(store
            .get_signed_prekey("alice", KeyFamily::PostQuantum)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn claim_hands_out_each_key_once() {
        let store = store_with_user("alice").await;
        store
            .push_one_time_prekeys("alice", KeyFamily::Classical, &[otp(1), otp(2)])
            .await
            .unwrap();

        let first = store
            .claim_one_unused("alice", KeyFamily::Classical)
            .await
            .unwrap()
            .unwrap();
        let second = store
            .claim_one_unused("alice", KeyFamily::Classical)
            .await
            .unwrap()
            .unwrap();
        assert_ne!(first.public_key, second.public_key);

        assert!(store
            .claim_one_unused("alice", KeyFamily::Classical)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn pair_claim_leaves_nothing_used_when_one_pool_is_empty() {
        let store = store_with_user("alice").await;
        store
            .push_one_time_prekeys("alice", KeyFamily::Classical, &[otp(1)])
            .await
            .unwrap();
        // No PQ keys pushed

        assert!(store.claim_unused_pair("alice").await.unwrap().is_none());

        // The classical key must still be claimable
        assert!(store
            .claim_one_unused("alice", KeyFamily::Classical)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn pair_claim_consumes_one_from_each_pool() {
        let store = store_with_user("alice").await;
        store
            .push_one_time_prekeys("alice", KeyFamily::Classical, &[otp(1)])
            .await
            .unwrap();
        store
            .push_one_time_prekeys("alice", KeyFamily::PostQuantum, &[pq_otp(2)])
            .await
            .unwrap();

        let (classical, pq) = store.claim_unused_pair("alice").await.unwrap().unwrap();
        assert_eq!(classical.public_key, vec![1; 32]);
        assert_eq!(pq.public_key, vec![2; 32]);
        assert_eq!(pq.signature, Some(vec![2; 64]));

        assert!(store.claim_unused_pair("alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn take_messages_drains_the_mailbox() {
        let store = store_with_user("bob").await;
        let message = MailboxMessage {
            recipient_username: "bob".into(),
            sharer_username: "alice".into(),
            sharer_identity_key: vec![1; 32],
            sharer_ephemeral_key: vec![2; 32],
            otp_hash: vec![3; 32],
            encrypted_message: vec![4; 128],
            kem_ciphertext: vec![5; 64],
            pq_otp_hash: vec![6; 32],
        };
        store.store_message(&message).await.unwrap();
        store.store_message(&message).await.unwrap();

        let grabbed = store.take_messages("bob").await.unwrap();
        assert_eq!(grabbed.len(), 2);
        assert!(store.take_messages("bob").await.unwrap().is_empty());
    }
}
