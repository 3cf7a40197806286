// ============================================================================
// Prekey Bundle Assembly
// ============================================================================
//
// Composes the response for /x3dh/prekey_bundle: identity key, both signed
// prekeys, and one freshly claimed one-time prekey from each pool. Both
// one-time keys are mandatory; the paired claim runs in one transaction so
// an exhausted pool never leaks a claimed key from the other.
//
// ============================================================================

use crate::error::AppError;
use crate::storage::{KeyFamily, RelayStore};
use crate::wire::{encode_b64, PrekeyBundleResponse};

pub async fn assemble(
    store: &dyn RelayStore,
    target_username: &str,
) -> Result<PrekeyBundleResponse, AppError> {
    let identity = store
        .get_identity(target_username)
        .await?
        .ok_or_else(|| AppError::IdentityNotFound(target_username.to_string()))?;

    let signed_prekey = store
        .get_signed_prekey(target_username, KeyFamily::Classical)
        .await?
        .ok_or_else(|| AppError::BundleIncomplete(target_username.to_string(), "classical"))?;

    let pq_signed_prekey = store
        .get_signed_prekey(target_username, KeyFamily::PostQuantum)
        .await?
        .ok_or_else(|| AppError::BundleIncomplete(target_username.to_string(), "pq"))?;

    // Forward secrecy depends on a fresh one-time key per session, so an
    // empty pool is a hard failure rather than a silent substitution.
    let (one_time, pq_one_time) = store
        .claim_unused_pair(target_username)
        .await?
        .ok_or_else(|| AppError::KeyPoolExhausted(target_username.to_string()))?;

    let pq_one_time_signature = pq_one_time.signature.ok_or_else(|| {
        anyhow::anyhow!(
            "stored PQ one-time prekey for '{}' has no signature",
            target_username
        )
    })?;

    tracing::info!(
        target = %target_username,
        "Prekey bundle assembled, one-time prekeys consumed"
    );

    Ok(PrekeyBundleResponse {
        identity_key: encode_b64(&identity.public_key),
        signed_prekey: encode_b64(&signed_prekey.public_key),
        signed_prekey_signature: encode_b64(&signed_prekey.signature),
        one_time_prekey: encode_b64(&one_time.public_key),
        pq_signed_prekey: encode_b64(&pq_signed_prekey.public_key),
        pq_signed_prekey_signature: encode_b64(&pq_signed_prekey.signature),
        one_time_pq_prekey: encode_b64(&pq_one_time.public_key),
        one_time_pq_prekey_signature: encode_b64(&pq_one_time_signature),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, OneTimePrekey, SignedPrekey};

    async fn seeded_store() -> MemoryStore {
        let store = MemoryStore::new();
        store.create_identity("alice", &[7u8; 32]).await.unwrap();
        store
            .upsert_signed_prekey(
                "alice",
                KeyFamily::Classical,
                &SignedPrekey {
                    public_key: vec![1; 32],
                    signature: vec![2; 64],
                },
            )
            .await
            .unwrap();
        store
            .upsert_signed_prekey(
                "alice",
                KeyFamily::PostQuantum,
                &SignedPrekey {
                    public_key: vec![3; 32],
                    signature: vec![4; 64],
                },
            )
            .await
            .unwrap();
        store
    }

    fn classical_otp() -> OneTimePrekey {
        OneTimePrekey {
            public_key: vec![5; 32],
            signature: None,
        }
    }

    fn pq_otp() -> OneTimePrekey {
        OneTimePrekey {
            public_key: vec![6; 32],
            signature: Some(vec![7; 64]),
        }
    }

    #[tokio::test]
    async fn assembles_full_bundle() {
        let store = seeded_store().await;
        store
            .push_one_time_prekeys("alice", KeyFamily::Classical, &[classical_otp()])
            .await
            .unwrap();
        store
            .push_one_time_prekeys("alice", KeyFamily::PostQuantum, &[pq_otp()])
            .await
            .unwrap();

        let bundle = assemble(&store, "alice").await.unwrap();
        assert_eq!(bundle.identity_key, encode_b64(&[7u8; 32]));
        assert_eq!(bundle.one_time_prekey, encode_b64(&[5u8; 32]));
        assert_eq!(bundle.one_time_pq_prekey, encode_b64(&[6u8; 32]));
        assert_eq!(bundle.one_time_pq_prekey_signature, encode_b64(&[7u8; 64]));
    }

    #[tokio::test]
    async fn unknown_target_is_not_found() {
        let store = MemoryStore::new();
        let err = assemble(&store, "nobody").await.unwrap_err();
        assert!(matches!(err, AppError::IdentityNotFound(_)));
    }

    #[tokio::test]
    async fn missing_pq_signed_prekey_is_incomplete() {
        let store = MemoryStore::new();
        store.create_identity("alice", &[7u8; 32]).await.unwrap();
        store
            .upsert_signed_prekey(
                "alice",
                KeyFamily::Classical,
                &SignedPrekey {
                    public_key: vec![1; 32],
                    signature: vec![2; 64],
                },
            )
            .await
            .unwrap();

        let err = assemble(&store, "alice").await.unwrap_err();
        assert!(matches!(err, AppError::BundleIncomplete(_, "pq")));
    }

    #[tokio::test]
    async fn exhausted_pq_pool_fails_without_consuming_classical_key() {
        let store = seeded_store().await;
        store
            .push_one_time_prekeys("alice", KeyFamily::Classical, &[classical_otp()])
            .await
            .unwrap();

        let err = assemble(&store, "alice").await.unwrap_err();
        assert!(matches!(err, AppError::KeyPoolExhausted(_)));

        // The classical key was not leaked by the failed bundle
        let claimed = store
            .claim_one_unused("alice", KeyFamily::Classical)
            .await
            .unwrap();
        assert!(claimed.is_some());
    }

    #[tokio::test]
    async fn second_fetch_exhausts_the_pools() {
        let store = seeded_store().await;
        store
            .push_one_time_prekeys("alice", KeyFamily::Classical, &[classical_otp()])
            .await
            .unwrap();
        store
            .push_one_time_prekeys("alice", KeyFamily::PostQuantum, &[pq_otp()])
            .await
            .unwrap();

        assert!(assemble(&store, "alice").await.is_ok());
        let err = assemble(&store, "alice").await.unwrap_err();
        assert!(matches!(err, AppError::KeyPoolExhausted(_)));
    }
}
