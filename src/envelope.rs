// ============================================================================
// Signed Envelope - Request Authentication
// ============================================================================
//
// Every mutating request arrives wrapped in a signed envelope:
//
//   {"payload": "<minified JSON>", "signature": "<base64>", "username": "..."}
//
// The signature is Ed25519 over the exact UTF-8 bytes of `payload`, produced
// with the private counterpart of the identity key registered for `username`.
// `open` verifies the envelope and decodes the payload into the endpoint's
// typed request, so one implementation serves every endpoint.
//
// `open_unverified` skips signature verification and exists only for the
// registration endpoint, where no identity key is on record yet. It must not
// be reachable from any key-material or mailbox handler.
//
// ============================================================================

use anyhow::anyhow;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::storage::RelayStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedEnvelope {
    /// Minified JSON of the inner request, as signed by the client
    pub payload: String,
    /// Base64 Ed25519 signature over the payload bytes
    pub signature: String,
    /// Identity whose registered key must verify the signature
    pub username: String,
}

/// Verify `signature_b64` over the exact UTF-8 bytes of `payload` with the
/// given Ed25519 public key.
pub fn verify_payload(
    public_key: &[u8],
    signature_b64: &str,
    payload: &str,
    username: &str,
) -> Result<(), AppError> {
    // A stored identity key that fails to parse is server-side corruption,
    // not a client error; registration validates keys before persisting.
    let key_bytes: [u8; 32] = public_key
        .try_into()
        .map_err(|_| anyhow!("stored identity key for '{}' is not 32 bytes", username))?;
    let verifying_key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| anyhow!("stored identity key for '{}' is invalid: {}", username, e))?;

    let signature_bytes = BASE64
        .decode(signature_b64.trim())
        .map_err(|_| AppError::MalformedPayload("signature is not valid base64".to_string()))?;
    let signature_array: [u8; 64] = signature_bytes.try_into().map_err(|_| {
        AppError::MalformedPayload("signature must be 64 bytes".to_string())
    })?;
    let signature = Signature::from_bytes(&signature_array);

    verifying_key
        .verify(payload.as_bytes(), &signature)
        .map_err(|_| AppError::InvalidSignature(username.to_string()))
}

/// Authenticate an envelope and decode its payload into `T`.
///
/// Failure order follows the verification pipeline: unknown identity, then
/// bad signature, then malformed payload. Nothing is mutated before success.
pub async fn open<T: DeserializeOwned>(
    store: &dyn RelayStore,
    envelope: &SignedEnvelope,
) -> Result<T, AppError> {
    let identity = store
        .get_identity(&envelope.username)
        .await?
        .ok_or_else(|| AppError::IdentityNotFound(envelope.username.clone()))?;

    verify_payload(
        &identity.public_key,
        &envelope.signature,
        &envelope.payload,
        &envelope.username,
    )?;

    tracing::debug!(username = %envelope.username, "Envelope signature verified");
    decode_payload(&envelope.payload)
}

/// Decode an envelope payload without signature verification.
///
/// Registration only: there is no key on record to verify against.
pub fn open_unverified<T: DeserializeOwned>(envelope: &SignedEnvelope) -> Result<T, AppError> {
    decode_payload(&envelope.payload)
}

fn decode_payload<T: DeserializeOwned>(payload: &str) -> Result<T, AppError> {
    serde_json::from_str(payload)
        .map_err(|e| AppError::MalformedPayload(format!("payload does not match schema: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};
    use rand::rngs::OsRng;

    fn keypair() -> (SigningKey, VerifyingKey) {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        (signing_key, verifying_key)
    }

    #[test]
    fn verify_accepts_genuine_signature() {
        let (signing_key, verifying_key) = keypair();
        let payload = r#"{"username":"alice"}"#;
        let signature = BASE64.encode(signing_key.sign(payload.as_bytes()).to_bytes());

        assert!(
            verify_payload(verifying_key.as_bytes(), &signature, payload, "alice").is_ok()
        );
    }

    #[test]
    fn verify_rejects_flipped_payload_bit() {
        let (signing_key, verifying_key) = keypair();
        let payload = r#"{"username":"alice"}"#;
        let signature = BASE64.encode(signing_key.sign(payload.as_bytes()).to_bytes());

        // Same length, one character changed
        let tampered = r#"{"username":"alicf"}"#;
        let err =
            verify_payload(verifying_key.as_bytes(), &signature, tampered, "alice").unwrap_err();
        assert!(matches!(err, AppError::InvalidSignature(_)));
    }

    #[test]
    fn verify_rejects_flipped_signature_bit() {
        let (signing_key, verifying_key) = keypair();
        let payload = r#"{"username":"alice"}"#;
        let mut sig_bytes = signing_key.sign(payload.as_bytes()).to_bytes();
        sig_bytes[0] ^= 0x01;
        let signature = BASE64.encode(sig_bytes);

        let err =
            verify_payload(verifying_key.as_bytes(), &signature, payload, "alice").unwrap_err();
        assert!(matches!(err, AppError::InvalidSignature(_)));
    }

    #[test]
    fn verify_rejects_wrong_key() {
        let (signing_key, _) = keypair();
        let (_, other_key) = keypair();
        let payload = r#"{"username":"alice"}"#;
        let signature = BASE64.encode(signing_key.sign(payload.as_bytes()).to_bytes());

        let err = verify_payload(other_key.as_bytes(), &signature, payload, "alice").unwrap_err();
        assert!(matches!(err, AppError::InvalidSignature(_)));
    }

    #[test]
    fn verify_rejects_undecodable_signature() {
        let (_, verifying_key) = keypair();
        let err = verify_payload(verifying_key.as_bytes(), "%%%not-base64%%%", "{}", "alice")
            .unwrap_err();
        assert!(matches!(err, AppError::MalformedPayload(_)));
    }

    #[test]
    fn decode_rejects_schema_mismatch() {
        #[derive(Debug, Deserialize)]
        struct Expected {
            #[allow(dead_code)]
            username: String,
        }

        let err = decode_payload::<Expected>(r#"{"unrelated": 1}"#).unwrap_err();
        assert!(matches!(err, AppError::MalformedPayload(_)));
    }
}
