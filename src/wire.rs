// ============================================================================
// Wire Types
// ============================================================================
//
// Inner request and response bodies for every endpoint. All key material
// crosses the wire base64-encoded; raw bytes exist only inside the storage
// layer.
//
// ============================================================================

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Decode a base64 request field, naming the field in the error
pub fn decode_b64(field: &'static str, value: &str) -> Result<Vec<u8>, AppError> {
    BASE64
        .decode(value)
        .map_err(|_| AppError::MalformedPayload(format!("{} is not valid base64", field)))
}

pub fn encode_b64(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

// ============================================================================
// Registration (no-signature collaborator endpoint)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterAccount {
    pub username: String,
    /// Base64 Ed25519 identity public key (32 bytes)
    pub public_key: String,
}

// ============================================================================
// Key material pushes
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedPrekeyPush {
    pub username: String,
    pub signed_prekey_public: String,
    pub signed_prekey_signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PqSignedPrekeyPush {
    pub username: String,
    pub pq_signed_prekey_public: String,
    pub pq_signed_prekey_signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtpPrekeyPush {
    pub username: String,
    /// One-time prekey public keys, base64
    pub pub_otps: Vec<String>,
}

/// A post-quantum one-time prekey travels with its own signature so the
/// requester can authenticate it against the identity key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PqOtpEntry {
    pub public_key: String,
    pub signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PqOtpPrekeyPush {
    pub username: String,
    pub pub_pq_otps: Vec<PqOtpEntry>,
}

// ============================================================================
// Prekey bundle fetch
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetPrekeyBundleRequest {
    pub username: String,
    pub target_username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrekeyBundleResponse {
    pub identity_key: String,
    pub signed_prekey: String,
    pub signed_prekey_signature: String,
    pub one_time_prekey: String,
    pub pq_signed_prekey: String,
    pub pq_signed_prekey_signature: String,
    pub one_time_pq_prekey: String,
    pub one_time_pq_prekey_signature: String,
}

// ============================================================================
// Mailbox
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostReturnMessage {
    pub sharer_username: String,
    pub recipient_username: String,
    pub sharer_identity_key_public: String,
    pub sharer_ephemeral_key_public: String,
    /// SHA-256 hash of the classical one-time prekey the sharer consumed
    pub otp_hash: String,
    pub encrypted_message: String,
    pub kem_ciphertext: String,
    pub pq_otp_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrabReturnMessagesRequest {
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReturnMessage {
    pub sharer_identity_key_public: String,
    pub sharer_ephemeral_key_public: String,
    pub sharer_username: String,
    pub otp_hash: String,
    pub encrypted_message: String,
    pub kem_ciphertext: String,
    pub pq_otp_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrabReturnMessages {
    pub messages: Vec<ReturnMessage>,
}

// ============================================================================
// Generic acknowledgements
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
