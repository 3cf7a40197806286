// ============================================================================
// Registration Route
// ============================================================================
//
// The one endpoint served through the no-signature envelope variant: a new
// client has no key on record to verify against. Everything under /x3dh/*
// goes through full envelope verification instead.
//
// ============================================================================

use axum::{extract::State, response::IntoResponse, Json};
use ed25519_dalek::VerifyingKey;
use std::sync::Arc;

use crate::context::AppContext;
use crate::envelope::{self, SignedEnvelope};
use crate::error::AppError;
use crate::wire::{decode_b64, MessageResponse, RegisterAccount};

/// POST /auth/register
/// Registers a username with its long-term Ed25519 identity public key.
pub async fn register(
    State(ctx): State<Arc<AppContext>>,
    Json(envelope): Json<SignedEnvelope>,
) -> Result<impl IntoResponse, AppError> {
    let data: RegisterAccount = envelope::open_unverified(&envelope)?;

    // Reject keys that could never verify an envelope later
    let public_key = decode_b64("public_key", &data.public_key)?;
    let key_bytes: [u8; 32] = public_key
        .as_slice()
        .try_into()
        .map_err(|_| AppError::MalformedPayload("public_key must be 32 bytes".to_string()))?;
    VerifyingKey::from_bytes(&key_bytes).map_err(|_| {
        AppError::MalformedPayload("public_key is not a valid Ed25519 key".to_string())
    })?;

    if !ctx.store.create_identity(&data.username, &public_key).await? {
        return Err(AppError::UsernameTaken(data.username));
    }

    tracing::info!(username = %data.username, "User registered");
    Ok(Json(MessageResponse::new("User registered successfully")))
}
