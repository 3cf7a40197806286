// ============================================================================
// X3DH / PQXDH Routes
// ============================================================================
//
// Endpoints:
// - POST /x3dh/signed_prekey_push     - replace classical signed prekey
// - POST /x3dh/pq_signed_prekey_push  - replace PQ signed prekey
// - POST /x3dh/otp_prekey_push        - append classical one-time prekeys
// - POST /x3dh/pq_otp_prekey_push     - append PQ one-time prekeys
// - POST /x3dh/prekey_bundle          - fetch a bundle, consuming one OTP
//                                       from each pool
// - POST /x3dh/post_return_message    - store an encrypted initial message
// - POST /x3dh/grab_return_messages   - retrieve and delete pending messages
//
// Every request body is a signed envelope; handlers never see a payload that
// failed verification.
//
// ============================================================================

use axum::{extract::State, response::IntoResponse, Json};
use std::sync::Arc;

use crate::bundle;
use crate::context::AppContext;
use crate::envelope::{self, SignedEnvelope};
use crate::error::AppError;
use crate::storage::{KeyFamily, MailboxMessage, OneTimePrekey, SignedPrekey};
use crate::wire::{
    decode_b64, encode_b64, GetPrekeyBundleRequest, GrabReturnMessages,
    GrabReturnMessagesRequest, MessageResponse, OtpPrekeyPush, PostReturnMessage,
    PqOtpPrekeyPush, PqSignedPrekeyPush, ReturnMessage, SignedPrekeyPush,
};

async fn require_identity(ctx: &AppContext, username: &str) -> Result<(), AppError> {
    ctx.store
        .get_identity(username)
        .await?
        .map(|_| ())
        .ok_or_else(|| AppError::IdentityNotFound(username.to_string()))
}

/// POST /x3dh/signed_prekey_push
pub async fn signed_prekey_push(
    State(ctx): State<Arc<AppContext>>,
    Json(envelope): Json<SignedEnvelope>,
) -> Result<impl IntoResponse, AppError> {
    let data: SignedPrekeyPush = envelope::open(ctx.store.as_ref(), &envelope).await?;
    require_identity(&ctx, &data.username).await?;

    let prekey = SignedPrekey {
        public_key: decode_b64("signed_prekey_public", &data.signed_prekey_public)?,
        signature: decode_b64("signed_prekey_signature", &data.signed_prekey_signature)?,
    };
    ctx.store
        .upsert_signed_prekey(&data.username, KeyFamily::Classical, &prekey)
        .await?;

    tracing::info!(username = %data.username, "Classical signed prekey stored");
    Ok(Json(MessageResponse::new("Signed prekey push received")))
}

/// POST /x3dh/pq_signed_prekey_push
pub async fn pq_signed_prekey_push(
    State(ctx): State<Arc<AppContext>>,
    Json(envelope): Json<SignedEnvelope>,
) -> Result<impl IntoResponse, AppError> {
    let data: PqSignedPrekeyPush = envelope::open(ctx.store.as_ref(), &envelope).await?;
    require_identity(&ctx, &data.username).await?;

    let prekey = SignedPrekey {
        public_key: decode_b64("pq_signed_prekey_public", &data.pq_signed_prekey_public)?,
        signature: decode_b64(
            "pq_signed_prekey_signature",
            &data.pq_signed_prekey_signature,
        )?,
    };
    ctx.store
        .upsert_signed_prekey(&data.username, KeyFamily::PostQuantum, &prekey)
        .await?;

    tracing::info!(username = %data.username, "PQ signed prekey stored");
    Ok(Json(MessageResponse::new("PQ signed prekey push received")))
}

/// POST /x3dh/otp_prekey_push
pub async fn otp_prekey_push(
    State(ctx): State<Arc<AppContext>>,
    Json(envelope): Json<SignedEnvelope>,
) -> Result<impl IntoResponse, AppError> {
    let data: OtpPrekeyPush = envelope::open(ctx.store.as_ref(), &envelope).await?;
    require_identity(&ctx, &data.username).await?;

    if data.pub_otps.is_empty() {
        return Err(AppError::MalformedPayload(
            "pub_otps must not be empty".to_string(),
        ));
    }

    let mut keys = Vec::with_capacity(data.pub_otps.len());
    for encoded in &data.pub_otps {
        keys.push(OneTimePrekey {
            public_key: decode_b64("pub_otps", encoded)?,
            signature: None,
        });
    }
    ctx.store
        .push_one_time_prekeys(&data.username, KeyFamily::Classical, &keys)
        .await?;

    tracing::info!(
        username = %data.username,
        count = keys.len(),
        "One-time prekeys stored"
    );
    Ok(Json(MessageResponse::new("OTP prekey push received")))
}

/// POST /x3dh/pq_otp_prekey_push
pub async fn pq_otp_prekey_push(
    State(ctx): State<Arc<AppContext>>,
    Json(envelope): Json<SignedEnvelope>,
) -> Result<impl IntoResponse, AppError> {
    let data: PqOtpPrekeyPush = envelope::open(ctx.store.as_ref(), &envelope).await?;
    require_identity(&ctx, &data.username).await?;

    if data.pub_pq_otps.is_empty() {
        return Err(AppError::MalformedPayload(
            "pub_pq_otps must not be empty".to_string(),
        ));
    }

    let mut keys = Vec::with_capacity(data.pub_pq_otps.len());
    for entry in &data.pub_pq_otps {
        keys.push(OneTimePrekey {
            public_key: decode_b64("pub_pq_otps.public_key", &entry.public_key)?,
            signature: Some(decode_b64("pub_pq_otps.signature", &entry.signature)?),
        });
    }
    ctx.store
        .push_one_time_prekeys(&data.username, KeyFamily::PostQuantum, &keys)
        .await?;

    tracing::info!(
        username = %data.username,
        count = keys.len(),
        "PQ one-time prekeys stored"
    );
    Ok(Json(MessageResponse::new("PQ OTP prekey push received")))
}

/// POST /x3dh/prekey_bundle
pub async fn prekey_bundle(
    State(ctx): State<Arc<AppContext>>,
    Json(envelope): Json<SignedEnvelope>,
) -> Result<impl IntoResponse, AppError> {
    let data: GetPrekeyBundleRequest = envelope::open(ctx.store.as_ref(), &envelope).await?;

    tracing::debug!(
        requester = %data.username,
        target = %data.target_username,
        "Fetching prekey bundle"
    );
    let bundle = bundle::assemble(ctx.store.as_ref(), &data.target_username).await?;
    Ok(Json(bundle))
}

/// POST /x3dh/post_return_message
pub async fn post_return_message(
    State(ctx): State<Arc<AppContext>>,
    Json(envelope): Json<SignedEnvelope>,
) -> Result<impl IntoResponse, AppError> {
    let data: PostReturnMessage = envelope::open(ctx.store.as_ref(), &envelope).await?;

    // Both parties must exist before anything is written; a failed lookup
    // must not leave a partial mailbox row.
    require_identity(&ctx, &data.sharer_username).await?;
    require_identity(&ctx, &data.recipient_username).await?;

    let message = MailboxMessage {
        recipient_username: data.recipient_username.clone(),
        sharer_username: data.sharer_username.clone(),
        sharer_identity_key: decode_b64(
            "sharer_identity_key_public",
            &data.sharer_identity_key_public,
        )?,
        sharer_ephemeral_key: decode_b64(
            "sharer_ephemeral_key_public",
            &data.sharer_ephemeral_key_public,
        )?,
        otp_hash: decode_b64("otp_hash", &data.otp_hash)?,
        encrypted_message: decode_b64("encrypted_message", &data.encrypted_message)?,
        kem_ciphertext: decode_b64("kem_ciphertext", &data.kem_ciphertext)?,
        pq_otp_hash: decode_b64("pq_otp_hash", &data.pq_otp_hash)?,
    };
    ctx.store.store_message(&message).await?;

    tracing::info!(
        recipient = %data.recipient_username,
        sharer = %data.sharer_username,
        "Initial message stored"
    );
    Ok(Json(MessageResponse::new("Message posted successfully")))
}

/// POST /x3dh/grab_return_messages
pub async fn grab_return_messages(
    State(ctx): State<Arc<AppContext>>,
    Json(envelope): Json<SignedEnvelope>,
) -> Result<impl IntoResponse, AppError> {
    let data: GrabReturnMessagesRequest = envelope::open(ctx.store.as_ref(), &envelope).await?;
    require_identity(&ctx, &data.username).await?;

    let records = ctx.store.take_messages(&data.username).await?;
    let messages: Vec<ReturnMessage> = records
        .into_iter()
        .map(|record| ReturnMessage {
            sharer_identity_key_public: encode_b64(&record.sharer_identity_key),
            sharer_ephemeral_key_public: encode_b64(&record.sharer_ephemeral_key),
            sharer_username: record.sharer_username,
            otp_hash: encode_b64(&record.otp_hash),
            encrypted_message: encode_b64(&record.encrypted_message),
            kem_ciphertext: encode_b64(&record.kem_ciphertext),
            pq_otp_hash: encode_b64(&record.pq_otp_hash),
        })
        .collect();

    tracing::info!(
        username = %data.username,
        count = messages.len(),
        "Initial messages retrieved and deleted"
    );
    Ok(Json(GrabReturnMessages { messages }))
}
