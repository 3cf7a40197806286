// ============================================================================
// Axum Routes
// ============================================================================
//
// Structure:
// - mod.rs: router assembly and layering
// - middleware.rs: request logging
// - health.rs: liveness probe
// - auth.rs: identity registration (no-signature envelope)
// - x3dh.rs: key material and mailbox endpoints (signed envelopes)
//
// Admission control runs before anything else on every mutating request.
//
// ============================================================================

mod auth;
mod health;
mod middleware;
mod x3dh;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::context::AppContext;
use crate::rate_limit;

/// Create the main application router with all routes
pub fn create_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/auth/register", post(auth::register))
        .route("/x3dh/signed_prekey_push", post(x3dh::signed_prekey_push))
        .route(
            "/x3dh/pq_signed_prekey_push",
            post(x3dh::pq_signed_prekey_push),
        )
        .route("/x3dh/otp_prekey_push", post(x3dh::otp_prekey_push))
        .route("/x3dh/pq_otp_prekey_push", post(x3dh::pq_otp_prekey_push))
        .route("/x3dh/prekey_bundle", post(x3dh::prekey_bundle))
        .route(
            "/x3dh/post_return_message",
            post(x3dh::post_return_message),
        )
        .route(
            "/x3dh/grab_return_messages",
            post(x3dh::grab_return_messages),
        )
        // Order matters: the last layer added runs first
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(axum::middleware::from_fn(middleware::request_logging))
                .into_inner(),
        )
        .layer(axum::middleware::from_fn_with_state(
            ctx.clone(),
            rate_limit::admission_control,
        ))
        .with_state(ctx)
}
