use axum::{http::StatusCode, response::IntoResponse};

/// GET /health
/// Liveness probe; never rate limited.
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
