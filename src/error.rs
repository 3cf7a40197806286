use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;
use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

/// Application error type
///
/// Every failure in the relay core is terminal and client-visible; nothing
/// is retried server-side. Each variant maps to a stable HTTP status and
/// error code.
#[derive(Error, Debug)]
pub enum AppError {
    /// Envelope signature did not verify against the claimed identity's key
    #[error("invalid signature for user '{0}'")]
    InvalidSignature(String),

    /// No identity registered under the given username
    #[error("user '{0}' not found")]
    IdentityNotFound(String),

    /// Bad JSON, bad base64, or a schema mismatch in a request payload
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// A mandatory one-time prekey pool has no unused keys left
    #[error("one-time prekey pool exhausted for user '{0}'")]
    KeyPoolExhausted(String),

    /// Target has no live signed prekey for a required algorithm family
    #[error("prekey bundle incomplete for user '{0}': missing {1} signed prekey")]
    BundleIncomplete(String, &'static str),

    /// Registration attempted for an already-taken username
    #[error("username '{0}' already exists")]
    UsernameTaken(String),

    /// Sliding-window admission control rejected the request
    #[error("rate limit exceeded")]
    RateLimited,

    /// Storage or other internal failure; details never reach the client
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::InvalidSignature(_) | AppError::MalformedPayload(_) => {
                StatusCode::BAD_REQUEST
            }
            AppError::IdentityNotFound(_)
            | AppError::KeyPoolExhausted(_)
            | AppError::BundleIncomplete(_, _) => StatusCode::NOT_FOUND,
            AppError::UsernameTaken(_) => StatusCode::CONFLICT,
            AppError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable error code for programmatic handling
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::InvalidSignature(_) => "INVALID_SIGNATURE",
            AppError::IdentityNotFound(_) => "IDENTITY_NOT_FOUND",
            AppError::MalformedPayload(_) => "MALFORMED_PAYLOAD",
            AppError::KeyPoolExhausted(_) => "KEY_POOL_EXHAUSTED",
            AppError::BundleIncomplete(_, _) => "BUNDLE_INCOMPLETE",
            AppError::UsernameTaken(_) => "USERNAME_TAKEN",
            AppError::RateLimited => "RATE_LIMIT_EXCEEDED",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Log this error with a level matching its severity
    pub fn log(&self) {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(
                error = %self,
                error_code = %self.error_code(),
                "Server error occurred"
            );
        } else {
            tracing::debug!(
                error = %self,
                error_code = %self.error_code(),
                "Client error occurred"
            );
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        self.log();

        let status = self.status_code();

        // Rate limiter rejections are a bare 429 with an empty body
        if matches!(self, AppError::RateLimited) {
            return status.into_response();
        }

        let body = if status.is_server_error() {
            // Never expose internal details to the client
            json!({
                "error": "Internal server error",
                "error_code": self.error_code(),
                "status": status.as_u16(),
            })
        } else {
            json!({
                "error": self.to_string(),
                "error_code": self.error_code(),
                "status": status.as_u16(),
            })
        };

        (status, axum::Json(body)).into_response()
    }
}
