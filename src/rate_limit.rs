// ============================================================================
// Sliding-Window Rate Limiting
// ============================================================================
//
// Per-key admission control in front of every mutating request. Each key
// (client IP, and claimed username when one can be extracted) owns a FIFO of
// request timestamps; entries older than one second are pruned from the
// front on every check. Overflowing the window puts the key in the penalty
// box, which rejects without touching the window until the timeout expires.
//
// State is process-local and protected by a plain mutex; it is an admission
// heuristic, not a durability guarantee, and losing it on restart is fine.
//
// ============================================================================

use axum::body::{to_bytes, Body};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::MAX_REQUEST_BODY_SIZE;
use crate::context::AppContext;
use crate::envelope::SignedEnvelope;
use crate::error::AppError;

const WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Admit,
    Reject,
}

#[derive(Default)]
struct LimiterState {
    windows: HashMap<String, VecDeque<Instant>>,
    penalty_box: HashMap<String, Instant>,
}

pub struct SlidingWindowLimiter {
    max_per_second: usize,
    timeout_period: Duration,
    state: Mutex<LimiterState>,
}

impl SlidingWindowLimiter {
    pub fn new(max_per_second: usize, timeout_period: Duration) -> Self {
        Self {
            max_per_second,
            timeout_period,
            state: Mutex::new(LimiterState::default()),
        }
    }

    pub fn check(&self, key: &str) -> Decision {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &str, now: Instant) -> Decision {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(&penalized_at) = state.penalty_box.get(key) {
            if now.duration_since(penalized_at) <= self.timeout_period {
                return Decision::Reject;
            }
            state.penalty_box.remove(key);
        }

        let window = state.windows.entry(key.to_string()).or_default();
        window.push_back(now);
        while let Some(&oldest) = window.front() {
            if now.duration_since(oldest) > WINDOW {
                window.pop_front();
            } else {
                break;
            }
        }

        if window.len() > self.max_per_second {
            state.penalty_box.insert(key.to_string(), now);
            tracing::warn!(key = %key, "Rate limit exceeded, key entering penalty box");
            Decision::Reject
        } else {
            Decision::Admit
        }
    }
}

// ============================================================================
// Admission middleware
// ============================================================================

fn is_mutating(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::DELETE | Method::PATCH
    )
}

/// First IP in x-forwarded-for, then x-real-ip, then the socket address
fn extract_client_ip(headers: &axum::http::HeaderMap, direct_ip: Option<IpAddr>) -> Option<String> {
    if let Some(forwarded_for) = headers.get("x-forwarded-for") {
        if let Ok(forwarded_str) = forwarded_for.to_str() {
            // Can hold a chain "client, proxy1, proxy2"; the first entry is
            // the original client
            let first = forwarded_str.split(',').next().unwrap_or("").trim();
            if let Ok(ip) = first.parse::<IpAddr>() {
                return Some(ip.to_string());
            }
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip") {
        if let Ok(real_ip_str) = real_ip.to_str() {
            if let Ok(ip) = real_ip_str.trim().parse::<IpAddr>() {
                return Some(ip.to_string());
            }
        }
    }

    direct_ip.map(|ip| ip.to_string())
}

/// Best-effort extraction of the claimed identity from an envelope body.
/// Any failure here just skips identity-based limiting.
fn sniff_username(body: &[u8]) -> Option<String> {
    serde_json::from_slice::<SignedEnvelope>(body)
        .ok()
        .map(|envelope| envelope.username)
}

/// Sliding-window admission control.
///
/// Non-mutating verbs bypass accounting entirely. Mutating requests are
/// checked per client IP, then per claimed username once the body has been
/// buffered. Rejection is a bare 429 with an empty body.
pub async fn admission_control(
    State(ctx): State<Arc<AppContext>>,
    request: Request,
    next: Next,
) -> Response {
    if !is_mutating(request.method()) {
        return next.run(request).await;
    }

    let direct_ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip());

    if let Some(ip) = extract_client_ip(request.headers(), direct_ip) {
        if ctx.limiter.check(&ip) == Decision::Reject {
            return AppError::RateLimited.into_response();
        }
    }

    // Buffer the body so the claimed username can be inspected; the request
    // is rebuilt from the same bytes afterwards.
    let (parts, body) = request.into_parts();
    let bytes = match to_bytes(body, MAX_REQUEST_BODY_SIZE).await {
        Ok(bytes) => bytes,
        Err(_) => return StatusCode::PAYLOAD_TOO_LARGE.into_response(),
    };

    if let Some(username) = sniff_username(&bytes) {
        if ctx.limiter.check(&username) == Decision::Reject {
            return AppError::RateLimited.into_response();
        }
    }

    let request = Request::from_parts(parts, Body::from(bytes));
    next.run(request).await
}
