use crate::config::Config;
use crate::rate_limit::SlidingWindowLimiter;
use crate::storage::RelayStore;
use std::sync::Arc;

/// Application context containing shared dependencies
///
/// Handlers receive this through axum state; the store is behind a trait
/// object so the same handlers run against Postgres or the in-memory store.
#[derive(Clone)]
pub struct AppContext {
    pub store: Arc<dyn RelayStore>,
    pub limiter: Arc<SlidingWindowLimiter>,
    pub config: Arc<Config>,
}

impl AppContext {
    pub fn new(store: Arc<dyn RelayStore>, config: Arc<Config>) -> Self {
        let limiter = Arc::new(SlidingWindowLimiter::new(
            config.rate_limit.requests_per_second,
            std::time::Duration::from_secs(config.rate_limit.timeout_period_secs),
        ));
        Self {
            store,
            limiter,
            config,
        }
    }
}
