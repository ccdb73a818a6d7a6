//! Chain provider abstraction. One live implementation today (Polygon), but
//! the worker only sees the trait so tests substitute a canned provider.

pub mod polygon;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::types::ChainSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// Worth retrying in place: 5xx, timeouts, connection resets.
    Transient,
    /// Drop the job: 4xx (other than 429), malformed payloads.
    Permanent,
    /// 429: honour Retry-After, requeue the job at most once.
    RateLimited,
}

#[derive(Debug, Error)]
#[error("provider error ({kind:?}, status {http_status:?}): {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub http_status: Option<u16>,
    pub retry_after: Option<Duration>,
    pub message: String,
}

impl ProviderError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Transient,
            http_status: None,
            retry_after: None,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Permanent,
            http_status: None,
            retry_after: None,
            message: message.into(),
        }
    }

    pub fn rate_limited(retry_after: Option<Duration>) -> Self {
        Self {
            kind: ProviderErrorKind::RateLimited,
            http_status: Some(429),
            retry_after,
            message: "rate limited".to_string(),
        }
    }
}

#[async_trait]
pub trait ChainProvider: Send + Sync {
    /// Point-in-time option chain for a ticker. The as-of timestamp is UTC
    /// and non-decreasing across calls for the same ticker.
    async fn get_chain_snapshot(&self, ticker: &str)
        -> std::result::Result<ChainSnapshot, ProviderError>;
}

// ---------------------------------------------------------------------------
// Token bucket: one per provider, shared by all workers
// ---------------------------------------------------------------------------

struct BucketState {
    tokens: f64,
    last_refill: Instant,
    /// Set from 429 Retry-After; no tokens are handed out before this.
    blocked_until: Option<Instant>,
}

/// Global request pacing for a provider. `acquire` suspends until a token is
/// available; a 429 pushes the whole bucket out via `penalize`.
pub struct TokenBucket {
    rate_per_sec: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(rate_per_sec: f64, burst: f64) -> Self {
        Self {
            rate_per_sec,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
                blocked_until: None,
            }),
        }
    }

    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();

                if let Some(until) = state.blocked_until {
                    if now < until {
                        until - now
                    } else {
                        state.blocked_until = None;
                        continue;
                    }
                } else {
                    let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                    state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.burst);
                    state.last_refill = now;

                    if state.tokens >= 1.0 {
                        state.tokens -= 1.0;
                        return;
                    }
                    Duration::from_secs_f64((1.0 - state.tokens) / self.rate_per_sec)
                }
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Push the next hand-out past `delay` from now (Retry-After top-up).
    pub async fn penalize(&self, delay: Duration) {
        let mut state = self.state.lock().await;
        let until = Instant::now() + delay;
        state.blocked_until = Some(match state.blocked_until {
            Some(existing) if existing > until => existing,
            _ => until,
        });
    }
}
