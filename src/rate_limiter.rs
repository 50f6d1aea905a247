//! Bucketed admission control for outbound LLM calls.
//!
//! A process-wide registry maps a rendered bucket key (default template
//! `"{provider}:{model}"`) to one or two limiter cells:
//!
//! - a **token bucket** refilling at `qps` tokens/sec up to `burst`, for
//!   smoothing;
//! - a **sliding window** holding a ring of admission timestamps, for a
//!   strict cap of `limit` events per `window_seconds`.
//!
//! When both cells are attached, both must admit before a call proceeds.
//! Admission follows the caller's strategy: `wait` sleeps until capacity
//! accrues (bounded by an optional timeout), `error` fails immediately with
//! a rate-limit error. There is no global queue; backpressure is purely
//! per-bucket.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{LlmError, Result};

/// Longest single sleep inside an admission loop; keeps waits responsive to
/// cancellation and refill progress.
const MAX_SLEEP: Duration = Duration::from_millis(500);

/// What to do when a bucket cannot admit immediately.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcquireStrategy {
    /// Sleep until capacity accrues (optionally bounded by a timeout).
    #[default]
    Wait,
    /// Fail immediately with a rate-limit error.
    Error,
}

/// Render a bucket-key template, substituting `{provider}` and `{model}`.
pub fn render_bucket_key(template: &str, provider: &str, model: &str) -> String {
    template
        .replace("{provider}", provider)
        .replace("{model}", model)
}

/// Map an RPM figure onto token-bucket parameters.
///
/// `qps = rpm / 60`, `burst = max(1, rpm / 60)`.
pub fn rpm_to_bucket(rpm: u32) -> (f64, u32) {
    let qps = rpm as f64 / 60.0;
    (qps, (rpm / 60).max(1))
}

// ============================================================================
// Cells
// ============================================================================

/// Token bucket with continuous refill.
#[derive(Debug)]
struct TokenBucketCell {
    qps: f64,
    burst: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucketCell {
    fn new(qps: f64, burst: u32) -> Self {
        Self {
            qps,
            burst: burst as f64,
            tokens: burst as f64,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.qps).min(self.burst);
            self.last_refill = now;
        }
    }

    fn try_acquire(&mut self, tokens: f64) -> bool {
        self.refill();
        if self.tokens >= tokens {
            self.tokens -= tokens;
            true
        } else {
            false
        }
    }

    fn time_to_acquire(&mut self, tokens: f64) -> Duration {
        self.refill();
        if self.tokens >= tokens {
            Duration::ZERO
        } else if self.qps <= 0.0 {
            // No refill configured; the caller's timeout is the only way out.
            Duration::from_secs(3600)
        } else {
            Duration::from_secs_f64((tokens - self.tokens) / self.qps)
        }
    }
}

/// Sliding window over a ring of admission timestamps.
#[derive(Debug)]
struct WindowCell {
    limit: usize,
    window: Duration,
    ring: VecDeque<Instant>,
}

impl WindowCell {
    fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            ring: VecDeque::new(),
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.ring.front() {
            if now.duration_since(*front) >= self.window {
                self.ring.pop_front();
            } else {
                break;
            }
        }
    }

    fn try_acquire(&mut self) -> bool {
        let now = Instant::now();
        self.prune(now);
        if self.ring.len() < self.limit {
            self.ring.push_back(now);
            true
        } else {
            false
        }
    }

    fn time_to_acquire(&mut self) -> Duration {
        let now = Instant::now();
        self.prune(now);
        if self.ring.len() < self.limit {
            Duration::ZERO
        } else {
            let oldest = *self.ring.front().expect("ring is full");
            self.window
                .checked_sub(now.duration_since(oldest))
                .unwrap_or(Duration::ZERO)
        }
    }
}

#[derive(Debug, Default)]
struct Bucket {
    token: Option<TokenBucketCell>,
    window: Option<WindowCell>,
}

// ============================================================================
// Registry
// ============================================================================

/// Process-wide registry of limiter buckets keyed by rendered key.
///
/// Per-bucket mutation is serialised by that bucket's own lock; the registry
/// lock is only held long enough to look a bucket up.
#[derive(Debug, Default)]
pub struct RateLimiterRegistry {
    buckets: Mutex<HashMap<String, Arc<Mutex<Bucket>>>>,
}

static GLOBAL: OnceLock<Arc<RateLimiterRegistry>> = OnceLock::new();

impl RateLimiterRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry, initialised on first use.
    pub fn global() -> Arc<RateLimiterRegistry> {
        GLOBAL
            .get_or_init(|| Arc::new(RateLimiterRegistry::new()))
            .clone()
    }

    async fn bucket(&self, key: &str) -> Arc<Mutex<Bucket>> {
        let mut buckets = self.buckets.lock().await;
        buckets.entry(key.to_string()).or_default().clone()
    }

    /// Look up a bucket without creating one.
    async fn existing_bucket(&self, key: &str) -> Option<Arc<Mutex<Bucket>>> {
        self.buckets.lock().await.get(key).cloned()
    }

    /// Attach (or replace) a token-bucket cell on a key.
    pub async fn configure_bucket(&self, key: &str, qps: f64, burst: u32) {
        let bucket = self.bucket(key).await;
        bucket.lock().await.token = Some(TokenBucketCell::new(qps, burst));
    }

    /// Attach (or replace) a sliding-window cell on a key.
    pub async fn configure_window(&self, key: &str, limit: usize, window_seconds: f64) {
        let bucket = self.bucket(key).await;
        bucket.lock().await.window =
            Some(WindowCell::new(limit, Duration::from_secs_f64(window_seconds)));
    }

    /// Attach a token bucket derived from an RPM figure.
    pub async fn configure_rpm(&self, key: &str, rpm: u32) {
        let (qps, burst) = rpm_to_bucket(rpm);
        self.configure_bucket(key, qps, burst).await;
    }

    /// Whether any cell is configured for the key.
    pub async fn is_configured(&self, key: &str) -> bool {
        match self.existing_bucket(key).await {
            Some(bucket) => {
                let b = bucket.lock().await;
                b.token.is_some() || b.window.is_some()
            }
            None => false,
        }
    }

    /// Acquire one admission from every cell attached to the key.
    ///
    /// A key with no configured cells admits immediately. The token bucket
    /// is consulted first (smoothing), then the window (strict cap).
    pub async fn acquire(
        &self,
        key: &str,
        strategy: AcquireStrategy,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let Some(bucket) = self.existing_bucket(key).await else {
            return Ok(());
        };
        let start = Instant::now();

        // Token bucket first.
        loop {
            let wait = {
                let mut b = bucket.lock().await;
                let Some(cell) = b.token.as_mut() else { break };
                if cell.try_acquire(1.0) {
                    break;
                }
                cell.time_to_acquire(1.0)
            };
            self.wait_or_fail(key, "token bucket", strategy, timeout, start, wait)
                .await?;
        }

        // Then the strict window.
        loop {
            let wait = {
                let mut b = bucket.lock().await;
                let Some(cell) = b.window.as_mut() else { break };
                if cell.try_acquire() {
                    break;
                }
                cell.time_to_acquire()
            };
            self.wait_or_fail(key, "window", strategy, timeout, start, wait)
                .await?;
        }

        Ok(())
    }

    async fn wait_or_fail(
        &self,
        key: &str,
        cell: &str,
        strategy: AcquireStrategy,
        timeout: Option<Duration>,
        start: Instant,
        wait: Duration,
    ) -> Result<()> {
        if strategy == AcquireStrategy::Error {
            return Err(LlmError::RateLimited(format!(
                "bucket '{}' refused admission ({})",
                key, cell
            )));
        }
        if let Some(timeout) = timeout {
            if start.elapsed() + wait > timeout {
                return Err(LlmError::RateLimited(format!(
                    "bucket '{}' admission timed out after {:?} ({})",
                    key, timeout, cell
                )));
            }
        }
        debug!(key, cell, wait_ms = wait.as_millis() as u64, "rate limited, waiting");
        tokio::time::sleep(wait.min(MAX_SLEEP)).await;
        Ok(())
    }
}
