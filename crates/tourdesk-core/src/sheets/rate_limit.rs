//! Rolling one-minute request budget shared by every spreadsheet call

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Request budget consulted before each spreadsheet call
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Whether the budget for the current window is spent
    async fn should_throttle(&self) -> bool;

    /// Count one outgoing request
    async fn record_request(&self);

    /// How long until the next request fits in the window
    async fn wait_time(&self) -> Duration;

    fn metrics_snapshot(&self) -> RateLimitMetricsSnapshot;
}

/// Rolling-window limiter held in process memory.
///
/// Each process has its own window, so several instances writing to the same
/// spreadsheet can jointly exceed the quota.
#[derive(Clone)]
pub struct LocalRateLimiter {
    requests: Arc<Mutex<VecDeque<Instant>>>,
    window: Duration,
    limit: u32,
    metrics: Arc<RateLimitMetrics>,
}

#[derive(Default)]
struct RateLimitMetrics {
    recorded: AtomicU64,
    throttled: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct RateLimitMetricsSnapshot {
    pub recorded: u64,
    pub throttled: u64,
}

impl LocalRateLimiter {
    pub fn per_minute(limit: u32) -> Self {
        Self::new(limit, Duration::from_secs(60))
    }

    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            requests: Arc::new(Mutex::new(VecDeque::new())),
            window,
            limit,
            metrics: Arc::new(RateLimitMetrics::default()),
        }
    }

    fn prune(&self, requests: &mut VecDeque<Instant>, now: Instant) {
        while let Some(oldest) = requests.front() {
            if now.duration_since(*oldest) >= self.window {
                requests.pop_front();
            } else {
                break;
            }
        }
    }
}

#[async_trait]
impl RateLimiter for LocalRateLimiter {
    async fn should_throttle(&self) -> bool {
        let now = Instant::now();
        let mut guard = self.requests.lock().await;
        self.prune(&mut guard, now);

        let throttled = guard.len() >= self.limit as usize;
        if throttled {
            self.metrics.throttled.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                limit = self.limit,
                window_secs = self.window.as_secs(),
                "Local sheets rate limit reached"
            );
        }
        throttled
    }

    async fn record_request(&self) {
        let now = Instant::now();
        let mut guard = self.requests.lock().await;
        self.prune(&mut guard, now);
        guard.push_back(now);
        self.metrics.recorded.fetch_add(1, Ordering::Relaxed);
    }

    async fn wait_time(&self) -> Duration {
        let now = Instant::now();
        let mut guard = self.requests.lock().await;
        self.prune(&mut guard, now);

        if guard.len() < self.limit as usize {
            return Duration::ZERO;
        }
        // The window reopens when enough old requests age out
        let excess = guard.len() + 1 - self.limit as usize;
        guard.get(excess - 1).map_or(Duration::ZERO, |instant| {
            self.window.saturating_sub(now.duration_since(*instant))
        })
    }

    fn metrics_snapshot(&self) -> RateLimitMetricsSnapshot {
        RateLimitMetricsSnapshot {
            recorded: self.metrics.recorded.load(Ordering::Relaxed),
            throttled: self.metrics.throttled.load(Ordering::Relaxed),
        }
    }
}
