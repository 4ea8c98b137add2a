use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;

use crate::config::RateLimitSettings;
use crate::error::DispatchError;
use crate::metrics::prometheus as metrics;

/// Continuous-refill token bucket. All state transitions take an explicit
/// `now` so the arithmetic is testable without a clock.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rate: f64, capacity: f64) -> Self {
        Self {
            rate,
            capacity,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
            self.last_refill = now;
        }
    }

    fn try_take(&mut self, cost: f64, now: Instant) -> bool {
        self.refill(now);
        // Small epsilon absorbs float drift from repeated refills.
        if self.tokens + 1e-9 >= cost {
            self.tokens = (self.tokens - cost).max(0.0);
            true
        } else {
            false
        }
    }

    fn put_back(&mut self, cost: f64) {
        self.tokens = (self.tokens + cost).min(self.capacity);
    }

    /// How long until `cost` tokens could be available, assuming no
    /// competing consumers.
    fn wait_hint(&self, cost: f64) -> Duration {
        let missing = (cost - self.tokens).max(0.0);
        Duration::from_secs_f64(missing / self.rate)
    }

    fn available(&mut self, now: Instant) -> f64 {
        self.refill(now);
        self.tokens
    }
}

/// Proof of admission. Created on a successful acquire, refunded once on
/// release; double-release is a no-op.
#[derive(Debug)]
pub struct RequestToken {
    key: Option<String>,
    cost: u32,
    issued_at: Instant,
    completed: AtomicBool,
}

impl RequestToken {
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn cost(&self) -> u32 {
        self.cost
    }

    pub fn issued_at(&self) -> Instant {
        self.issued_at
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterSnapshot {
    pub granted: u64,
    pub blocked_requests: u64,
    pub timeouts: u64,
    pub global_tokens: f64,
    pub tracked_keys: usize,
}

/// Two-stage admission control: a request must pass the global bucket before
/// its per-key bucket. If the per-key stage times out, the global tokens
/// already consumed are refunded under the global lock before the failure is
/// returned.
pub struct RateLimiter {
    settings: RateLimitSettings,
    global: Mutex<TokenBucket>,
    per_key: Mutex<HashMap<String, Arc<Mutex<TokenBucket>>>>,
    granted: AtomicU64,
    blocked_requests: AtomicU64,
    timeouts: AtomicU64,
}

impl RateLimiter {
    pub fn new(settings: RateLimitSettings) -> Self {
        let global = TokenBucket::new(settings.global_rate, settings.global_capacity);
        Self {
            settings,
            global: Mutex::new(global),
            per_key: Mutex::new(HashMap::new()),
            granted: AtomicU64::new(0),
            blocked_requests: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
        }
    }

    fn validate_cost(&self, cost: u32, key: Option<&str>) -> Result<(), DispatchError> {
        if cost == 0 {
            return Err(DispatchError::Config(
                "rate limit cost must be positive".to_string(),
            ));
        }
        if (cost as f64) > self.settings.global_capacity {
            return Err(DispatchError::Config(format!(
                "cost {} exceeds global bucket capacity {}",
                cost, self.settings.global_capacity
            )));
        }
        if key.is_some() && (cost as f64) > self.settings.per_key_capacity {
            return Err(DispatchError::Config(format!(
                "cost {} exceeds per-key bucket capacity {}",
                cost, self.settings.per_key_capacity
            )));
        }
        Ok(())
    }

    async fn key_bucket(&self, key: &str) -> Arc<Mutex<TokenBucket>> {
        let mut map = self.per_key.lock().await;
        map.entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(TokenBucket::new(
                    self.settings.per_key_rate,
                    self.settings.per_key_capacity,
                )))
            })
            .clone()
    }

    /// Sleep-retry until the bucket grants `cost` or the deadline passes.
    /// The lock is only held for the take attempt, never across a sleep.
    async fn wait_on(&self, bucket: &Mutex<TokenBucket>, cost: f64, deadline: Instant) -> bool {
        loop {
            let hint = {
                let mut b = bucket.lock().await;
                if b.try_take(cost, Instant::now()) {
                    return true;
                }
                b.wait_hint(cost)
            };
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let remaining = deadline.saturating_duration_since(now);
            sleep(hint.min(remaining).max(Duration::from_millis(5))).await;
        }
    }

    fn timeout_error(&self, key: Option<&str>, started: Instant) -> DispatchError {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
        metrics::inc_rate_limit_timeouts();
        DispatchError::RateLimitTimeout {
            key: key.map(str::to_string),
            waited_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// Blocking admission with a deadline. Global stage first, then the
    /// per-key stage with whatever time is left.
    pub async fn acquire(
        &self,
        key: Option<&str>,
        cost: u32,
        timeout: Duration,
    ) -> Result<RequestToken, DispatchError> {
        self.validate_cost(cost, key)?;
        let started = Instant::now();
        let deadline = started + timeout;

        if !self.wait_on(&self.global, cost as f64, deadline).await {
            return Err(self.timeout_error(key, started));
        }

        if let Some(k) = key {
            let bucket = self.key_bucket(k).await;
            if !self.wait_on(&bucket, cost as f64, deadline).await {
                // Hard contract: the global tokens consumed above must come
                // back before the failure surfaces.
                self.global.lock().await.put_back(cost as f64);
                return Err(self.timeout_error(key, started));
            }
        }

        self.granted.fetch_add(1, Ordering::Relaxed);
        Ok(RequestToken {
            key: key.map(str::to_string),
            cost,
            issued_at: started,
            completed: AtomicBool::new(false),
        })
    }

    /// Non-blocking admission. Returns `None` (and counts a blocked request)
    /// when either stage refuses.
    pub async fn try_acquire(
        &self,
        key: Option<&str>,
        cost: u32,
    ) -> Result<Option<RequestToken>, DispatchError> {
        self.validate_cost(cost, key)?;

        let granted_global = self.global.lock().await.try_take(cost as f64, Instant::now());
        if !granted_global {
            self.blocked_requests.fetch_add(1, Ordering::Relaxed);
            metrics::inc_rate_limit_blocked();
            return Ok(None);
        }

        if let Some(k) = key {
            let bucket = self.key_bucket(k).await;
            let granted_key = bucket.lock().await.try_take(cost as f64, Instant::now());
            if !granted_key {
                self.global.lock().await.put_back(cost as f64);
                self.blocked_requests.fetch_add(1, Ordering::Relaxed);
                metrics::inc_rate_limit_blocked();
                return Ok(None);
            }
        }

        self.granted.fetch_add(1, Ordering::Relaxed);
        Ok(Some(RequestToken {
            key: key.map(str::to_string),
            cost,
            issued_at: Instant::now(),
            completed: AtomicBool::new(false),
        }))
    }

    /// Refund a token. Idempotent.
    pub async fn release(&self, token: &RequestToken) {
        if token.completed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.global.lock().await.put_back(token.cost as f64);
        if let Some(k) = &token.key {
            let bucket = self.key_bucket(k).await;
            bucket.lock().await.put_back(token.cost as f64);
        }
    }

    /// Scoped admission: acquires, runs the future, and releases no matter
    /// how the future resolves.
    pub async fn run_limited<T, F>(
        &self,
        key: Option<&str>,
        cost: u32,
        timeout: Duration,
        fut: F,
    ) -> Result<T, DispatchError>
    where
        F: std::future::Future<Output = T>,
    {
        let token = self.acquire(key, cost, timeout).await?;
        let out = fut.await;
        self.release(&token).await;
        Ok(out)
    }

    pub async fn stats(&self) -> RateLimiterSnapshot {
        let global_tokens = self.global.lock().await.available(Instant::now());
        let tracked_keys = self.per_key.lock().await.len();
        RateLimiterSnapshot {
            granted: self.granted.load(Ordering::Relaxed),
            blocked_requests: self.blocked_requests.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            global_tokens,
            tracked_keys,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(rate: f64, capacity: f64) -> RateLimitSettings {
        RateLimitSettings {
            global_rate: rate,
            global_capacity: capacity,
            per_key_rate: rate,
            per_key_capacity: capacity,
            acquire_timeout_secs: 5,
        }
    }

    #[test]
    fn bucket_never_exceeds_capacity() {
        let start = Instant::now();
        let mut b = TokenBucket::new(4.0, 10.0);
        // A long idle period must clamp at capacity, not overflow.
        b.refill(start + Duration::from_secs(3600));
        assert!(b.tokens <= 10.0);
        assert!((b.tokens - 10.0).abs() < 1e-6);
    }

    #[test]
    fn bucket_refills_one_token_after_inverse_rate() {
        let start = Instant::now();
        let mut b = TokenBucket::new(4.0, 10.0);
        for _ in 0..10 {
            assert!(b.try_take(1.0, start));
        }
        assert!(!b.try_take(1.0, start));
        // 1/rate seconds later exactly one token is back.
        let later = start + Duration::from_millis(250);
        assert!(b.try_take(1.0, later));
        assert!(!b.try_take(1.0, later));
    }

    #[test]
    fn bucket_burst_limited_to_capacity() {
        let start = Instant::now();
        let mut b = TokenBucket::new(4.0, 10.0);
        let mut granted = 0;
        for _ in 0..50 {
            if b.try_take(1.0, start) {
                granted += 1;
            }
        }
        assert_eq!(granted, 10);
    }

    #[tokio::test]
    async fn zero_cost_is_a_config_error() {
        let limiter = RateLimiter::new(settings(4.0, 10.0));
        let err = limiter.acquire(None, 0, Duration::from_secs(1)).await;
        assert!(matches!(err, Err(DispatchError::Config(_))));
        let err = limiter.try_acquire(None, 0).await;
        assert!(matches!(err, Err(DispatchError::Config(_))));
    }

    #[tokio::test]
    async fn try_acquire_counts_blocked_requests() {
        let limiter = RateLimiter::new(settings(0.01, 2.0));
        assert!(limiter.try_acquire(None, 1).await.unwrap().is_some());
        assert!(limiter.try_acquire(None, 1).await.unwrap().is_some());
        assert!(limiter.try_acquire(None, 1).await.unwrap().is_none());
        let snap = limiter.stats().await;
        assert_eq!(snap.granted, 2);
        assert_eq!(snap.blocked_requests, 1);
    }

    #[tokio::test]
    async fn release_refunds_tokens() {
        let limiter = RateLimiter::new(settings(0.01, 2.0));
        let t1 = limiter.try_acquire(None, 1).await.unwrap().unwrap();
        let _t2 = limiter.try_acquire(None, 1).await.unwrap().unwrap();
        assert!(limiter.try_acquire(None, 1).await.unwrap().is_none());

        limiter.release(&t1).await;
        assert!(limiter.try_acquire(None, 1).await.unwrap().is_some());

        // Double release must not mint extra tokens.
        limiter.release(&t1).await;
        assert!(limiter.try_acquire(None, 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eleventh_acquire_blocks_until_refill() {
        let limiter = RateLimiter::new(settings(4.0, 10.0));
        for _ in 0..10 {
            assert!(limiter.try_acquire(None, 1).await.unwrap().is_some());
        }
        let started = Instant::now();
        let token = limiter
            .acquire(None, 1, Duration::from_secs(2))
            .await
            .expect("acquire should succeed once a token refills");
        // rate=4 means one token every 250ms.
        assert!(started.elapsed() >= Duration::from_millis(200));
        limiter.release(&token).await;
    }

    #[tokio::test]
    async fn per_key_timeout_refunds_global_tokens() {
        let mut s = settings(0.01, 10.0);
        s.per_key_rate = 0.01;
        s.per_key_capacity = 1.0;
        let limiter = RateLimiter::new(s);

        // Drain the key bucket, leave the token outstanding.
        let _held = limiter
            .acquire(Some("explorer"), 1, Duration::from_millis(50))
            .await
            .unwrap();

        let before = limiter.stats().await.global_tokens;
        let err = limiter
            .acquire(Some("explorer"), 1, Duration::from_millis(100))
            .await;
        assert!(matches!(err, Err(DispatchError::RateLimitTimeout { .. })));

        let after = limiter.stats().await.global_tokens;
        // The failed attempt must not have leaked a global token.
        assert!((after - before).abs() < 0.2, "before={before} after={after}");
        assert_eq!(limiter.stats().await.timeouts, 1);
    }

    #[tokio::test]
    async fn run_limited_releases_on_error_paths() {
        let limiter = RateLimiter::new(settings(0.01, 1.0));
        let out: Result<Result<(), &str>, _> = limiter
            .run_limited(None, 1, Duration::from_millis(50), async { Err("boom") })
            .await;
        assert!(matches!(out, Ok(Err("boom"))));
        // Token came back even though the inner future failed.
        assert!(limiter.try_acquire(None, 1).await.unwrap().is_some());
    }
}
