use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;

use crate::config::DispatchConfig;
use crate::error::DispatchError;
use crate::metrics::prometheus as metrics;
use crate::ratelimit::RateLimiter;
use crate::rpc::client::RpcClient;
use crate::rpc::health::{EndpointSnapshot, HealthChecker};

/// Rate-limiter key shared by every outbound RPC call.
const RPC_LIMIT_KEY: &str = "rpc";

/// Endpoint selection, per-endpoint throttling, retry with backoff, failover
/// and optional hedging. Every network call passes the rate limiter before
/// touching the wire and reports its outcome into the health stats.
pub struct RpcManager {
    health: Arc<HealthChecker>,
    limiter: Arc<RateLimiter>,
    max_rps: u32,
    hedging_enabled: bool,
    hedge_threshold: Duration,
    max_retries: u32,
    backoff_factor: f64,
    acquire_timeout: Duration,
    throttle: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RpcManager {
    pub fn new(health: Arc<HealthChecker>, limiter: Arc<RateLimiter>, cfg: &DispatchConfig) -> Self {
        Self {
            health,
            limiter,
            max_rps: cfg.max_rps,
            hedging_enabled: cfg.hedging_enabled,
            hedge_threshold: cfg.hedge_threshold(),
            max_retries: cfg.max_retries,
            backoff_factor: cfg.backoff_factor,
            acquire_timeout: Duration::from_secs(cfg.rate_limit.acquire_timeout_secs.max(1)),
            throttle: Mutex::new(HashMap::new()),
        }
    }

    pub fn health(&self) -> &Arc<HealthChecker> {
        &self.health
    }

    /// A usable client for the chosen (or forced) endpoint, after the
    /// per-endpoint throttle window admits the request.
    pub async fn client(&self, force_url: Option<&str>) -> Result<Arc<RpcClient>, DispatchError> {
        let endpoint = match force_url {
            Some(url) => self
                .health
                .find(url)
                .await
                .ok_or_else(|| DispatchError::Config(format!("unknown endpoint {}", url)))?,
            None => self.health.best_endpoint().await?,
        };
        self.throttle_wait(&endpoint.url).await;
        Ok(endpoint.client.clone())
    }

    pub async fn current_primary(&self) -> Option<String> {
        self.health.best_endpoint().await.ok().map(|e| e.url.clone())
    }

    pub async fn stats(&self) -> Vec<EndpointSnapshot> {
        self.health.snapshot().await
    }

    /// Sliding 1-second window per endpoint, capped at `max_rps` requests.
    async fn throttle_wait(&self, url: &str) {
        loop {
            let wait = {
                let mut map = self.throttle.lock().await;
                let window = map.entry(url.to_string()).or_default();
                let now = Instant::now();
                while let Some(&front) = window.front() {
                    if now.duration_since(front) >= Duration::from_secs(1) {
                        window.pop_front();
                    } else {
                        break;
                    }
                }
                if (window.len() as u32) < self.max_rps {
                    window.push_back(now);
                    None
                } else if let Some(&oldest) = window.front() {
                    Some(Duration::from_secs(1).saturating_sub(now.duration_since(oldest)))
                } else {
                    None
                }
            };
            match wait {
                None => return,
                Some(d) => sleep(d.max(Duration::from_millis(1))).await,
            }
        }
    }

    fn backoff_for(&self, attempt: u32, factor: f64) -> Duration {
        let base = factor * 2f64.powi(attempt as i32);
        let jitter_ms = rand::thread_rng().gen_range(0..250);
        Duration::from_secs_f64(base.max(0.0)) + Duration::from_millis(jitter_ms)
    }

    /// Run `op` with retries. Attempt n goes to the n-th healthy endpoint
    /// (failover), falling back to the current best; latency and outcome are
    /// recorded into the endpoint's stats either way. Node-level errors are
    /// deterministic and returned without further attempts.
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        op: F,
        max_retries: u32,
        backoff_factor: f64,
    ) -> Result<T, DispatchError>
    where
        F: Fn(Arc<RpcClient>) -> Fut,
        Fut: Future<Output = Result<T, DispatchError>>,
    {
        let mut last_err = DispatchError::NoHealthyEndpoint;

        for attempt in 0..=max_retries {
            let healthy = self.health.healthy_endpoints().await;
            let endpoint = match healthy.get(attempt as usize).cloned() {
                Some(ep) => ep,
                None => match self.health.best_endpoint().await {
                    Ok(ep) => ep,
                    Err(e) => {
                        last_err = e;
                        if attempt < max_retries {
                            sleep(self.backoff_for(attempt, backoff_factor)).await;
                        }
                        continue;
                    }
                },
            };
            if attempt > 0 {
                metrics::inc_rpc_failovers();
                tracing::info!(
                    "🔀 Retry {}/{} against {}",
                    attempt,
                    max_retries,
                    endpoint.url
                );
            }

            self.throttle_wait(&endpoint.url).await;
            let token = match self
                .limiter
                .acquire(Some(RPC_LIMIT_KEY), 1, self.acquire_timeout)
                .await
            {
                Ok(t) => t,
                Err(e) => {
                    last_err = e;
                    if attempt < max_retries {
                        sleep(self.backoff_for(attempt, backoff_factor)).await;
                    }
                    continue;
                }
            };

            let started = Instant::now();
            let result = op(endpoint.client.clone()).await;
            let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
            self.limiter.release(&token).await;

            match result {
                Ok(v) => {
                    self.health.record_result(&endpoint.url, latency_ms, true).await;
                    return Ok(v);
                }
                Err(e @ DispatchError::Node(_)) => {
                    // Endpoint answered; the request itself is the problem.
                    self.health.record_result(&endpoint.url, latency_ms, true).await;
                    return Err(e);
                }
                Err(e) => {
                    self.health.record_result(&endpoint.url, latency_ms, false).await;
                    tracing::warn!("Request to {} failed: {}", endpoint.url, e);
                    last_err = e;
                    if attempt < max_retries {
                        sleep(self.backoff_for(attempt, backoff_factor)).await;
                    }
                }
            }
        }

        Err(last_err)
    }

    /// `execute_with_retry` with the configured defaults.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T, DispatchError>
    where
        F: Fn(Arc<RpcClient>) -> Fut,
        Fut: Future<Output = Result<T, DispatchError>>,
    {
        self.execute_with_retry(op, self.max_retries, self.backoff_factor)
            .await
    }

    /// Broadcast a signed transaction, hedged when hedging is on and at
    /// least two endpoints are healthy, otherwise with plain retries. Both
    /// paths are idempotent: the payload's hash is fixed at signing time.
    pub async fn submit_raw_transaction(&self, payload: &str) -> Result<String, DispatchError> {
        let payload = payload.to_string();
        if self.hedging_enabled && self.health.healthy_endpoints().await.len() >= 2 {
            self.execute_with_hedge(|client| {
                let payload = payload.clone();
                async move { client.send_raw_transaction(&payload).await }
            })
            .await
        } else {
            self.execute(|client| {
                let payload = payload.clone();
                async move { client.send_raw_transaction(&payload).await }
            })
            .await
        }
    }

    /// Race the best endpoint against the runner-up: the second call only
    /// launches if the first has not settled within the hedge threshold, and
    /// whichever finishes first wins. The loser is dropped; a duplicate
    /// submission is harmless because a signed transaction has one hash no
    /// matter which endpoint relayed it.
    pub async fn execute_with_hedge<T, F, Fut>(&self, op: F) -> Result<T, DispatchError>
    where
        F: Fn(Arc<RpcClient>) -> Fut,
        Fut: Future<Output = Result<T, DispatchError>>,
    {
        let healthy = self.health.healthy_endpoints().await;

        if !self.hedging_enabled || healthy.len() < 2 {
            let endpoint = match healthy.first() {
                Some(ep) => ep.clone(),
                None => self.health.best_endpoint().await?,
            };
            self.throttle_wait(&endpoint.url).await;
            let token = self
                .limiter
                .acquire(Some(RPC_LIMIT_KEY), 1, self.acquire_timeout)
                .await?;
            let started = Instant::now();
            let result = op(endpoint.client.clone()).await;
            let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
            self.limiter.release(&token).await;
            self.health
                .record_result(&endpoint.url, latency_ms, endpoint_alive(&result))
                .await;
            return result;
        }

        let primary_ep = healthy[0].clone();
        let secondary_ep = healthy[1].clone();

        self.throttle_wait(&primary_ep.url).await;
        let token = self
            .limiter
            .acquire(Some(RPC_LIMIT_KEY), 1, self.acquire_timeout)
            .await?;

        let started = Instant::now();
        let primary = op(primary_ep.client.clone());
        tokio::pin!(primary);

        let (winner_url, result, secondary_won) = tokio::select! {
            r = &mut primary => (primary_ep.url.clone(), r, false),
            _ = sleep(self.hedge_threshold) => {
                // The hedge is opportunistic: if admission refuses the
                // second slot, keep waiting on the primary alone.
                match self.limiter.try_acquire(Some(RPC_LIMIT_KEY), 1).await {
                    Ok(Some(hedge_token)) => {
                        metrics::inc_hedge_launches();
                        tracing::debug!(
                            "🏁 Hedging slow {} with {}",
                            primary_ep.url,
                            secondary_ep.url
                        );
                        self.throttle_wait(&secondary_ep.url).await;
                        let secondary = op(secondary_ep.client.clone());
                        tokio::pin!(secondary);
                        let out = tokio::select! {
                            r = &mut primary => (primary_ep.url.clone(), r, false),
                            r = &mut secondary => (secondary_ep.url.clone(), r, true),
                        };
                        self.limiter.release(&hedge_token).await;
                        out
                    }
                    _ => {
                        let r = (&mut primary).await;
                        (primary_ep.url.clone(), r, false)
                    }
                }
            }
        };

        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.limiter.release(&token).await;
        if secondary_won {
            metrics::inc_hedge_secondary_wins();
        }
        self.health
            .record_result(&winner_url, latency_ms, endpoint_alive(&result))
            .await;
        result
    }
}

fn endpoint_alive<T>(result: &Result<T, DispatchError>) -> bool {
    matches!(result, Ok(_) | Err(DispatchError::Node(_)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EndpointConfig, RateLimitSettings};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_config(urls: &[(&str, u32)]) -> DispatchConfig {
        let mut cfg = DispatchConfig::load();
        cfg.endpoints = urls
            .iter()
            .map(|(u, p)| EndpointConfig {
                url: u.to_string(),
                priority: *p,
            })
            .collect();
        cfg.max_rps = 1000;
        cfg.max_retries = 2;
        cfg.backoff_factor = 0.001;
        cfg.rate_limit = RateLimitSettings {
            global_rate: 1000.0,
            global_capacity: 1000.0,
            per_key_rate: 1000.0,
            per_key_capacity: 1000.0,
            acquire_timeout_secs: 5,
        };
        cfg
    }

    fn manager(cfg: &DispatchConfig) -> RpcManager {
        let health = Arc::new(HealthChecker::new(
            &cfg.endpoints,
            Duration::from_secs(5),
            Duration::from_secs(60),
            Duration::from_secs(2),
        ));
        let limiter = Arc::new(RateLimiter::new(cfg.rate_limit.clone()));
        RpcManager::new(health, limiter, cfg)
    }

    #[tokio::test]
    async fn retry_fails_over_to_next_endpoint() {
        let cfg = test_config(&[("http://a", 0), ("http://b", 1)]);
        let mgr = manager(&cfg);
        let calls = AtomicU32::new(0);

        let out = mgr
            .execute_with_retry(
                |client| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if client.url() == "http://a" {
                            Err(DispatchError::Rpc("connection refused".to_string()))
                        } else {
                            Ok(client.url().to_string())
                        }
                    }
                },
                2,
                0.001,
            )
            .await
            .unwrap();

        assert_eq!(out, "http://b");
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // The failed attempt landed in endpoint stats.
        let snap = mgr.stats().await;
        let a = snap.iter().find(|s| s.url == "http://a").unwrap();
        assert_eq!(a.failure_count, 1);
        let b = snap.iter().find(|s| s.url == "http://b").unwrap();
        assert_eq!(b.success_count, 1);
    }

    #[tokio::test]
    async fn node_errors_are_not_retried() {
        let cfg = test_config(&[("http://a", 0), ("http://b", 1)]);
        let mgr = manager(&cfg);
        let calls = AtomicU32::new(0);

        let out: Result<(), _> = mgr
            .execute_with_retry(
                |_client| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move { Err(DispatchError::Node("nonce too low".to_string())) }
                },
                3,
                0.001,
            )
            .await;

        assert!(matches!(out, Err(DispatchError::Node(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // Node errors keep the endpoint healthy.
        let snap = mgr.stats().await;
        assert!(snap.iter().all(|s| s.is_healthy));
    }

    #[tokio::test]
    async fn exhausted_retries_return_last_error() {
        let cfg = test_config(&[("http://a", 0)]);
        let mgr = manager(&cfg);

        let out: Result<(), _> = mgr
            .execute_with_retry(
                |_client| async move { Err(DispatchError::Rpc("boom".to_string())) },
                1,
                0.001,
            )
            .await;

        match out {
            Err(DispatchError::Rpc(msg)) => assert_eq!(msg, "boom"),
            other => panic!("unexpected: {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn hedge_returns_faster_secondary() {
        let mut cfg = test_config(&[("http://primary", 0), ("http://secondary", 1)]);
        cfg.hedging_enabled = true;
        cfg.hedge_threshold_ms = 20;
        let mgr = manager(&cfg);

        let out = mgr
            .execute_with_hedge(|client| async move {
                if client.url() == "http://primary" {
                    sleep(Duration::from_millis(500)).await;
                    Ok("slow".to_string())
                } else {
                    sleep(Duration::from_millis(5)).await;
                    Ok("fast".to_string())
                }
            })
            .await
            .unwrap();

        assert_eq!(out, "fast");
        let snap = mgr.stats().await;
        let secondary = snap.iter().find(|s| s.url == "http://secondary").unwrap();
        assert_eq!(secondary.success_count, 1);
    }

    #[tokio::test]
    async fn hedge_refused_by_limiter_stays_on_primary() {
        let mut cfg = test_config(&[("http://primary", 0), ("http://secondary", 1)]);
        cfg.hedging_enabled = true;
        cfg.hedge_threshold_ms = 20;
        // One admission slot: the primary call holds it, so the hedge
        // launch is refused and the slow primary still wins.
        cfg.rate_limit.per_key_rate = 0.001;
        cfg.rate_limit.per_key_capacity = 1.0;
        let mgr = manager(&cfg);

        let out = mgr
            .execute_with_hedge(|client| async move {
                if client.url() == "http://primary" {
                    sleep(Duration::from_millis(100)).await;
                    Ok("slow".to_string())
                } else {
                    Ok("fast".to_string())
                }
            })
            .await
            .unwrap();

        assert_eq!(out, "slow");
        let snap = mgr.stats().await;
        let secondary = snap.iter().find(|s| s.url == "http://secondary").unwrap();
        assert_eq!(secondary.success_count + secondary.failure_count, 0);
    }

    #[tokio::test]
    async fn hedge_disabled_uses_single_endpoint() {
        let cfg = test_config(&[("http://primary", 0), ("http://secondary", 1)]);
        let mgr = manager(&cfg);

        let out = mgr
            .execute_with_hedge(|client| async move { Ok(client.url().to_string()) })
            .await
            .unwrap();
        assert_eq!(out, "http://primary");
    }

    #[tokio::test]
    async fn forced_client_must_be_configured() {
        let cfg = test_config(&[("http://a", 0)]);
        let mgr = manager(&cfg);
        assert!(mgr.client(Some("http://a")).await.is_ok());
        assert!(matches!(
            mgr.client(Some("http://nope")).await,
            Err(DispatchError::Config(_))
        ));
    }

    #[tokio::test]
    async fn throttle_window_delays_burst() {
        let mut cfg = test_config(&[("http://a", 0)]);
        cfg.max_rps = 2;
        let mgr = manager(&cfg);

        let started = Instant::now();
        for _ in 0..3 {
            mgr.client(None).await.unwrap();
        }
        // Third admission must wait for the 1s window to slide.
        assert!(started.elapsed() >= Duration::from_millis(900));
    }
}
