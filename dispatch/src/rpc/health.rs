use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::config::EndpointConfig;
use crate::error::DispatchError;
use crate::metrics::prometheus as metrics;
use crate::rpc::client::RpcClient;

const MAX_LATENCY_SAMPLES: usize = 50;
const UNHEALTHY_THRESHOLD: u32 = 3;
/// After this long without a probe touching a dead endpoint, it gets
/// re-armed so a transient outage cannot lock the pool out forever.
const RECOVERY_GRACE: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct EndpointStats {
    pub url: String,
    pub priority: u32,
    latency_ms: VecDeque<f64>,
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u32,
    pub is_healthy: bool,
    pub last_failure: Option<Instant>,
}

impl EndpointStats {
    fn new(url: String, priority: u32) -> Self {
        Self {
            url,
            priority,
            latency_ms: VecDeque::with_capacity(MAX_LATENCY_SAMPLES),
            success_count: 0,
            failure_count: 0,
            consecutive_failures: 0,
            is_healthy: true,
            last_failure: None,
        }
    }

    fn record_success(&mut self, latency_ms: f64) {
        self.success_count += 1;
        if !self.is_healthy {
            tracing::info!("✅ Endpoint {} recovered", self.url);
        }
        self.consecutive_failures = 0;
        self.is_healthy = true;
        self.latency_ms.push_back(latency_ms);
        if self.latency_ms.len() > MAX_LATENCY_SAMPLES {
            self.latency_ms.pop_front();
        }
    }

    fn record_failure(&mut self, now: Instant) {
        self.failure_count += 1;
        self.consecutive_failures += 1;
        self.last_failure = Some(now);
        if self.consecutive_failures >= UNHEALTHY_THRESHOLD && self.is_healthy {
            self.is_healthy = false;
            tracing::warn!(
                "❌ Endpoint {} marked unhealthy after {} consecutive failures",
                self.url,
                self.consecutive_failures
            );
        }
    }

    pub fn avg_latency_ms(&self) -> f64 {
        if self.latency_ms.is_empty() {
            return f64::INFINITY;
        }
        self.latency_ms.iter().sum::<f64>() / self.latency_ms.len() as f64
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            1.0
        } else {
            self.success_count as f64 / total as f64
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EndpointSnapshot {
    pub url: String,
    pub priority: u32,
    pub is_healthy: bool,
    pub avg_latency_ms: Option<f64>,
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u32,
    pub success_rate: f64,
}

pub struct Endpoint {
    pub url: String,
    pub priority: u32,
    pub client: Arc<RpcClient>,
    pub stats: RwLock<EndpointStats>,
}

/// Periodic concurrent prober for every configured endpoint. Stats live for
/// the process lifetime; only this checker and the manager's
/// result-recording calls mutate them.
pub struct HealthChecker {
    endpoints: Arc<Vec<Arc<Endpoint>>>,
    probe_interval: Duration,
    probe_timeout: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl HealthChecker {
    pub fn new(
        configs: &[EndpointConfig],
        request_timeout: Duration,
        probe_interval: Duration,
        probe_timeout: Duration,
    ) -> Self {
        let endpoints: Vec<Arc<Endpoint>> = configs
            .iter()
            .map(|c| {
                Arc::new(Endpoint {
                    url: c.url.clone(),
                    priority: c.priority,
                    client: Arc::new(RpcClient::new(c.url.clone(), request_timeout)),
                    stats: RwLock::new(EndpointStats::new(c.url.clone(), c.priority)),
                })
            })
            .collect();

        tracing::info!("🌐 Health checker tracking {} endpoints", endpoints.len());

        let (shutdown_tx, _) = watch::channel(false);
        Self {
            endpoints: Arc::new(endpoints),
            probe_interval,
            probe_timeout,
            task: Mutex::new(None),
            shutdown_tx,
        }
    }

    pub async fn start(&self) {
        let endpoints = self.endpoints.clone();
        let probe_timeout = self.probe_timeout;
        let probe_interval = self.probe_interval;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            tracing::info!("💓 Endpoint health probing started");
            let mut interval = tokio::time::interval(probe_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        probe_all(&endpoints, probe_timeout).await;
                    }
                    _ = shutdown_rx.changed() => {
                        tracing::info!("Endpoint health probing shutting down");
                        break;
                    }
                }
            }
        });
        *self.task.lock().await = Some(handle);
    }

    pub async fn stop(&self) {
        if self.shutdown_tx.send(true).is_ok() {
            if let Some(handle) = self.task.lock().await.take() {
                let _ = handle.await;
            }
        }
    }

    /// One probe cycle, outside the background loop. The probe binary uses
    /// this for its single-shot report.
    pub async fn probe_once(&self) {
        probe_all(&self.endpoints, self.probe_timeout).await;
    }

    pub fn endpoints(&self) -> &[Arc<Endpoint>] {
        &self.endpoints
    }

    pub async fn find(&self, url: &str) -> Option<Arc<Endpoint>> {
        self.endpoints.iter().find(|e| e.url == url).cloned()
    }

    /// Called by the manager after every real request so organic traffic
    /// feeds the same stats as probes.
    pub async fn record_result(&self, url: &str, latency_ms: f64, success: bool) {
        if let Some(ep) = self.find(url).await {
            let mut stats = ep.stats.write().await;
            if success {
                stats.record_success(latency_ms);
            } else {
                stats.record_failure(Instant::now());
            }
        }
    }

    /// Healthy endpoints sorted by (priority, average latency).
    pub async fn healthy_endpoints(&self) -> Vec<Arc<Endpoint>> {
        let mut scored = Vec::new();
        for ep in self.endpoints.iter() {
            let stats = ep.stats.read().await;
            if stats.is_healthy {
                scored.push((ep.clone(), stats.priority, stats.avg_latency_ms()));
            }
        }
        scored.sort_by(|a, b| a.1.cmp(&b.1).then(a.2.total_cmp(&b.2)));
        metrics::set_healthy_endpoints(scored.len());
        scored.into_iter().map(|(ep, _, _)| ep).collect()
    }

    /// Re-arm endpoints whose last failure is older than the grace window.
    async fn rearm_stale(&self, now: Instant) -> usize {
        let mut rearmed = 0;
        for ep in self.endpoints.iter() {
            let mut stats = ep.stats.write().await;
            if !stats.is_healthy {
                let stale = stats
                    .last_failure
                    .map(|t| now.saturating_duration_since(t) >= RECOVERY_GRACE)
                    .unwrap_or(true);
                if stale {
                    tracing::info!("🔁 Re-arming endpoint {} after cooldown", stats.url);
                    stats.is_healthy = true;
                    stats.consecutive_failures = 0;
                    rearmed += 1;
                }
            }
        }
        rearmed
    }

    pub async fn best_endpoint(&self) -> Result<Arc<Endpoint>, DispatchError> {
        let healthy = self.healthy_endpoints().await;
        if let Some(best) = healthy.first() {
            return Ok(best.clone());
        }
        // Total blackout: give cooled-down endpoints one more chance before
        // declaring failure.
        if self.rearm_stale(Instant::now()).await > 0 {
            if let Some(best) = self.healthy_endpoints().await.first() {
                return Ok(best.clone());
            }
        }
        Err(DispatchError::NoHealthyEndpoint)
    }

    pub async fn snapshot(&self) -> Vec<EndpointSnapshot> {
        let mut out = Vec::with_capacity(self.endpoints.len());
        for ep in self.endpoints.iter() {
            let stats = ep.stats.read().await;
            let avg = stats.avg_latency_ms();
            out.push(EndpointSnapshot {
                url: stats.url.clone(),
                priority: stats.priority,
                is_healthy: stats.is_healthy,
                avg_latency_ms: avg.is_finite().then_some(avg),
                success_count: stats.success_count,
                failure_count: stats.failure_count,
                consecutive_failures: stats.consecutive_failures,
                success_rate: stats.success_rate(),
            });
        }
        out
    }
}

async fn probe_all(endpoints: &Arc<Vec<Arc<Endpoint>>>, probe_timeout: Duration) {
    let handles: Vec<_> = endpoints
        .iter()
        .cloned()
        .map(|ep| tokio::spawn(probe_endpoint(ep, probe_timeout)))
        .collect();
    for h in handles {
        let _ = h.await;
    }
}

async fn probe_endpoint(ep: Arc<Endpoint>, probe_timeout: Duration) {
    let started = Instant::now();
    let result = tokio::time::timeout(probe_timeout, async {
        ep.client.block_number().await?;
        ep.client.chain_id().await?;
        Ok::<(), DispatchError>(())
    })
    .await;

    let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
    let mut stats = ep.stats.write().await;
    match result {
        Ok(Ok(())) => stats.record_success(latency_ms),
        Ok(Err(e)) => {
            tracing::debug!("Probe failed for {}: {}", ep.url, e);
            stats.record_failure(Instant::now());
        }
        Err(_) => {
            tracing::debug!("Probe timed out for {}", ep.url);
            stats.record_failure(Instant::now());
        }
    }
}
