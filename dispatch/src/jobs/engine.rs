use chrono::Utc;
use serde_json::Value;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::DispatchConfig;
use crate::error::DispatchError;
use crate::jobs::executor::{ControlFlag, ExecOutcome, ExecutorCtx, ProgressTracker};
use crate::jobs::store::JobStore;
use crate::jobs::{Job, JobMode, JobProgress, JobState};
use crate::metrics::prometheus as metrics;
use crate::nonce::NonceManager;
use crate::rpc::RpcManager;
use crate::signer::Signer;

/// UI-facing observers. Implementations must tolerate being called from the
/// engine's tasks; a panicking subscriber is caught and logged, never
/// propagated back into the dispatch loop.
pub trait JobCallbacks: Send + Sync {
    fn job_started(&self, _job: &Job) {}
    fn job_progress(&self, _progress: &JobProgress) {}
    fn job_completed(&self, _job: &Job) {}
    fn job_failed(&self, _job: &Job) {}
    fn job_paused(&self, _job: &Job) {}
    fn job_resumed(&self, _job: &Job) {}
}

pub(crate) struct CallbackSet {
    subs: RwLock<Vec<Arc<dyn JobCallbacks>>>,
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl CallbackSet {
    fn new() -> Self {
        Self {
            subs: RwLock::new(Vec::new()),
        }
    }

    async fn add(&self, cb: Arc<dyn JobCallbacks>) {
        self.subs.write().await.push(cb);
    }

    async fn for_each<F: Fn(&dyn JobCallbacks)>(&self, label: &str, f: F) {
        let subs = self.subs.read().await;
        for cb in subs.iter() {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(cb.as_ref())));
            if let Err(panic) = result {
                tracing::error!(
                    "Subscriber {} callback panicked: {}",
                    label,
                    panic_message(panic.as_ref())
                );
            }
        }
    }

    pub(crate) async fn notify_started(&self, job: &Job) {
        self.for_each("job_started", |cb| cb.job_started(job)).await;
    }

    pub(crate) async fn notify_progress(&self, progress: &JobProgress) {
        self.for_each("job_progress", |cb| cb.job_progress(progress))
            .await;
    }

    pub(crate) async fn notify_completed(&self, job: &Job) {
        self.for_each("job_completed", |cb| cb.job_completed(job))
            .await;
    }

    pub(crate) async fn notify_failed(&self, job: &Job) {
        self.for_each("job_failed", |cb| cb.job_failed(job)).await;
    }

    pub(crate) async fn notify_paused(&self, job: &Job) {
        self.for_each("job_paused", |cb| cb.job_paused(job)).await;
    }

    pub(crate) async fn notify_resumed(&self, job: &Job) {
        self.for_each("job_resumed", |cb| cb.job_resumed(job)).await;
    }
}

/// Heap entry: lowest priority number wins, insertion order breaks ties.
struct QueuedJob {
    priority: u32,
    seq: u64,
    id: Uuid,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for QueuedJob {}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap; invert so the smallest key pops first.
        other
            .priority
            .cmp(&self.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

struct ActiveJob {
    ctl: ControlFlag,
    progress: Arc<ProgressTracker>,
    handle: Option<JoinHandle<()>>,
}

/// Queue and active-executor map share one lock: insert/remove across the
/// two is a single critical section.
struct EngineState {
    queue: BinaryHeap<QueuedJob>,
    active: HashMap<Uuid, ActiveJob>,
}

struct EngineShared {
    state: Mutex<EngineState>,
    store: Arc<dyn JobStore>,
    rpc: Arc<RpcManager>,
    nonces: Arc<NonceManager>,
    signer: Arc<dyn Signer>,
    callbacks: Arc<CallbackSet>,
    queue_notify: Notify,
    receipt_wait: Duration,
    receipt_poll: Duration,
}

/// Priority work queue plus one executor task per running job.
pub struct JobEngine {
    shared: Arc<EngineShared>,
    seq: AtomicU64,
    join_timeout: Duration,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl JobEngine {
    pub fn new(
        store: Arc<dyn JobStore>,
        rpc: Arc<RpcManager>,
        nonces: Arc<NonceManager>,
        signer: Arc<dyn Signer>,
        cfg: &DispatchConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(EngineShared {
                state: Mutex::new(EngineState {
                    queue: BinaryHeap::new(),
                    active: HashMap::new(),
                }),
                store,
                rpc,
                nonces,
                signer,
                callbacks: Arc::new(CallbackSet::new()),
                queue_notify: Notify::new(),
                receipt_wait: Duration::from_secs(cfg.receipt_wait_secs),
                receipt_poll: Duration::from_secs(cfg.receipt_poll_secs.max(1)),
            }),
            seq: AtomicU64::new(0),
            join_timeout: Duration::from_secs(cfg.job_join_timeout_secs),
            dispatch_task: Mutex::new(None),
            shutdown_tx,
        }
    }

    pub async fn start(&self) {
        let shared = self.shared.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            tracing::info!("🧵 Job dispatch loop started");
            loop {
                tokio::select! {
                    _ = shared.queue_notify.notified() => {}
                    _ = shutdown_rx.changed() => {
                        tracing::info!("Job dispatch loop shutting down");
                        break;
                    }
                }
                loop {
                    let next = shared.state.lock().await.queue.pop();
                    let Some(queued) = next else { break };
                    dispatch_one(&shared, queued).await;
                }
            }
        });
        *self.dispatch_task.lock().await = Some(handle);
    }

    /// Stops dispatching new jobs. Running executors keep going until they
    /// finish or are cancelled individually.
    pub async fn stop(&self) {
        if self.shutdown_tx.send(true).is_ok() {
            if let Some(handle) = self.dispatch_task.lock().await.take() {
                let _ = handle.await;
            }
        }
    }

    pub async fn register_callback(&self, cb: Arc<dyn JobCallbacks>) {
        self.shared.callbacks.add(cb).await;
    }

    /// Persist a PENDING job and enqueue it. Lower priority numbers are
    /// dispatched first; equal priorities run in submission order.
    pub async fn submit_job(
        &self,
        title: &str,
        mode: JobMode,
        config: Value,
        priority: u32,
    ) -> Result<Uuid, DispatchError> {
        let job = Job::new(title, mode, config, priority);
        self.shared.store.create_job(&job).await?;

        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        {
            let mut s = self.shared.state.lock().await;
            s.queue.push(QueuedJob {
                priority,
                seq,
                id: job.id,
            });
        }
        self.shared.queue_notify.notify_one();
        metrics::inc_jobs_submitted();
        tracing::info!(
            "📥 Job submitted: {} ({:?}, priority {})",
            job.title,
            mode,
            priority
        );
        Ok(job.id)
    }

    pub async fn pause_job(&self, id: Uuid) -> Result<(), DispatchError> {
        let ctl = {
            let s = self.shared.state.lock().await;
            s.active
                .get(&id)
                .map(|a| a.ctl.clone())
                .ok_or(DispatchError::UnknownJob(id))?
        };
        ctl.pause();

        if let Ok(Some(mut job)) = self.shared.store.get_job(id).await {
            if job.state == JobState::Running {
                job.state = JobState::Paused;
                job.updated_at = Utc::now();
                if let Err(e) = self.shared.store.update_job(&job).await {
                    tracing::warn!("Failed to persist pause for {}: {}", id, e);
                }
                self.shared.callbacks.notify_paused(&job).await;
            }
        }
        tracing::info!("⏸️  Job {} paused", id);
        Ok(())
    }

    pub async fn resume_job(&self, id: Uuid) -> Result<(), DispatchError> {
        let ctl = {
            let s = self.shared.state.lock().await;
            s.active
                .get(&id)
                .map(|a| a.ctl.clone())
                .ok_or(DispatchError::UnknownJob(id))?
        };
        ctl.resume();

        if let Ok(Some(mut job)) = self.shared.store.get_job(id).await {
            if job.state == JobState::Paused {
                job.state = JobState::Running;
                job.updated_at = Utc::now();
                if let Err(e) = self.shared.store.update_job(&job).await {
                    tracing::warn!("Failed to persist resume for {}: {}", id, e);
                }
                self.shared.callbacks.notify_resumed(&job).await;
            }
        }
        tracing::info!("▶️  Job {} resumed", id);
        Ok(())
    }

    /// Signal cancellation and wait (bounded) for the executor to exit. The
    /// executor's own finalization persists the CANCELLED state before the
    /// join returns.
    pub async fn cancel_job(&self, id: Uuid) -> Result<(), DispatchError> {
        enum Target {
            Active(ControlFlag, Option<JoinHandle<()>>),
            Queued,
            Unknown,
        }

        let target = {
            let mut s = self.shared.state.lock().await;
            if let Some(active) = s.active.get_mut(&id) {
                Target::Active(active.ctl.clone(), active.handle.take())
            } else if s.queue.iter().any(|q| q.id == id) {
                s.queue.retain(|q| q.id != id);
                Target::Queued
            } else {
                Target::Unknown
            }
        };

        match target {
            Target::Active(ctl, handle) => {
                ctl.cancel();
                if let Some(handle) = handle {
                    if tokio::time::timeout(self.join_timeout, handle).await.is_err() {
                        tracing::warn!(
                            "Executor for {} did not exit within {:?}",
                            id,
                            self.join_timeout
                        );
                    }
                }
                Ok(())
            }
            Target::Queued => {
                let mut job = self
                    .shared
                    .store
                    .get_job(id)
                    .await?
                    .ok_or(DispatchError::UnknownJob(id))?;
                job.state = JobState::Cancelled;
                job.updated_at = Utc::now();
                self.shared.store.update_job(&job).await?;
                metrics::inc_jobs_cancelled();
                tracing::info!("🛑 Queued job {} cancelled before start", id);
                Ok(())
            }
            Target::Unknown => match self.shared.store.get_job(id).await? {
                Some(job) if job.state.is_terminal() => Ok(()),
                Some(_) => Err(DispatchError::JobExecutionError(format!(
                    "job {} is not active or queued",
                    id
                ))),
                None => Err(DispatchError::UnknownJob(id)),
            },
        }
    }

    /// Live counters for a running job, persisted counters otherwise.
    pub async fn job_progress(&self, id: Uuid) -> Result<JobProgress, DispatchError> {
        let job = self
            .shared
            .store
            .get_job(id)
            .await?
            .ok_or(DispatchError::UnknownJob(id))?;

        let live = {
            let s = self.shared.state.lock().await;
            s.active.get(&id).map(|a| a.progress.clone())
        };

        Ok(match live {
            Some(progress) => progress.to_progress(id, job.state),
            None => JobProgress {
                id,
                state: job.state,
                total: job.total,
                done: job.done,
                failed: job.failed,
                eta_seconds: None,
            },
        })
    }

    pub async fn recent_jobs(&self, limit: usize) -> Result<Vec<Job>, DispatchError> {
        self.shared.store.get_recent_jobs(limit).await
    }
}

fn estimate_total(job: &Job) -> u64 {
    if let Some(items) = job.config.get("items").and_then(|v| v.as_array()) {
        items.len() as u64
    } else if let Some(ticks) = job.config.get("ticks").and_then(|v| v.as_u64()) {
        ticks
    } else {
        0
    }
}

async fn dispatch_one(shared: &Arc<EngineShared>, queued: QueuedJob) {
    let mut job = match shared.store.get_job(queued.id).await {
        Ok(Some(j)) => j,
        Ok(None) => {
            tracing::warn!("Queued job {} missing from store", queued.id);
            return;
        }
        Err(e) => {
            tracing::error!("Store read failed for {}: {}", queued.id, e);
            return;
        }
    };
    // Cancelled (or otherwise moved on) while still queued.
    if job.state != JobState::Pending {
        return;
    }

    job.total = estimate_total(&job);
    job.state = JobState::Running;
    job.updated_at = Utc::now();
    if let Err(e) = shared.store.update_job(&job).await {
        tracing::error!("Failed to mark job {} running: {}", job.id, e);
        job.state = JobState::Failed;
        job.error = Some(e.to_string());
        let _ = shared.store.update_job(&job).await;
        shared.callbacks.notify_failed(&job).await;
        metrics::inc_jobs_failed();
        return;
    }

    let ctl = ControlFlag::new();
    let progress = Arc::new(ProgressTracker::new(job.total));

    shared.callbacks.notify_started(&job).await;
    metrics::inc_active_jobs();
    tracing::info!("🚀 Job {} started: {} ({:?})", job.id, job.title, job.mode);

    {
        let mut s = shared.state.lock().await;
        s.active.insert(
            job.id,
            ActiveJob {
                ctl: ctl.clone(),
                progress: progress.clone(),
                handle: None,
            },
        );
    }

    let ctx = ExecutorCtx {
        job: job.clone(),
        store: shared.store.clone(),
        rpc: shared.rpc.clone(),
        nonces: shared.nonces.clone(),
        signer: shared.signer.clone(),
        ctl,
        progress,
        callbacks: shared.callbacks.clone(),
        receipt_wait: shared.receipt_wait,
        receipt_poll: shared.receipt_poll,
    };
    let shared_task = shared.clone();
    let handle = tokio::spawn(async move {
        let outcome = ctx.run().await;
        finalize_job(&shared_task, &ctx, outcome).await;
        shared_task.state.lock().await.active.remove(&ctx.job.id);
    });

    let mut s = shared.state.lock().await;
    if let Some(active) = s.active.get_mut(&job.id) {
        active.handle = Some(handle);
    }
}

async fn finalize_job(shared: &Arc<EngineShared>, ctx: &ExecutorCtx, outcome: ExecOutcome) {
    let (total, done, failed) = ctx.progress.counts();
    let mut job = ctx.job.clone();
    job.total = total;
    job.done = done;
    job.failed = failed;
    job.updated_at = Utc::now();

    match &outcome {
        ExecOutcome::Completed => {
            job.state = JobState::Completed;
            metrics::inc_jobs_completed();
            tracing::info!(
                "✅ Job {} completed: {} sent, {} failed",
                job.id,
                done,
                failed
            );
        }
        ExecOutcome::Cancelled => {
            job.state = JobState::Cancelled;
            metrics::inc_jobs_cancelled();
            tracing::info!(
                "🛑 Job {} cancelled after {}/{} items",
                job.id,
                done + failed,
                total
            );
        }
        ExecOutcome::Failed(reason) => {
            job.state = JobState::Failed;
            job.error = Some(reason.clone());
            metrics::inc_jobs_failed();
            tracing::error!("❌ Job {} failed: {}", job.id, reason);
        }
    }

    if let Err(e) = shared.store.update_job(&job).await {
        tracing::error!("Failed to persist final state for job {}: {}", job.id, e);
    }
    metrics::dec_active_jobs();

    match job.state {
        JobState::Completed => shared.callbacks.notify_completed(&job).await,
        JobState::Failed => shared.callbacks.notify_failed(&job).await,
        // No dedicated cancel callback; subscribers watch the final
        // progress event instead.
        _ => {
            let progress = ctx.progress.to_progress(job.id, job.state);
            shared.callbacks.notify_progress(&progress).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitSettings;
    use crate::jobs::store::MemoryJobStore;
    use crate::nonce::NonceManager;
    use crate::ratelimit::RateLimiter;
    use crate::rpc::health::HealthChecker;
    use crate::signer::{SignedTx, Signer, TransferRequest};
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::time::sleep;

    struct StaticSigner;

    #[async_trait]
    impl Signer for StaticSigner {
        fn address(&self) -> &str {
            "0xsender"
        }

        async fn sign_transfer(
            &self,
            _request: &TransferRequest,
            nonce: u64,
        ) -> Result<SignedTx, DispatchError> {
            Ok(SignedTx {
                payload: format!("0xsigned{:x}", nonce),
                hash: format!("0xhash{:x}", nonce),
            })
        }
    }

    #[derive(Default)]
    struct RecordingCallbacks {
        started: std::sync::Mutex<Vec<Uuid>>,
    }

    impl JobCallbacks for RecordingCallbacks {
        fn job_started(&self, job: &Job) {
            self.started.lock().unwrap().push(job.id);
        }
    }

    struct PanickyCallbacks;

    impl JobCallbacks for PanickyCallbacks {
        fn job_started(&self, _job: &Job) {
            panic!("subscriber bug");
        }
    }

    fn test_config() -> DispatchConfig {
        let mut cfg = DispatchConfig::load();
        // Unroutable endpoint: every send fails fast, which is all these
        // tests need (per-item failures never fail the job).
        cfg.endpoints = vec![crate::config::EndpointConfig {
            url: "http://127.0.0.1:9".to_string(),
            priority: 0,
        }];
        cfg.max_rps = 10_000;
        cfg.max_retries = 0;
        cfg.backoff_factor = 0.001;
        cfg.request_timeout_secs = 1;
        cfg.receipt_wait_secs = 0;
        cfg.receipt_poll_secs = 1;
        cfg.job_join_timeout_secs = 5;
        cfg.rate_limit = RateLimitSettings {
            global_rate: 10_000.0,
            global_capacity: 10_000.0,
            per_key_rate: 10_000.0,
            per_key_capacity: 10_000.0,
            acquire_timeout_secs: 5,
        };
        cfg
    }

    fn engine_with(cfg: &DispatchConfig) -> (JobEngine, Arc<MemoryJobStore>) {
        let store = Arc::new(MemoryJobStore::new());
        let health = Arc::new(HealthChecker::new(
            &cfg.endpoints,
            cfg.request_timeout(),
            cfg.health_interval(),
            cfg.probe_timeout(),
        ));
        let limiter = Arc::new(RateLimiter::new(cfg.rate_limit.clone()));
        let rpc = Arc::new(RpcManager::new(health, limiter, cfg));
        let nonces = Arc::new(NonceManager::new(rpc.clone(), &cfg.nonce));
        let engine = JobEngine::new(
            store.clone(),
            rpc,
            nonces,
            Arc::new(StaticSigner),
            cfg,
        );
        (engine, store)
    }

    async fn wait_for_state(
        store: &Arc<MemoryJobStore>,
        id: Uuid,
        state: JobState,
        within: Duration,
    ) -> Job {
        let deadline = std::time::Instant::now() + within;
        loop {
            if let Some(job) = store.get_job(id).await.unwrap() {
                if job.state == state {
                    return job;
                }
            }
            if std::time::Instant::now() >= deadline {
                panic!("job {} never reached {:?}", id, state);
            }
            sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn lower_priority_number_dispatches_first() {
        let cfg = test_config();
        let (engine, store) = engine_with(&cfg);
        let recorder = Arc::new(RecordingCallbacks::default());
        engine.register_callback(recorder.clone()).await;

        // Submit before the loop starts so ordering depends only on the
        // queue, not on timing.
        let low = engine
            .submit_job("background", JobMode::Distribution, json!({"items": []}), 5)
            .await
            .unwrap();
        let urgent = engine
            .submit_job("urgent", JobMode::Distribution, json!({"items": []}), 1)
            .await
            .unwrap();

        engine.start().await;
        wait_for_state(&store, low, JobState::Completed, Duration::from_secs(5)).await;
        wait_for_state(&store, urgent, JobState::Completed, Duration::from_secs(5)).await;
        engine.stop().await;

        let started = recorder.started.lock().unwrap().clone();
        assert_eq!(started, vec![urgent, low]);
    }

    #[tokio::test]
    async fn equal_priority_runs_in_submission_order() {
        let cfg = test_config();
        let (engine, store) = engine_with(&cfg);
        let recorder = Arc::new(RecordingCallbacks::default());
        engine.register_callback(recorder.clone()).await;

        let first = engine
            .submit_job("first", JobMode::Rewards, json!({"items": []}), 3)
            .await
            .unwrap();
        let second = engine
            .submit_job("second", JobMode::Rewards, json!({"items": []}), 3)
            .await
            .unwrap();

        engine.start().await;
        wait_for_state(&store, first, JobState::Completed, Duration::from_secs(5)).await;
        wait_for_state(&store, second, JobState::Completed, Duration::from_secs(5)).await;
        engine.stop().await;

        let started = recorder.started.lock().unwrap().clone();
        assert_eq!(started, vec![first, second]);
    }

    #[tokio::test]
    async fn items_that_fail_to_send_do_not_fail_the_job() {
        let cfg = test_config();
        let (engine, store) = engine_with(&cfg);
        engine.start().await;

        let id = engine
            .submit_job(
                "airdrop",
                JobMode::Distribution,
                json!({"items": [
                    { "to": "0xaa", "amount": 100 },
                    { "to": "0xbb", "amount": 200 }
                ]}),
                1,
            )
            .await
            .unwrap();

        let job = wait_for_state(&store, id, JobState::Completed, Duration::from_secs(10)).await;
        engine.stop().await;

        // The endpoint is unreachable, so both items fail as items.
        assert_eq!(job.total, 2);
        assert_eq!(job.failed, 2);
        assert_eq!(job.done, 0);
    }

    #[tokio::test]
    async fn malformed_config_fails_the_job() {
        let cfg = test_config();
        let (engine, store) = engine_with(&cfg);
        engine.start().await;

        let id = engine
            .submit_job("broken", JobMode::Distribution, json!({"wrong": true}), 1)
            .await
            .unwrap();

        let job = wait_for_state(&store, id, JobState::Failed, Duration::from_secs(5)).await;
        engine.stop().await;
        assert!(job.error.unwrap().contains("bad job config"));
    }

    #[tokio::test]
    async fn cancel_joins_executor_and_persists_cancelled() {
        let cfg = test_config();
        let (engine, store) = engine_with(&cfg);
        engine.start().await;

        let id = engine
            .submit_job(
                "drip buy",
                JobMode::AutoBuy,
                json!({
                    "router": "0xrouter",
                    "amount_in": 1000,
                    "ticks": 1000,
                    "interval_secs": 3600
                }),
                1,
            )
            .await
            .unwrap();

        wait_for_state(&store, id, JobState::Running, Duration::from_secs(5)).await;
        // Let the first tick pass so the executor is parked in its interval
        // sleep when the cancel arrives.
        sleep(Duration::from_millis(300)).await;

        engine.cancel_job(id).await.unwrap();
        // cancel_job blocks on the executor join, so the state is already
        // final here.
        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Cancelled);
        engine.stop().await;
    }

    #[tokio::test]
    async fn cancel_before_start_marks_queued_job_cancelled() {
        let cfg = test_config();
        let (engine, store) = engine_with(&cfg);
        // Engine deliberately not started: the job sits in the queue.
        let id = engine
            .submit_job("parked", JobMode::Distribution, json!({"items": []}), 1)
            .await
            .unwrap();

        engine.cancel_job(id).await.unwrap();
        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Cancelled);
    }

    #[tokio::test]
    async fn pause_and_resume_toggle_state() {
        let cfg = test_config();
        let (engine, store) = engine_with(&cfg);
        engine.start().await;

        let id = engine
            .submit_job(
                "slow buys",
                JobMode::AutoBuy,
                json!({
                    "router": "0xrouter",
                    "amount_in": 1000,
                    "ticks": 500,
                    "interval_secs": 1
                }),
                1,
            )
            .await
            .unwrap();

        wait_for_state(&store, id, JobState::Running, Duration::from_secs(5)).await;
        engine.pause_job(id).await.unwrap();
        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Paused);

        engine.resume_job(id).await.unwrap();
        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Running);

        engine.cancel_job(id).await.unwrap();
        engine.stop().await;
    }

    #[tokio::test]
    async fn panicking_subscriber_does_not_break_dispatch() {
        let cfg = test_config();
        let (engine, store) = engine_with(&cfg);
        engine.register_callback(Arc::new(PanickyCallbacks)).await;
        engine.start().await;

        let id = engine
            .submit_job("survives", JobMode::Distribution, json!({"items": []}), 1)
            .await
            .unwrap();

        wait_for_state(&store, id, JobState::Completed, Duration::from_secs(5)).await;
        engine.stop().await;
    }

    #[tokio::test]
    async fn progress_for_unknown_job_errors() {
        let cfg = test_config();
        let (engine, _store) = engine_with(&cfg);
        let err = engine.job_progress(Uuid::new_v4()).await;
        assert!(matches!(err, Err(DispatchError::UnknownJob(_))));
    }

    #[tokio::test]
    async fn progress_reflects_persisted_counts_after_completion() {
        let cfg = test_config();
        let (engine, store) = engine_with(&cfg);
        engine.start().await;

        let id = engine
            .submit_job(
                "payouts",
                JobMode::Rewards,
                json!({"items": [ { "to": "0xaa", "amount": 1 } ]}),
                1,
            )
            .await
            .unwrap();

        wait_for_state(&store, id, JobState::Completed, Duration::from_secs(10)).await;
        let progress = engine.job_progress(id).await.unwrap();
        assert_eq!(progress.state, JobState::Completed);
        assert_eq!(progress.total, 1);
        assert_eq!(progress.done + progress.failed, 1);
        engine.stop().await;
    }
}
