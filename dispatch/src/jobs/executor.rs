use chrono::Utc;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use uuid::Uuid;

use crate::error::DispatchError;
use crate::jobs::engine::CallbackSet;
use crate::jobs::store::JobStore;
use crate::jobs::{Job, JobMode, JobProgress, JobState};
use crate::nonce::NonceManager;
use crate::rpc::client::receipt_succeeded;
use crate::rpc::RpcManager;
use crate::signer::{Signer, TransferRequest};

/// How often a parked executor re-checks its pause/cancel flags.
const PARK_POLL: Duration = Duration::from_millis(50);

/// Cooperative pause/cancel switch shared between the engine and one
/// executor. Checked between units of work, never preemptively.
#[derive(Clone, Default)]
pub struct ControlFlag {
    inner: Arc<ControlInner>,
}

#[derive(Default)]
struct ControlInner {
    paused: AtomicBool,
    cancelled: AtomicBool,
}

impl ControlFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Park here between work units. Returns `false` once cancelled; while
    /// paused the flags are re-polled until resumed or cancelled.
    pub async fn checkpoint(&self) -> bool {
        loop {
            if self.is_cancelled() {
                return false;
            }
            if !self.is_paused() {
                return true;
            }
            sleep(PARK_POLL).await;
        }
    }
}

/// Sleep in small slices so a cancel lands within ~100ms instead of after
/// the whole interval. Returns `false` when cancelled mid-sleep.
pub(crate) async fn cooperative_sleep(ctl: &ControlFlag, duration: Duration) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if ctl.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        sleep((deadline - now).min(Duration::from_millis(100))).await;
    }
}

/// Live counters for one running job, shared with the engine for progress
/// queries.
pub(crate) struct ProgressTracker {
    total: AtomicU64,
    done: AtomicU64,
    failed: AtomicU64,
    started_at: Instant,
}

impl ProgressTracker {
    pub(crate) fn new(total: u64) -> Self {
        Self {
            total: AtomicU64::new(total),
            done: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    fn inc_done(&self) {
        self.done.fetch_add(1, Ordering::Relaxed);
    }

    fn inc_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn counts(&self) -> (u64, u64, u64) {
        (
            self.total.load(Ordering::Relaxed),
            self.done.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
        )
    }

    fn eta_seconds(&self) -> Option<u64> {
        let (total, done, failed) = self.counts();
        let processed = done + failed;
        if processed == 0 || processed >= total {
            return None;
        }
        let elapsed = self.started_at.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return None;
        }
        let rate = processed as f64 / elapsed;
        Some(((total - processed) as f64 / rate).round() as u64)
    }

    pub(crate) fn to_progress(&self, id: Uuid, state: JobState) -> JobProgress {
        let (total, done, failed) = self.counts();
        JobProgress {
            id,
            state,
            total,
            done,
            failed,
            eta_seconds: self.eta_seconds(),
        }
    }
}

pub(crate) enum ExecOutcome {
    Completed,
    Cancelled,
    Failed(String),
}

#[derive(Deserialize)]
struct BatchConfig {
    items: Vec<TransferRequest>,
}

#[derive(Deserialize)]
struct AutoBuyConfig {
    router: String,
    amount_in: u128,
    ticks: u32,
    interval_secs: u64,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    gas_limit: u64,
    #[serde(default)]
    gas_price: u128,
    #[serde(default)]
    data: Option<String>,
}

enum ReceiptOutcome {
    Confirmed,
    Rejected(String),
    Unknown,
}

/// One executor per job. Every item runs the same pipeline: reserve nonce,
/// sign, broadcast, watch for the receipt, settle the ticket.
pub(crate) struct ExecutorCtx {
    pub(crate) job: Job,
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) rpc: Arc<RpcManager>,
    pub(crate) nonces: Arc<NonceManager>,
    pub(crate) signer: Arc<dyn Signer>,
    pub(crate) ctl: ControlFlag,
    pub(crate) progress: Arc<ProgressTracker>,
    pub(crate) callbacks: Arc<CallbackSet>,
    pub(crate) receipt_wait: Duration,
    pub(crate) receipt_poll: Duration,
}

impl ExecutorCtx {
    pub(crate) async fn run(&self) -> ExecOutcome {
        match self.job.mode {
            JobMode::Distribution | JobMode::Rewards => {
                let cfg: BatchConfig = match serde_json::from_value(self.job.config.clone()) {
                    Ok(c) => c,
                    Err(e) => return ExecOutcome::Failed(format!("bad job config: {}", e)),
                };
                self.run_batch(cfg.items).await
            }
            JobMode::AutoBuy => {
                let cfg: AutoBuyConfig = match serde_json::from_value(self.job.config.clone()) {
                    Ok(c) => c,
                    Err(e) => return ExecOutcome::Failed(format!("bad job config: {}", e)),
                };
                self.run_auto_buy(cfg).await
            }
        }
    }

    async fn run_batch(&self, items: Vec<TransferRequest>) -> ExecOutcome {
        for item in &items {
            if !self.ctl.checkpoint().await {
                return ExecOutcome::Cancelled;
            }
            self.process_item(item).await;
            if let Err(e) = self.persist_progress().await {
                return ExecOutcome::Failed(format!("progress persist failed: {}", e));
            }
        }
        ExecOutcome::Completed
    }

    async fn run_auto_buy(&self, cfg: AutoBuyConfig) -> ExecOutcome {
        let request = TransferRequest {
            to: cfg.router.clone(),
            amount: cfg.amount_in,
            token: cfg.token.clone(),
            gas_limit: cfg.gas_limit,
            gas_price: cfg.gas_price,
            data: cfg.data.clone(),
        };

        for tick in 0..cfg.ticks {
            if tick > 0
                && !cooperative_sleep(&self.ctl, Duration::from_secs(cfg.interval_secs)).await
            {
                return ExecOutcome::Cancelled;
            }
            if !self.ctl.checkpoint().await {
                return ExecOutcome::Cancelled;
            }
            self.process_item(&request).await;
            if let Err(e) = self.persist_progress().await {
                return ExecOutcome::Failed(format!("progress persist failed: {}", e));
            }
        }
        ExecOutcome::Completed
    }

    /// Per-item failures mark the item failed, never the job.
    async fn process_item(&self, item: &TransferRequest) {
        match self.send_one(item).await {
            Ok(hash) => {
                self.progress.inc_done();
                tracing::debug!("📤 Sent to {}: {}", item.to, hash);
            }
            Err(e) => {
                self.progress.inc_failed();
                tracing::warn!("Transfer to {} failed: {}", item.to, e);
            }
        }
        let progress = self.progress.to_progress(self.job.id, JobState::Running);
        self.callbacks.notify_progress(&progress).await;
    }

    async fn send_one(&self, item: &TransferRequest) -> Result<String, DispatchError> {
        let ticket = self.nonces.reserve(self.signer.address()).await?;

        let signed = match self.signer.sign_transfer(item, ticket.nonce).await {
            Ok(s) => s,
            Err(e) => {
                let _ = self
                    .nonces
                    .fail(&ticket, &format!("signing failed: {}", e))
                    .await;
                return Err(e);
            }
        };

        let hash = match self.rpc.submit_raw_transaction(&signed.payload).await {
            Ok(h) => h,
            Err(e) => {
                // fail() runs its own nonce-too-low/too-high recovery off
                // the node's error text.
                let _ = self.nonces.fail(&ticket, &e.to_string()).await;
                return Err(e);
            }
        };

        self.nonces.complete(&ticket, &hash).await?;

        match self.await_receipt(&hash).await {
            ReceiptOutcome::Confirmed => {
                let _ = self.nonces.confirm(&ticket).await;
                Ok(hash)
            }
            ReceiptOutcome::Rejected(reason) => {
                let _ = self.nonces.fail(&ticket, &reason).await;
                Err(DispatchError::TransactionRejected { reason })
            }
            ReceiptOutcome::Unknown => {
                // The chain may still include it; the ticket stays PENDING
                // and shows up in nonce stats for the audit trail.
                tracing::warn!("No receipt for {} within window, leaving pending", hash);
                Ok(hash)
            }
        }
    }

    async fn await_receipt(&self, hash: &str) -> ReceiptOutcome {
        let deadline = Instant::now() + self.receipt_wait;
        loop {
            if self.ctl.is_cancelled() {
                return ReceiptOutcome::Unknown;
            }
            let lookup = self
                .rpc
                .execute(|client| {
                    let hash = hash.to_string();
                    async move { client.transaction_receipt(&hash).await }
                })
                .await;
            match lookup {
                Ok(Some(receipt)) => {
                    return if receipt_succeeded(&receipt) {
                        ReceiptOutcome::Confirmed
                    } else {
                        ReceiptOutcome::Rejected("receipt status 0x0".to_string())
                    };
                }
                Ok(None) => {}
                Err(e) => tracing::debug!("Receipt lookup for {} failed: {}", hash, e),
            }
            if Instant::now() >= deadline {
                return ReceiptOutcome::Unknown;
            }
            sleep(self.receipt_poll).await;
        }
    }

    /// Crash-safe accounting: counts hit the store after every item.
    async fn persist_progress(&self) -> Result<(), DispatchError> {
        let (total, done, failed) = self.progress.counts();
        let mut job = self.job.clone();
        job.state = if self.ctl.is_paused() {
            JobState::Paused
        } else {
            JobState::Running
        };
        job.total = total;
        job.done = done;
        job.failed = failed;
        job.updated_at = Utc::now();
        self.store.update_job(&job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn checkpoint_passes_while_running() {
        let ctl = ControlFlag::new();
        assert!(ctl.checkpoint().await);
    }

    #[tokio::test]
    async fn checkpoint_returns_false_after_cancel() {
        let ctl = ControlFlag::new();
        ctl.cancel();
        assert!(!ctl.checkpoint().await);
    }

    #[tokio::test]
    async fn paused_checkpoint_parks_until_resume() {
        let ctl = ControlFlag::new();
        ctl.pause();

        let waiter = {
            let ctl = ctl.clone();
            tokio::spawn(async move { ctl.checkpoint().await })
        };
        sleep(Duration::from_millis(150)).await;
        assert!(!waiter.is_finished());

        ctl.resume();
        let passed = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(passed);
    }

    #[tokio::test]
    async fn paused_checkpoint_honors_cancel() {
        let ctl = ControlFlag::new();
        ctl.pause();

        let waiter = {
            let ctl = ctl.clone();
            tokio::spawn(async move { ctl.checkpoint().await })
        };
        sleep(Duration::from_millis(100)).await;
        ctl.cancel();

        let passed = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(!passed);
    }

    #[tokio::test]
    async fn cooperative_sleep_aborts_on_cancel() {
        let ctl = ControlFlag::new();
        let started = Instant::now();
        let sleeper = {
            let ctl = ctl.clone();
            tokio::spawn(async move { cooperative_sleep(&ctl, Duration::from_secs(60)).await })
        };
        sleep(Duration::from_millis(120)).await;
        ctl.cancel();

        let finished = tokio::time::timeout(Duration::from_secs(1), sleeper)
            .await
            .unwrap()
            .unwrap();
        assert!(!finished);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn eta_needs_at_least_one_processed_item() {
        let tracker = ProgressTracker::new(10);
        assert!(tracker.eta_seconds().is_none());
        tracker.inc_done();
        // One item done out of ten: some finite estimate exists.
        std::thread::sleep(Duration::from_millis(20));
        assert!(tracker.eta_seconds().is_some());
    }

    #[test]
    fn eta_disappears_when_everything_processed() {
        let tracker = ProgressTracker::new(2);
        tracker.inc_done();
        tracker.inc_failed();
        assert!(tracker.eta_seconds().is_none());
    }

    #[test]
    fn batch_config_parses_transfer_items() {
        let cfg: BatchConfig = serde_json::from_value(json!({
            "items": [
                { "to": "0xaa", "amount": 1500 },
                { "to": "0xbb", "amount": 2500, "token": "0xtoken" }
            ]
        }))
        .unwrap();
        assert_eq!(cfg.items.len(), 2);
        assert_eq!(cfg.items[1].token.as_deref(), Some("0xtoken"));
    }

    #[test]
    fn auto_buy_config_parses() {
        let cfg: AutoBuyConfig = serde_json::from_value(json!({
            "router": "0xrouter",
            "amount_in": 1000000,
            "ticks": 5,
            "interval_secs": 60
        }))
        .unwrap();
        assert_eq!(cfg.ticks, 5);
        assert!(cfg.data.is_none());
    }
}
