use prometheus::core::Collector;
use prometheus::{Encoder, IntCounter, IntGauge, TextEncoder};
use std::sync::OnceLock;

static RPC_REQUESTS: OnceLock<IntCounter> = OnceLock::new();
static RPC_ERRORS: OnceLock<IntCounter> = OnceLock::new();
static RPC_FAILOVERS: OnceLock<IntCounter> = OnceLock::new();
static HEDGE_LAUNCHES: OnceLock<IntCounter> = OnceLock::new();
static HEDGE_SECONDARY_WINS: OnceLock<IntCounter> = OnceLock::new();

static RATE_LIMIT_BLOCKED: OnceLock<IntCounter> = OnceLock::new();
static RATE_LIMIT_TIMEOUTS: OnceLock<IntCounter> = OnceLock::new();

static NONCE_RESERVED: OnceLock<IntCounter> = OnceLock::new();
static NONCE_RESYNCS: OnceLock<IntCounter> = OnceLock::new();
static NONCE_EXPIRED: OnceLock<IntCounter> = OnceLock::new();

static JOBS_SUBMITTED: OnceLock<IntCounter> = OnceLock::new();
static JOBS_COMPLETED: OnceLock<IntCounter> = OnceLock::new();
static JOBS_FAILED: OnceLock<IntCounter> = OnceLock::new();
static JOBS_CANCELLED: OnceLock<IntCounter> = OnceLock::new();

static ACTIVE_JOBS: OnceLock<IntGauge> = OnceLock::new();
static HEALTHY_ENDPOINTS: OnceLock<IntGauge> = OnceLock::new();

fn rpc_requests() -> &'static IntCounter {
    RPC_REQUESTS
        .get_or_init(|| IntCounter::new("rpc_requests_total", "Total RPC requests issued").unwrap())
}

fn rpc_errors() -> &'static IntCounter {
    RPC_ERRORS.get_or_init(|| IntCounter::new("rpc_errors_total", "Total RPC errors").unwrap())
}

fn rpc_failovers() -> &'static IntCounter {
    RPC_FAILOVERS.get_or_init(|| {
        IntCounter::new(
            "rpc_failovers_total",
            "Times a request moved to an alternate endpoint",
        )
        .unwrap()
    })
}

fn hedge_launches() -> &'static IntCounter {
    HEDGE_LAUNCHES.get_or_init(|| {
        IntCounter::new("hedge_launches_total", "Secondary hedge requests launched").unwrap()
    })
}

fn hedge_secondary_wins() -> &'static IntCounter {
    HEDGE_SECONDARY_WINS.get_or_init(|| {
        IntCounter::new(
            "hedge_secondary_wins_total",
            "Hedge races won by the secondary endpoint",
        )
        .unwrap()
    })
}

fn rate_limit_blocked() -> &'static IntCounter {
    RATE_LIMIT_BLOCKED.get_or_init(|| {
        IntCounter::new(
            "rate_limit_blocked_total",
            "Non-blocking admissions refused",
        )
        .unwrap()
    })
}

fn rate_limit_timeouts() -> &'static IntCounter {
    RATE_LIMIT_TIMEOUTS.get_or_init(|| {
        IntCounter::new(
            "rate_limit_timeouts_total",
            "Blocking admissions that timed out",
        )
        .unwrap()
    })
}

fn nonce_reserved() -> &'static IntCounter {
    NONCE_RESERVED
        .get_or_init(|| IntCounter::new("nonce_reserved_total", "Nonce tickets issued").unwrap())
}

fn nonce_resyncs() -> &'static IntCounter {
    NONCE_RESYNCS.get_or_init(|| {
        IntCounter::new("nonce_resyncs_total", "Network nonce resynchronizations").unwrap()
    })
}

fn nonce_expired() -> &'static IntCounter {
    NONCE_EXPIRED.get_or_init(|| {
        IntCounter::new("nonce_expired_total", "Reservations reclaimed by the sweep").unwrap()
    })
}

fn jobs_submitted() -> &'static IntCounter {
    JOBS_SUBMITTED
        .get_or_init(|| IntCounter::new("jobs_submitted_total", "Jobs submitted").unwrap())
}

fn jobs_completed() -> &'static IntCounter {
    JOBS_COMPLETED
        .get_or_init(|| IntCounter::new("jobs_completed_total", "Jobs completed").unwrap())
}

fn jobs_failed() -> &'static IntCounter {
    JOBS_FAILED.get_or_init(|| IntCounter::new("jobs_failed_total", "Jobs failed").unwrap())
}

fn jobs_cancelled() -> &'static IntCounter {
    JOBS_CANCELLED
        .get_or_init(|| IntCounter::new("jobs_cancelled_total", "Jobs cancelled").unwrap())
}

fn active_jobs() -> &'static IntGauge {
    ACTIVE_JOBS
        .get_or_init(|| IntGauge::new("active_jobs", "Executors currently running").unwrap())
}

fn healthy_endpoints() -> &'static IntGauge {
    HEALTHY_ENDPOINTS.get_or_init(|| {
        IntGauge::new("healthy_endpoints", "RPC endpoints currently healthy").unwrap()
    })
}

pub fn inc_rpc_requests() {
    rpc_requests().inc();
}

pub fn inc_rpc_errors() {
    rpc_errors().inc();
}

pub fn inc_rpc_failovers() {
    rpc_failovers().inc();
}

pub fn inc_hedge_launches() {
    hedge_launches().inc();
}

pub fn inc_hedge_secondary_wins() {
    hedge_secondary_wins().inc();
}

pub fn inc_rate_limit_blocked() {
    rate_limit_blocked().inc();
}

pub fn inc_rate_limit_timeouts() {
    rate_limit_timeouts().inc();
}

pub fn inc_nonce_reserved() {
    nonce_reserved().inc();
}

pub fn inc_nonce_resyncs() {
    nonce_resyncs().inc();
}

pub fn inc_nonce_expired_by(n: u64) {
    nonce_expired().inc_by(n);
}

pub fn inc_jobs_submitted() {
    jobs_submitted().inc();
}

pub fn inc_jobs_completed() {
    jobs_completed().inc();
}

pub fn inc_jobs_failed() {
    jobs_failed().inc();
}

pub fn inc_jobs_cancelled() {
    jobs_cancelled().inc();
}

pub fn inc_active_jobs() {
    active_jobs().inc();
}

pub fn dec_active_jobs() {
    active_jobs().dec();
}

pub fn set_healthy_endpoints(n: usize) {
    healthy_endpoints().set(n as i64);
}

pub fn render() -> String {
    let enc = TextEncoder::new();
    let mut mfs = Vec::new();

    mfs.extend(rpc_requests().collect());
    mfs.extend(rpc_errors().collect());
    mfs.extend(rpc_failovers().collect());
    mfs.extend(hedge_launches().collect());
    mfs.extend(hedge_secondary_wins().collect());
    mfs.extend(rate_limit_blocked().collect());
    mfs.extend(rate_limit_timeouts().collect());
    mfs.extend(nonce_reserved().collect());
    mfs.extend(nonce_resyncs().collect());
    mfs.extend(nonce_expired().collect());
    mfs.extend(jobs_submitted().collect());
    mfs.extend(jobs_completed().collect());
    mfs.extend(jobs_failed().collect());
    mfs.extend(jobs_cancelled().collect());
    mfs.extend(active_jobs().collect());
    mfs.extend(healthy_endpoints().collect());

    let mut buf = Vec::new();
    let _ = enc.encode(&mfs, &mut buf);
    String::from_utf8_lossy(&buf).to_string()
}
