pub mod config;
pub mod error;
pub mod jobs;
pub mod metrics;
pub mod nonce;
pub mod ratelimit;
pub mod rpc;
pub mod signer;

pub use config::DispatchConfig;
pub use error::DispatchError;
pub use jobs::{JobCallbacks, JobEngine, JobStore, MemoryJobStore};
pub use nonce::{NonceManager, NonceSource};
pub use ratelimit::RateLimiter;
pub use rpc::{HealthChecker, RpcClient, RpcManager};
pub use signer::Signer;
