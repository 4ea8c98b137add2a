pub mod engine;
pub mod executor;
pub mod store;

pub use engine::{JobCallbacks, JobEngine};
pub use executor::ControlFlag;
pub use store::{JobStore, MemoryJobStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobMode {
    /// Bulk token distribution to a list of recipients.
    Distribution,
    /// Scheduled buys at a fixed interval.
    AutoBuy,
    /// Reward payout batch.
    Rewards,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub title: String,
    pub mode: JobMode,
    pub state: JobState,
    pub priority: u32,
    pub total: u64,
    pub done: u64,
    pub failed: u64,
    pub config: Value,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(title: &str, mode: JobMode, config: Value, priority: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: title.to_string(),
            mode,
            state: JobState::Pending,
            priority,
            total: 0,
            done: 0,
            failed: 0,
            config,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobProgress {
    pub id: Uuid,
    pub state: JobState,
    pub total: u64,
    pub done: u64,
    pub failed: u64,
    pub eta_seconds: Option<u64>,
}
