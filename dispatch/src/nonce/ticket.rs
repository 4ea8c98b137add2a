use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketStatus {
    Reserved,
    Pending,
    Confirmed,
    Failed,
    Expired,
}

impl TicketStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TicketStatus::Confirmed | TicketStatus::Failed | TicketStatus::Expired
        )
    }

    /// A ticket that still owns its nonce: reserved or broadcast but not yet
    /// settled either way.
    pub fn is_outstanding(&self) -> bool {
        matches!(self, TicketStatus::Reserved | TicketStatus::Pending)
    }
}

/// A provisional claim on one sequence number. Must be completed, confirmed,
/// failed, or left to the sweep to expire.
#[derive(Debug, Clone, Serialize)]
pub struct NonceTicket {
    pub id: Uuid,
    pub address: String,
    pub nonce: u64,
    pub status: TicketStatus,
    pub reserved_at: DateTime<Utc>,
    #[serde(skip)]
    pub reserved_instant: Instant,
    #[serde(skip)]
    pub finished_instant: Option<Instant>,
    pub tx_hash: Option<String>,
    pub error: Option<String>,
}

impl NonceTicket {
    pub fn new(address: &str, nonce: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            address: address.to_string(),
            nonce,
            status: TicketStatus::Reserved,
            reserved_at: Utc::now(),
            reserved_instant: Instant::now(),
            finished_instant: None,
            tx_hash: None,
            error: None,
        }
    }
}
