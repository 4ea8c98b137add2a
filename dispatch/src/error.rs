use thiserror::Error;
use uuid::Uuid;

/// Which side of the sequence the network disagreed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceConflictKind {
    TooLow,
    TooHigh,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("rate limit admission timed out after {waited_ms}ms (key: {key:?})")]
    RateLimitTimeout { key: Option<String>, waited_ms: u64 },

    #[error("no healthy RPC endpoint available")]
    NoHealthyEndpoint,

    #[error("nonce conflict for {address}: {kind:?}")]
    NonceConflict {
        address: String,
        kind: NonceConflictKind,
    },

    #[error("transaction rejected on-chain: {reason}")]
    TransactionRejected { reason: String },

    #[error("job execution failed: {0}")]
    JobExecutionError(String),

    #[error("rpc failure: {0}")]
    Rpc(String),

    /// The node answered with a JSON-RPC error object. The endpoint is
    /// alive; retrying elsewhere will not change the answer.
    #[error("node error: {0}")]
    Node(String),

    #[error("job store failure: {0}")]
    Store(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("unknown ticket {0}")]
    UnknownTicket(Uuid),

    #[error("invalid ticket transition: {0}")]
    TicketTransition(String),

    #[error("unknown job {0}")]
    UnknownJob(Uuid),
}
