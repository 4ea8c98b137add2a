pub mod ticket;

pub use ticket::{NonceTicket, TicketStatus};

use async_trait::async_trait;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::NonceSettings;
use crate::error::{DispatchError, NonceConflictKind};
use crate::metrics::prometheus as metrics;
use crate::rpc::manager::RpcManager;

/// Where the authoritative pending nonce comes from. Injected so the
/// manager is testable without sockets.
#[async_trait]
pub trait NonceSource: Send + Sync {
    async fn pending_nonce(&self, address: &str) -> Result<u64, DispatchError>;
}

#[async_trait]
impl NonceSource for RpcManager {
    async fn pending_nonce(&self, address: &str) -> Result<u64, DispatchError> {
        let address = address.to_string();
        self.execute(|client| {
            let address = address.clone();
            async move { client.pending_nonce(&address).await }
        })
        .await
    }
}

#[derive(Debug)]
struct AddressNonceState {
    address: String,
    network_nonce: u64,
    next_nonce: u64,
    pending: BTreeSet<u64>,
    confirmed: BTreeSet<u64>,
    failed: BTreeSet<u64>,
    tickets: HashMap<Uuid, NonceTicket>,
    last_resync: Option<Instant>,
}

impl AddressNonceState {
    fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            network_nonce: 0,
            next_nonce: 0,
            pending: BTreeSet::new(),
            confirmed: BTreeSet::new(),
            failed: BTreeSet::new(),
            tickets: HashMap::new(),
            last_resync: None,
        }
    }

    fn has_outstanding(&self) -> bool {
        self.tickets.values().any(|t| t.status.is_outstanding())
    }

    /// Anything still holding a nonce at or above `nonce` blocks a rollback.
    fn outstanding_at_or_above(&self, nonce: u64) -> bool {
        self.tickets
            .values()
            .any(|t| t.status.is_outstanding() && t.nonce >= nonce)
    }

    /// Roll the counter back over `nonce` if it was the tail reservation.
    fn release_tail(&mut self, nonce: u64) -> bool {
        if self.next_nonce == nonce + 1 && !self.outstanding_at_or_above(nonce) {
            self.next_nonce = nonce;
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AddressNonceSnapshot {
    pub address: String,
    pub network_nonce: u64,
    pub next_nonce: u64,
    pub reserved: usize,
    pub pending: usize,
    pub confirmed: usize,
    pub failed: usize,
    pub tracked_tickets: usize,
}

/// Per-address sequence-number bookkeeping. Issuance is strictly sequential
/// under each address's own lock; the process-wide map lock only guards
/// creation of new per-address state.
pub struct NonceManager {
    source: Arc<dyn NonceSource>,
    reservation_timeout: Duration,
    sweep_interval: Duration,
    audit_retention: Duration,
    states: RwLock<HashMap<String, Arc<Mutex<AddressNonceState>>>>,
    sweep_task: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl NonceManager {
    pub fn new(source: Arc<dyn NonceSource>, settings: &NonceSettings) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            source,
            reservation_timeout: Duration::from_secs(settings.reservation_timeout_secs),
            sweep_interval: Duration::from_secs(settings.sweep_interval_secs.max(1)),
            audit_retention: Duration::from_secs(settings.audit_retention_secs),
            states: RwLock::new(HashMap::new()),
            sweep_task: Mutex::new(None),
            shutdown_tx,
        }
    }

    async fn state_for(&self, address: &str) -> Arc<Mutex<AddressNonceState>> {
        if let Some(s) = self.states.read().await.get(address) {
            return s.clone();
        }
        let mut map = self.states.write().await;
        map.entry(address.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(AddressNonceState::new(address))))
            .clone()
    }

    async fn existing_state(
        &self,
        ticket: &NonceTicket,
    ) -> Result<Arc<Mutex<AddressNonceState>>, DispatchError> {
        self.states
            .read()
            .await
            .get(&ticket.address)
            .cloned()
            .ok_or(DispatchError::UnknownTicket(ticket.id))
    }

    /// Hand out the next sequence number for `address`. The first
    /// reservation for an address synchronizes against the network before
    /// issuing anything.
    pub async fn reserve(&self, address: &str) -> Result<NonceTicket, DispatchError> {
        let state = self.state_for(address).await;
        let mut st = state.lock().await;

        if st.last_resync.is_none() {
            let n = self.source.pending_nonce(address).await?;
            st.network_nonce = n;
            st.next_nonce = st.next_nonce.max(n);
            st.last_resync = Some(Instant::now());
            metrics::inc_nonce_resyncs();
            tracing::debug!("Initial nonce sync for {}: {}", address, n);
        }

        let nonce = st.next_nonce;
        st.next_nonce += 1;
        let ticket = NonceTicket::new(address, nonce);
        st.tickets.insert(ticket.id, ticket.clone());
        metrics::inc_nonce_reserved();
        Ok(ticket)
    }

    /// Transaction broadcast: RESERVED -> PENDING.
    pub async fn complete(&self, ticket: &NonceTicket, tx_hash: &str) -> Result<(), DispatchError> {
        let state = self.existing_state(ticket).await?;
        let mut st = state.lock().await;
        let entry = st
            .tickets
            .get_mut(&ticket.id)
            .ok_or(DispatchError::UnknownTicket(ticket.id))?;
        if entry.status != TicketStatus::Reserved {
            return Err(DispatchError::TicketTransition(format!(
                "{} is {:?}, expected RESERVED",
                entry.id, entry.status
            )));
        }
        entry.status = TicketStatus::Pending;
        entry.tx_hash = Some(tx_hash.to_string());
        let nonce = entry.nonce;
        st.pending.insert(nonce);
        Ok(())
    }

    /// Inclusion observed: PENDING -> CONFIRMED.
    pub async fn confirm(&self, ticket: &NonceTicket) -> Result<(), DispatchError> {
        let state = self.existing_state(ticket).await?;
        let mut st = state.lock().await;
        let entry = st
            .tickets
            .get_mut(&ticket.id)
            .ok_or(DispatchError::UnknownTicket(ticket.id))?;
        if entry.status != TicketStatus::Pending {
            return Err(DispatchError::TicketTransition(format!(
                "{} is {:?}, expected PENDING",
                entry.id, entry.status
            )));
        }
        entry.status = TicketStatus::Confirmed;
        entry.finished_instant = Some(Instant::now());
        let nonce = entry.nonce;
        st.pending.remove(&nonce);
        st.confirmed.insert(nonce);
        Ok(())
    }

    /// Broadcast rejected: mark FAILED and run reason-specific recovery.
    /// "nonce too low" resyncs against the network immediately; "nonce too
    /// high" closes the gap the failed ticket created when it was the tail.
    pub async fn fail(&self, ticket: &NonceTicket, reason: &str) -> Result<(), DispatchError> {
        let state = self.existing_state(ticket).await?;
        let mut st = state.lock().await;

        let nonce = {
            let entry = st
                .tickets
                .get_mut(&ticket.id)
                .ok_or(DispatchError::UnknownTicket(ticket.id))?;
            if entry.status.is_terminal() {
                return Err(DispatchError::TicketTransition(format!(
                    "{} is already {:?}",
                    entry.id, entry.status
                )));
            }
            entry.status = TicketStatus::Failed;
            entry.error = Some(reason.to_string());
            entry.finished_instant = Some(Instant::now());
            entry.nonce
        };
        st.pending.remove(&nonce);
        st.failed.insert(nonce);

        let reason_lc = reason.to_lowercase();
        if reason_lc.contains("nonce too low") {
            tracing::warn!(
                "Nonce {} too low for {}, resyncing from network",
                nonce,
                st.address
            );
            match self.source.pending_nonce(&st.address).await {
                Ok(n) => {
                    st.network_nonce = n;
                    if n > st.next_nonce {
                        st.next_nonce = n;
                    }
                    st.last_resync = Some(Instant::now());
                    metrics::inc_nonce_resyncs();
                }
                Err(e) => {
                    // Force a fresh sync on the next reservation; recovery
                    // itself failing is the one case the caller must see.
                    st.last_resync = None;
                    tracing::error!("Nonce resync for {} failed: {}", st.address, e);
                    return Err(DispatchError::NonceConflict {
                        address: st.address.clone(),
                        kind: NonceConflictKind::TooLow,
                    });
                }
            }
        } else if reason_lc.contains("nonce too high") && st.release_tail(nonce) {
            tracing::info!(
                "Rolled next nonce for {} back to {} after gap rejection",
                st.address,
                nonce
            );
        }

        Ok(())
    }

    /// Refresh the cached network nonce. Never lowers `next_nonce` while
    /// reservations are outstanding; with nothing in flight the network
    /// value is authoritative.
    pub async fn resync(&self, address: &str) -> Result<u64, DispatchError> {
        let state = self.state_for(address).await;
        let mut st = state.lock().await;
        let n = self.source.pending_nonce(address).await?;
        st.network_nonce = n;
        if st.has_outstanding() {
            if n > st.next_nonce {
                st.next_nonce = n;
            }
        } else {
            st.next_nonce = n;
        }
        st.last_resync = Some(Instant::now());
        metrics::inc_nonce_resyncs();
        Ok(n)
    }

    /// Drop all state for an address. The next reservation starts from a
    /// fresh network sync.
    pub async fn reset(&self, address: &str) {
        self.states.write().await.remove(address);
    }

    /// Current view of a ticket, if it is still tracked.
    pub async fn lookup(&self, ticket: &NonceTicket) -> Option<NonceTicket> {
        let state = self.existing_state(ticket).await.ok()?;
        let st = state.lock().await;
        st.tickets.get(&ticket.id).cloned()
    }

    /// One sweep pass: expire stale reservations (releasing tail nonces) and
    /// garbage-collect terminal tickets past the audit window.
    pub async fn sweep_once(&self) {
        let states: Vec<_> = self.states.read().await.values().cloned().collect();
        let now = Instant::now();
        let mut expired_total = 0u64;

        for state in states {
            let mut st = state.lock().await;

            let mut expired: Vec<(Uuid, u64)> = st
                .tickets
                .values()
                .filter(|t| {
                    t.status == TicketStatus::Reserved
                        && now.saturating_duration_since(t.reserved_instant)
                            >= self.reservation_timeout
                })
                .map(|t| (t.id, t.nonce))
                .collect();
            // Descending so consecutive tail reservations unwind together.
            expired.sort_by(|a, b| b.1.cmp(&a.1));

            for (id, nonce) in expired {
                if let Some(t) = st.tickets.get_mut(&id) {
                    t.status = TicketStatus::Expired;
                    t.finished_instant = Some(now);
                }
                expired_total += 1;
                if st.release_tail(nonce) {
                    tracing::debug!(
                        "Expired reservation released nonce {} for {}",
                        nonce,
                        st.address
                    );
                }
            }

            let retention = self.audit_retention;
            st.tickets.retain(|_, t| match t.finished_instant {
                Some(fin) if t.status.is_terminal() => {
                    now.saturating_duration_since(fin) < retention
                }
                _ => true,
            });
        }

        if expired_total > 0 {
            metrics::inc_nonce_expired_by(expired_total);
            tracing::warn!("⏱️  Expired {} stale nonce reservations", expired_total);
        }
    }

    pub async fn start_sweeper(self: &Arc<Self>) {
        let mgr = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let interval = self.sweep_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => mgr.sweep_once().await,
                    _ = shutdown_rx.changed() => break,
                }
            }
        });
        *self.sweep_task.lock().await = Some(handle);
    }

    pub async fn stop(&self) {
        if self.shutdown_tx.send(true).is_ok() {
            if let Some(handle) = self.sweep_task.lock().await.take() {
                let _ = handle.await;
            }
        }
    }

    pub async fn stats(&self, address: Option<&str>) -> Vec<AddressNonceSnapshot> {
        let states: Vec<_> = {
            let map = self.states.read().await;
            match address {
                Some(a) => map.get(a).cloned().into_iter().collect(),
                None => map.values().cloned().collect(),
            }
        };

        let mut out = Vec::with_capacity(states.len());
        for state in states {
            let st = state.lock().await;
            let reserved = st
                .tickets
                .values()
                .filter(|t| t.status == TicketStatus::Reserved)
                .count();
            out.push(AddressNonceSnapshot {
                address: st.address.clone(),
                network_nonce: st.network_nonce,
                next_nonce: st.next_nonce,
                reserved,
                pending: st.pending.len(),
                confirmed: st.confirmed.len(),
                failed: st.failed.len(),
                tracked_tickets: st.tickets.len(),
            });
        }
        out.sort_by(|a, b| a.address.cmp(&b.address));
        out
    }
}
