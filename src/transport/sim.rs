//! In-process transport for tests and the demo binary.
//!
//! Models the behaviour the relay has to cope with: a connection that comes
//! and goes, a small concurrency ceiling past which enqueues are rejected,
//! same-name supersession, and transfers that resolve later (or never).

use super::{ConnectionState, ReadyState, TransferHandle, TransferHandlePtr, Transport};
use crate::error::{RelayError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// A transfer enqueued on the [`SimTransport`].
#[derive(Debug)]
pub struct SimTransfer {
    name: String,
    payload: Bytes,
    state: Mutex<ReadyState>,
    cancel_requests: Mutex<u32>,
}

impl SimTransfer {
    fn new(name: String, payload: Bytes) -> Self {
        Self {
            name,
            payload,
            state: Mutex::new(ReadyState::Pending),
            cancel_requests: Mutex::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Resolve a pending transfer. Terminal states are sticky.
    pub fn resolve(&self, outcome: ReadyState) {
        let mut state = lock(&self.state);
        if *state == ReadyState::Pending {
            *state = outcome;
        }
    }

    pub fn cancel_requests(&self) -> u32 {
        *lock(&self.cancel_requests)
    }
}

impl TransferHandle for SimTransfer {
    fn ready_state(&self) -> ReadyState {
        *lock(&self.state)
    }

    fn cancel(&self) {
        *lock(&self.cancel_requests) += 1;
        self.resolve(ReadyState::Cancelled);
    }
}

struct SimState {
    connection: ConnectionState,
    /// Pending transfers allowed before enqueue starts rejecting
    ceiling: Option<usize>,
    reject_all: bool,
    enqueue_delay: Option<Duration>,
    /// Cancel requests are recorded but leave the transfer pending
    ignore_cancel: bool,
    transfers: Vec<Arc<SimTransfer>>,
    pings: u32,
}

/// Simulated transport. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SimTransport {
    inner: Arc<Mutex<SimState>>,
}

impl Default for SimTransport {
    fn default() -> Self {
        Self::new(ConnectionState::Open)
    }
}

impl SimTransport {
    pub fn new(connection: ConnectionState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SimState {
                connection,
                ceiling: None,
                reject_all: false,
                enqueue_delay: None,
                ignore_cancel: false,
                transfers: Vec::new(),
                pings: 0,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        lock(&self.inner)
    }

    pub fn set_connection(&self, connection: ConnectionState) {
        tracing::debug!(?connection, "Sim link state changed");
        self.state().connection = connection;
    }

    pub fn set_ceiling(&self, ceiling: Option<usize>) {
        self.state().ceiling = ceiling;
    }

    pub fn set_reject_all(&self, reject: bool) {
        self.state().reject_all = reject;
    }

    pub fn set_enqueue_delay(&self, delay: Option<Duration>) {
        self.state().enqueue_delay = delay;
    }

    pub fn set_ignore_cancel(&self, ignore: bool) {
        self.state().ignore_cancel = ignore;
    }

    /// Every transfer ever accepted, in enqueue order.
    pub fn transfers(&self) -> Vec<Arc<SimTransfer>> {
        self.state().transfers.clone()
    }

    pub fn pending(&self) -> Vec<Arc<SimTransfer>> {
        self.state()
            .transfers
            .iter()
            .filter(|t| t.ready_state() == ReadyState::Pending)
            .cloned()
            .collect()
    }

    /// Resolve every pending transfer as transferred. Returns how many.
    pub fn deliver_all(&self) -> usize {
        let pending = self.pending();
        for transfer in &pending {
            transfer.resolve(ReadyState::Transferred);
        }
        pending.len()
    }

    /// Payloads that reached the peer, in enqueue order.
    pub fn delivered(&self) -> Vec<Bytes> {
        self.state()
            .transfers
            .iter()
            .filter(|t| t.ready_state() == ReadyState::Transferred)
            .map(|t| t.payload.clone())
            .collect()
    }

    pub fn pings(&self) -> u32 {
        self.state().pings
    }
}

#[async_trait]
impl Transport for SimTransport {
    async fn enqueue(&self, name: &str, payload: Bytes) -> Result<TransferHandlePtr> {
        let delay = self.state().enqueue_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if state.reject_all {
            return Err(RelayError::Transport(format!("enqueue of {} rejected", name)));
        }

        // Same name supersedes whatever is still in flight under it
        for prior in state.transfers.iter().filter(|t| t.name == name) {
            prior.resolve(ReadyState::Cancelled);
        }

        if let Some(ceiling) = state.ceiling {
            let in_flight = state
                .transfers
                .iter()
                .filter(|t| t.ready_state() == ReadyState::Pending)
                .count();
            if in_flight >= ceiling {
                return Err(RelayError::Transport(format!(
                    "enqueue of {} rejected: {} transfers in flight",
                    name, in_flight
                )));
            }
        }

        let transfer = Arc::new(SimTransfer::new(name.to_string(), payload));
        state.transfers.push(transfer.clone());
        let handle: TransferHandlePtr = if state.ignore_cancel {
            Arc::new(StubbornTransfer(transfer))
        } else {
            transfer
        };
        Ok(handle)
    }

    fn connection_state(&self) -> ConnectionState {
        self.state().connection
    }

    async fn ping(&self) -> Result<()> {
        let mut state = self.state();
        if !state.connection.is_open() {
            return Err(RelayError::Transport("peer not open".to_string()));
        }
        state.pings += 1;
        Ok(())
    }
}

/// Handle whose cancel requests are counted but otherwise ignored.
#[derive(Debug)]
struct StubbornTransfer(Arc<SimTransfer>);

impl TransferHandle for StubbornTransfer {
    fn ready_state(&self) -> ReadyState {
        self.0.ready_state()
    }

    fn cancel(&self) {
        *lock(&self.0.cancel_requests) += 1;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
