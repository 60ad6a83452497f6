//! Transport abstraction consumed by the relay.
//!
//! The transport offers a single asynchronous primitive: enqueue a named blob
//! for transfer. An enqueue under a name that is already in flight supersedes
//! the earlier transfer. Resolved transfers expose a readiness state that the
//! slot pool polls when reclaiming.

pub mod sim;

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

pub use sim::{SimTransfer, SimTransport};

/// Link state reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Connecting,
    Closed,
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionState::Closed)
    }
}

/// Observable state of an enqueued transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Pending,
    Cancelled,
    Transferred,
    Error,
}

impl ReadyState {
    /// Terminal transfers free their slot on the next sweep.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReadyState::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReadyState::Pending => "pending",
            ReadyState::Cancelled => "cancelled",
            ReadyState::Transferred => "transferred",
            ReadyState::Error => "error",
        }
    }
}

impl fmt::Display for ReadyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live reference to an enqueued transfer.
pub trait TransferHandle: Send + Sync + fmt::Debug {
    fn ready_state(&self) -> ReadyState;

    /// Request cancellation. Best effort; completion is never awaited.
    fn cancel(&self);
}

pub type TransferHandlePtr = Arc<dyn TransferHandle>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Enqueue `payload` under `name`. May fail once the transport's own
    /// concurrency ceiling is reached.
    async fn enqueue(&self, name: &str, payload: Bytes) -> Result<TransferHandlePtr>;

    fn connection_state(&self) -> ConnectionState;

    /// Best-effort keep-alive message to the peer.
    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
