//! Relay cores: the owned state behind each endpoint.
//!
//! A core is a plain struct with synchronous operations. It is meant to be
//! owned by exactly one task (see [`crate::runtime`]), which makes every
//! queue and config mutation atomic with respect to the others.

use crate::address::Endpoint;
use crate::config::{Config, ConfigStore, PartialConfig};
use crate::dispatch::{Dispatch, DispatchController};
use crate::drain::{DrainLoop, DrainOutcome};
use crate::error::{RelayError, Result};
use crate::pool::TransferSlotPool;
use crate::queue::{PersistentQueue, Reconciliation};
use crate::store::DurableStore;
use crate::transport::Transport;
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;

/// Encode an application value for transfer.
pub fn encode_value<T: Serialize>(value: &T) -> Result<Bytes> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| RelayError::serialization("payload", e))
}

/// Merge, validate and persist a config override.
fn apply_overrides(
    store: &dyn DurableStore,
    current: &Config,
    overrides: &PartialConfig,
) -> Result<Config> {
    let next = current.merged(overrides);
    next.validate()?;
    ConfigStore::new(store).write(&next)?;
    Ok(next)
}

/// Buffering endpoint (watch role): stores payloads while the link is down
/// and drains them once it comes back.
pub struct BufferingRelay {
    store: Arc<dyn DurableStore>,
    config: Config,
    queue: PersistentQueue,
    pool: TransferSlotPool,
    dispatch: DispatchController,
    drain: DrainLoop,
    startup: Reconciliation,
}

impl BufferingRelay {
    const ENDPOINT: Endpoint = Endpoint::Buffering;

    /// Load config and queue, restore the file/queue invariant, and clear
    /// inbound artifacts left by the peer.
    pub fn open(store: Arc<dyn DurableStore>, transport: Arc<dyn Transport>) -> Result<Self> {
        let config = ConfigStore::new(store.as_ref()).load_or_default()?;
        let mut queue = PersistentQueue::load(store.clone(), Self::ENDPOINT, config.payload_limit)?;
        let startup = queue.reconcile()?;
        queue.set_limit(config.payload_limit)?;

        let mut purged = 0;
        for name in store.list(Self::ENDPOINT.peer().prefix())? {
            if store.delete(&name)? {
                purged += 1;
            }
        }

        let pool = TransferSlotPool::new(Self::ENDPOINT, transport.clone());
        let dispatch =
            DispatchController::new(Self::ENDPOINT, store.clone(), transport.clone(), pool.clone());
        let drain = DrainLoop::new(Self::ENDPOINT, store.clone(), transport, pool.clone());

        tracing::info!(
            backlog = queue.len(),
            limit = config.payload_limit,
            purged_inbound = purged,
            "Buffering relay ready"
        );

        Ok(Self {
            store,
            config,
            queue,
            pool,
            dispatch,
            drain,
            startup,
        })
    }

    pub fn send(&mut self, payload: Bytes) -> Result<Dispatch> {
        self.dispatch.handle(&mut self.queue, &self.config, payload)
    }

    pub fn send_value<T: Serialize>(&mut self, value: &T) -> Result<Dispatch> {
        let payload = encode_value(value)?;
        self.send(payload)
    }

    pub fn drain_tick(&mut self) -> Result<DrainOutcome> {
        self.drain.tick(&mut self.queue)
    }

    /// Replace the config with `overrides` merged over it. On error the
    /// current config stays in force.
    pub fn configure(&mut self, overrides: &PartialConfig) -> Result<&Config> {
        let next = apply_overrides(self.store.as_ref(), &self.config, overrides)?;
        if next.payload_limit != self.config.payload_limit {
            self.queue.set_limit(next.payload_limit)?;
        }
        tracing::info!(?overrides, "Configuration updated");
        self.config = next;
        Ok(&self.config)
    }

    /// Persist the queue. Called on every graceful stop.
    pub fn shutdown(&self) -> Result<()> {
        self.queue.persist()?;
        tracing::info!(backlog = self.queue.len(), "Buffering relay persisted");
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn queue(&self) -> &PersistentQueue {
        &self.queue
    }

    pub fn pool(&self) -> &TransferSlotPool {
        &self.pool
    }

    /// What the startup reconciliation had to fix.
    pub fn startup_report(&self) -> &Reconciliation {
        &self.startup
    }
}

/// Transient endpoint (companion role): every payload goes straight to the
/// slot pool; the transport's same-name overwrite stands in for a backlog.
pub struct TransientRelay {
    store: Arc<dyn DurableStore>,
    transport: Arc<dyn Transport>,
    config: Config,
    pool: TransferSlotPool,
}

impl TransientRelay {
    const ENDPOINT: Endpoint = Endpoint::Transient;

    pub fn open(store: Arc<dyn DurableStore>, transport: Arc<dyn Transport>) -> Result<Self> {
        let config = ConfigStore::new(store.as_ref()).load_or_default()?;
        let pool = TransferSlotPool::new(Self::ENDPOINT, transport.clone());
        tracing::info!("Transient relay ready");
        Ok(Self {
            store,
            transport,
            config,
            pool,
        })
    }

    pub fn send(&mut self, payload: Bytes) -> Result<Dispatch> {
        let submission = self.pool.submit(payload);
        Ok(Dispatch::Sent {
            slot: submission.slot(),
        })
    }

    pub fn send_value<T: Serialize>(&mut self, value: &T) -> Result<Dispatch> {
        let payload = encode_value(value)?;
        self.send(payload)
    }

    pub fn configure(&mut self, overrides: &PartialConfig) -> Result<&Config> {
        self.config = apply_overrides(self.store.as_ref(), &self.config, overrides)?;
        tracing::info!(?overrides, "Configuration updated");
        Ok(&self.config)
    }

    /// Keep-alive ping. Failure is expected while the peer is away.
    pub async fn awaken(&self) {
        if let Err(e) = self.transport.ping().await {
            tracing::debug!(error = %e, "Keep-alive ping failed");
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pool(&self) -> &TransferSlotPool {
        &self.pool
    }
}
