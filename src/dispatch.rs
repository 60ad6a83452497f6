//! Send-now or store-for-later routing for new payloads.
//!
//! The decision re-derives backlog state from the store on every call rather
//! than trusting cached counters, so it stays correct across crashes at the
//! cost of a directory listing per payload.

use crate::address::{next_address, Address, Endpoint};
use crate::config::Config;
use crate::error::Result;
use crate::pool::TransferSlotPool;
use crate::queue::PersistentQueue;
use crate::store::DurableStore;
use crate::transport::Transport;
use bytes::Bytes;
use std::sync::Arc;

/// Backlog state recovered from the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BacklogScan {
    /// Number of queued payload files
    pub count: usize,
    /// Highest address on disk, 0 when there is none
    pub max_offset: u32,
}

/// Count queued payload files and find the highest address among them.
pub fn scan_backlog(store: &dyn DurableStore, endpoint: Endpoint) -> Result<BacklogScan> {
    let mut scan = BacklogScan::default();
    for name in store.list(endpoint.prefix())? {
        scan.count += 1;
        match endpoint.parse_payload_name(&name) {
            Some(address) => scan.max_offset = scan.max_offset.max(address.value()),
            None => tracing::debug!(file = %name, "Payload file without a numeric address"),
        }
    }
    Ok(scan)
}

/// Where a payload ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Handed straight to the slot pool
    Sent { slot: usize },
    /// Written to disk and queued
    Stored { address: Address },
    /// Backlog blew past its tolerance: everything queued was discarded,
    /// including this payload
    Overflowed { discarded: usize },
}

pub struct DispatchController {
    endpoint: Endpoint,
    store: Arc<dyn DurableStore>,
    transport: Arc<dyn Transport>,
    pool: TransferSlotPool,
}

impl DispatchController {
    pub fn new(
        endpoint: Endpoint,
        store: Arc<dyn DurableStore>,
        transport: Arc<dyn Transport>,
        pool: TransferSlotPool,
    ) -> Self {
        Self {
            endpoint,
            store,
            transport,
            pool,
        }
    }

    /// Route a new payload.
    pub fn handle(
        &self,
        queue: &mut PersistentQueue,
        config: &Config,
        payload: Bytes,
    ) -> Result<Dispatch> {
        let connection = self.transport.connection_state();
        let backlog = scan_backlog(self.store.as_ref(), self.endpoint)?;

        // Never let a fresh payload overtake the backlog
        if !connection.is_closed() && backlog.count == 0 {
            let submission = self.pool.submit(payload);
            return Ok(Dispatch::Sent {
                slot: submission.slot(),
            });
        }

        if backlog.max_offset <= config.max_offset && backlog.count <= config.backlog_tolerance()
        {
            let address = next_address(backlog.max_offset);
            let name = self.endpoint.payload_name(address);
            self.store.write(&name, &payload)?;
            if let Err(e) = queue.insert(address) {
                // Never leave a file the queue does not know about
                if let Err(cleanup) = self.store.delete(&name) {
                    tracing::warn!(file = %name, error = %cleanup, "Failed to remove unqueued payload");
                }
                return Err(e);
            }
            queue.persist()?;

            tracing::debug!(
                address = %address,
                backlog = backlog.count + 1,
                ?connection,
                "Stored payload for later"
            );
            return Ok(Dispatch::Stored { address });
        }

        let discarded = self.discard_backlog(queue)?;
        tracing::warn!(
            discarded,
            max_offset = backlog.max_offset,
            count = backlog.count,
            "Backlog overflowed its tolerance, discarded all queued payloads"
        );
        Ok(Dispatch::Overflowed { discarded })
    }

    /// Delete every queued payload file and empty the queue.
    pub fn discard_backlog(&self, queue: &mut PersistentQueue) -> Result<usize> {
        queue.clear()?;
        let mut discarded = 0;
        for name in self.store.list(self.endpoint.prefix())? {
            if self.store.delete(&name)? {
                discarded += 1;
            }
        }
        Ok(discarded)
    }
}
