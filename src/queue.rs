//! Durable FIFO of queued payload addresses.
//!
//! The in-memory sequence mirrors the `file-queue` blob. Every address in the
//! queue has a backing payload file and vice versa; eviction deletes the file
//! together with the entry so the two never drift apart.

use crate::address::{Address, Endpoint, QUEUE_KEY};
use crate::error::{RelayError, Result};
use crate::store::DurableStore;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

/// Result of a startup reconciliation pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    /// Queue entries dropped because their backing file was gone
    pub dangling_entries: Vec<Address>,
    /// Backing files deleted because no queue entry referenced them
    pub orphan_files: Vec<String>,
}

impl Reconciliation {
    pub fn is_clean(&self) -> bool {
        self.dangling_entries.is_empty() && self.orphan_files.is_empty()
    }
}

pub struct PersistentQueue {
    store: Arc<dyn DurableStore>,
    endpoint: Endpoint,
    limit: usize,
    entries: VecDeque<Address>,
}

impl PersistentQueue {
    /// Load the durable queue, initializing (and persisting) an empty one when
    /// the blob is absent or undecodable.
    pub fn load(store: Arc<dyn DurableStore>, endpoint: Endpoint, limit: usize) -> Result<Self> {
        let mut queue = Self {
            store,
            endpoint,
            limit: limit.max(1),
            entries: VecDeque::new(),
        };

        match queue.store.read(QUEUE_KEY)? {
            Some(bytes) => match serde_json::from_slice::<Vec<Address>>(&bytes) {
                Ok(addresses) => queue.entries = addresses.into(),
                Err(e) => {
                    tracing::warn!(error = %e, "Queue blob is undecodable, starting empty");
                    queue.persist()?;
                }
            },
            None => {
                tracing::debug!("No queue blob, starting empty");
                queue.persist()?;
            }
        }

        Ok(queue)
    }

    /// Write the in-memory sequence to durable storage.
    pub fn persist(&self) -> Result<()> {
        let bytes = serde_json::to_vec(&self.entries)
            .map_err(|e| RelayError::serialization(QUEUE_KEY, e))?;
        self.store.write(QUEUE_KEY, &bytes)
    }

    /// Append an address, evicting the oldest entries (and their files) first
    /// if the queue would otherwise exceed its limit. Returns the evicted
    /// addresses. Does not persist.
    pub fn insert(&mut self, address: Address) -> Result<Vec<Address>> {
        let mut evicted = Vec::new();
        while self.entries.len() >= self.limit {
            let Some(oldest) = self.entries.front().copied() else {
                break;
            };
            // A failed delete leaves the entry queued alongside its file
            self.delete_backing_file(oldest)?;
            self.entries.pop_front();
            evicted.push(oldest);
        }
        self.entries.push_back(address);

        if !evicted.is_empty() {
            tracing::info!(
                evicted = evicted.len(),
                oldest = %evicted[0],
                limit = self.limit,
                "Queue over capacity, evicted oldest payloads"
            );
        }
        Ok(evicted)
    }

    pub fn pop_front(&mut self) -> Option<Address> {
        self.entries.pop_front()
    }

    pub fn front(&self) -> Option<Address> {
        self.entries.front().copied()
    }

    /// Empty the queue and persist. Backing files are left to the caller.
    pub fn clear(&mut self) -> Result<()> {
        self.entries.clear();
        self.persist()
    }

    /// Apply a new capacity, trimming the oldest entries if needed.
    pub fn set_limit(&mut self, limit: usize) -> Result<Vec<Address>> {
        self.limit = limit.max(1);
        let mut evicted = Vec::new();
        while self.entries.len() > self.limit {
            let Some(oldest) = self.entries.front().copied() else {
                break;
            };
            self.delete_backing_file(oldest)?;
            self.entries.pop_front();
            evicted.push(oldest);
        }
        if !evicted.is_empty() {
            self.persist()?;
        }
        Ok(evicted)
    }

    /// Restore the 1:1 invariant between queue entries and backing files.
    pub fn reconcile(&mut self) -> Result<Reconciliation> {
        let mut report = Reconciliation::default();
        let prefix = self.endpoint.prefix();

        let on_disk: HashSet<String> = self.store.list(prefix)?.into_iter().collect();

        let mut kept = VecDeque::with_capacity(self.entries.len());
        let mut seen = HashSet::new();
        for address in self.entries.drain(..) {
            let name = self.endpoint.payload_name(address);
            if on_disk.contains(&name) && seen.insert(name) {
                kept.push_back(address);
            } else {
                report.dangling_entries.push(address);
            }
        }
        self.entries = kept;

        for name in on_disk {
            if !seen.contains(&name) {
                self.store.delete(&name)?;
                report.orphan_files.push(name);
            }
        }
        report.orphan_files.sort();

        if !report.dangling_entries.is_empty() {
            self.persist()?;
        }
        if !report.is_clean() {
            tracing::warn!(
                dangling = report.dangling_entries.len(),
                orphans = report.orphan_files.len(),
                "Reconciled queue with backing files"
            );
        }
        Ok(report)
    }

    fn delete_backing_file(&self, address: Address) -> Result<()> {
        let name = self.endpoint.payload_name(address);
        if !self.store.delete(&name)? {
            tracing::debug!(file = %name, "Evicted payload had no backing file");
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn to_vec(&self) -> Vec<Address> {
        self.entries.iter().copied().collect()
    }
}
