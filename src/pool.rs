//! Fixed pool of transfer slots.
//!
//! The transport stops accepting work once a handful of transfers are in
//! flight, so every outbound payload goes through one of [`SLOT_COUNT`]
//! slots. Each slot maps to a fixed transport-level name; a new enqueue under
//! a slot's name supersedes whatever was left in flight there, which keeps
//! the number of names the transport ever sees bounded.
//!
//! # Slot lifecycle
//!
//! ```text
//! Empty --reserve--> Placeholder --enqueue ok--> Active(handle)
//!   ^                    |                           |
//!   +---- enqueue err ---+                           |
//!   +---- handle terminal (sweep) or saturation reset+
//! ```
//!
//! The placeholder is written synchronously, before the enqueue task is
//! spawned, so two submissions in the same tick never pick the same slot.

use crate::address::Endpoint;
use crate::transport::{ReadyState, TransferHandlePtr, Transport};
use bytes::Bytes;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;

/// Number of transfer slots. Matches the transport's own concurrency ceiling.
pub const SLOT_COUNT: usize = 6;

#[derive(Debug, Clone)]
enum Slot {
    Empty,
    Placeholder {
        generation: u64,
    },
    Active {
        generation: u64,
        handle: TransferHandlePtr,
    },
}

/// Observable status of a single slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    Empty,
    Placeholder,
    Active(ReadyState),
}

impl SlotStatus {
    pub fn is_empty(&self) -> bool {
        matches!(self, SlotStatus::Empty)
    }
}

struct PoolState {
    slots: [Slot; SLOT_COUNT],
    next_generation: u64,
}

impl PoolState {
    /// Reset every slot whose handle reached a terminal state.
    fn reclaim(&mut self) -> usize {
        let mut freed = 0;
        for slot in self.slots.iter_mut() {
            if let Slot::Active { handle, .. } = slot {
                if handle.ready_state().is_terminal() {
                    *slot = Slot::Empty;
                    freed += 1;
                }
            }
        }
        freed
    }

    fn first_free(&self) -> Option<usize> {
        self.slots.iter().position(|s| matches!(s, Slot::Empty))
    }

    /// Saturation reset: cancel every live handle, then empty every slot
    /// whether or not the cancellation took.
    fn reset_all(&mut self) -> usize {
        let mut cancelled = 0;
        for slot in self.slots.iter_mut() {
            if let Slot::Active { handle, .. } = slot {
                handle.cancel();
                cancelled += 1;
            }
            *slot = Slot::Empty;
        }
        cancelled
    }

    fn reserve(&mut self, index: usize) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.slots[index] = Slot::Placeholder { generation };
        generation
    }

    /// Install the outcome of an enqueue, unless the reservation it belongs
    /// to was reset in the meantime.
    fn settle(
        &mut self,
        index: usize,
        generation: u64,
        result: crate::error::Result<TransferHandlePtr>,
        name: &str,
    ) {
        let current = matches!(
            self.slots[index],
            Slot::Placeholder { generation: g } if g == generation
        );

        match result {
            Ok(handle) if current => {
                tracing::trace!(slot = index, name, "Transfer enqueued");
                self.slots[index] = Slot::Active { generation, handle };
            }
            Ok(_) => {
                // Reset while enqueueing; the next enqueue under this name
                // supersedes the orphaned transfer
                tracing::debug!(slot = index, name, "Enqueue resolved after slot was reset");
            }
            Err(e) => {
                tracing::warn!(slot = index, name, error = %e, "Transport rejected enqueue, payload dropped");
                if current {
                    self.slots[index] = Slot::Empty;
                }
            }
        }
    }

    fn status(&self) -> [SlotStatus; SLOT_COUNT] {
        std::array::from_fn(|i| match &self.slots[i] {
            Slot::Empty => SlotStatus::Empty,
            Slot::Placeholder { .. } => SlotStatus::Placeholder,
            Slot::Active { handle, .. } => SlotStatus::Active(handle.ready_state()),
        })
    }
}

/// Outcome of [`TransferSlotPool::submit`].
///
/// Dropping it is fine: the enqueue keeps running and settles its slot on
/// its own.
pub struct Submission {
    slot: usize,
    saturated: bool,
    task: JoinHandle<()>,
}

impl Submission {
    /// Slot the payload was placed in.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Whether the pool was saturated and had to be reset first.
    pub fn was_saturated(&self) -> bool {
        self.saturated
    }

    /// Wait until the enqueue has resolved and the slot reflects it.
    pub async fn settled(self) {
        if let Err(e) = self.task.await {
            tracing::error!(slot = self.slot, error = %e, "Enqueue task failed");
        }
    }
}

/// Bounded pool of transfer slots. Clones share the same slots.
#[derive(Clone)]
pub struct TransferSlotPool {
    endpoint: Endpoint,
    transport: Arc<dyn Transport>,
    state: Arc<Mutex<PoolState>>,
}

impl TransferSlotPool {
    pub fn new(endpoint: Endpoint, transport: Arc<dyn Transport>) -> Self {
        Self {
            endpoint,
            transport,
            state: Arc::new(Mutex::new(PoolState {
                slots: std::array::from_fn(|_| Slot::Empty),
                next_generation: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Hand a payload to the transport through a free slot.
    ///
    /// Sweeps terminated transfers first; if every slot is still busy, all of
    /// them are cancelled and reset and the payload takes slot 0. The enqueue
    /// itself runs on a spawned task, so this must be called from within a
    /// Tokio runtime.
    pub fn submit(&self, payload: Bytes) -> Submission {
        let (slot, generation, saturated) = {
            let mut state = self.lock();
            state.reclaim();
            let (slot, saturated) = match state.first_free() {
                Some(index) => (index, false),
                None => {
                    let cancelled = state.reset_all();
                    tracing::warn!(
                        cancelled,
                        "All transfer slots busy, cancelled in-flight transfers"
                    );
                    (0, true)
                }
            };
            let generation = state.reserve(slot);
            (slot, generation, saturated)
        };

        let name = self.endpoint.transfer_name(slot);
        let transport = self.transport.clone();
        let state = self.state.clone();
        let bytes = payload.len();

        tracing::debug!(slot, name = %name, bytes, "Submitting payload");

        let task = tokio::spawn(async move {
            let result = transport.enqueue(&name, payload).await;
            let mut state = state
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            state.settle(slot, generation, result, &name);
        });

        Submission {
            slot,
            saturated,
            task,
        }
    }

    /// Sweep terminated transfers. Returns how many slots were freed.
    pub fn reclaim(&self) -> usize {
        self.lock().reclaim()
    }

    pub fn snapshot(&self) -> [SlotStatus; SLOT_COUNT] {
        self.lock().status()
    }

    /// Slots currently holding a placeholder or a handle.
    pub fn occupied(&self) -> usize {
        self.snapshot().iter().filter(|s| !s.is_empty()).count()
    }
}
