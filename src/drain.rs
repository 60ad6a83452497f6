//! Moves stored payloads back onto the transport, one per tick.

use crate::address::{Address, Endpoint};
use crate::error::Result;
use crate::pool::TransferSlotPool;
use crate::queue::PersistentQueue;
use crate::store::DurableStore;
use crate::transport::Transport;
use bytes::Bytes;
use std::sync::Arc;

/// What a single drain tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Link not open, queue untouched
    Disconnected,
    /// Nothing queued
    Idle,
    /// Payload handed to the pool and its file deleted
    Drained { address: Address, slot: usize },
    /// Queue entry had no backing file; entry dropped
    Missing { address: Address },
}

pub struct DrainLoop {
    endpoint: Endpoint,
    store: Arc<dyn DurableStore>,
    transport: Arc<dyn Transport>,
    pool: TransferSlotPool,
}

impl DrainLoop {
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

    /// Drain at most one payload. The rate limit is the whole point: together
    /// with the slot pool it is the only backpressure on the transport.
    pub fn tick(&self, queue: &mut PersistentQueue) -> Result<DrainOutcome> {
        if !self.transport.connection_state().is_open() {
            return Ok(DrainOutcome::Disconnected);
        }

        let Some(address) = queue.front() else {
            return Ok(DrainOutcome::Idle);
        };

        // The entry leaves the queue only once its file is gone, so a failed
        // read or delete leaves it in place for the next tick
        let name = self.endpoint.payload_name(address);
        let outcome = match self.store.read(&name)? {
            Some(bytes) => {
                self.store.delete(&name)?;
                queue.pop_front();
                let submission = self.pool.submit(Bytes::from(bytes));
                tracing::debug!(
                    address = %address,
                    slot = submission.slot(),
                    remaining = queue.len(),
                    "Drained payload"
                );
                DrainOutcome::Drained {
                    address,
                    slot: submission.slot(),
                }
            }
            None => {
                queue.pop_front();
                tracing::warn!(file = %name, "Queued payload has no backing file, skipping");
                DrainOutcome::Missing { address }
            }
        };

        queue.persist()?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::QUEUE_KEY;
    use crate::store::faulty::FaultyStore;
    use crate::store::DirStore;
    use crate::transport::{ConnectionState, SimTransport};
    use tempfile::TempDir;

    fn setup(
        tmp: &TempDir,
        connection: ConnectionState,
    ) -> (Arc<dyn DurableStore>, SimTransport, PersistentQueue, DrainLoop) {
        let store: Arc<dyn DurableStore> = Arc::new(DirStore::open(tmp.path()).unwrap());
        let transport = SimTransport::new(connection);
        let transport_ptr: Arc<dyn Transport> = Arc::new(transport.clone());
        let pool = TransferSlotPool::new(Endpoint::Buffering, transport_ptr.clone());
        let queue = PersistentQueue::load(store.clone(), Endpoint::Buffering, 10).unwrap();
        let drain = DrainLoop::new(Endpoint::Buffering, store.clone(), transport_ptr, pool);
        (store, transport, queue, drain)
    }

    fn enqueue(store: &Arc<dyn DurableStore>, queue: &mut PersistentQueue, n: u32, body: &[u8]) {
        let address = Address::new(n);
        store
            .write(&Endpoint::Buffering.payload_name(address), body)
            .unwrap();
        queue.insert(address).unwrap();
    }

    #[tokio::test]
    async fn test_disconnected_is_noop() {
        let tmp = TempDir::new().unwrap();
        let (store, _transport, mut queue, drain) = setup(&tmp, ConnectionState::Closed);
        enqueue(&store, &mut queue, 1, b"a");

        assert_eq!(drain.tick(&mut queue).unwrap(), DrainOutcome::Disconnected);
        assert_eq!(queue.len(), 1);
        assert!(store.exists("delivert_watch_0001").unwrap());
    }

    #[tokio::test]
    async fn test_empty_queue_is_idle() {
        let tmp = TempDir::new().unwrap();
        let (_store, _transport, mut queue, drain) = setup(&tmp, ConnectionState::Open);
        assert_eq!(drain.tick(&mut queue).unwrap(), DrainOutcome::Idle);
    }

    #[tokio::test]
    async fn test_drains_one_per_tick_in_order() {
        let tmp = TempDir::new().unwrap();
        let (store, transport, mut queue, drain) = setup(&tmp, ConnectionState::Open);
        enqueue(&store, &mut queue, 1, b"a");
        enqueue(&store, &mut queue, 2, b"b");

        let outcome = drain.tick(&mut queue).unwrap();
        assert_eq!(
            outcome,
            DrainOutcome::Drained {
                address: Address::new(1),
                slot: 0
            }
        );
        assert_eq!(queue.to_vec(), vec![Address::new(2)]);
        assert!(!store.exists("delivert_watch_0001").unwrap());
        assert!(store.exists("delivert_watch_0002").unwrap());

        // Shorter queue was persisted
        assert_eq!(store.read(QUEUE_KEY).unwrap(), Some(br#"["0002"]"#.to_vec()));

        drain.tick(&mut queue).unwrap();
        assert!(queue.is_empty());

        // Let the spawned enqueues run
        for _ in 0..10 {
            if transport.transfers().len() == 2 {
                break;
            }
            tokio::task::yield_now().await;
        }
        let payloads: Vec<_> = transport
            .transfers()
            .iter()
            .map(|t| t.payload().clone())
            .collect();
        assert_eq!(payloads, vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);
    }

    fn setup_faulty(
        tmp: &TempDir,
    ) -> (Arc<FaultyStore>, SimTransport, PersistentQueue, DrainLoop) {
        let faulty = Arc::new(FaultyStore::new(DirStore::open(tmp.path()).unwrap()));
        let store: Arc<dyn DurableStore> = faulty.clone();
        let transport = SimTransport::new(ConnectionState::Open);
        let transport_ptr: Arc<dyn Transport> = Arc::new(transport.clone());
        let pool = TransferSlotPool::new(Endpoint::Buffering, transport_ptr.clone());
        let mut queue = PersistentQueue::load(store.clone(), Endpoint::Buffering, 10).unwrap();
        enqueue(&store, &mut queue, 1, b"a");
        let drain = DrainLoop::new(Endpoint::Buffering, store, transport_ptr, pool);
        (faulty, transport, queue, drain)
    }

    async fn settle(transport: &SimTransport, expected: usize) {
        for _ in 0..10 {
            if transport.transfers().len() >= expected {
                break;
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_failed_read_keeps_entry_for_next_tick() {
        let tmp = TempDir::new().unwrap();
        let (faulty, transport, mut queue, drain) = setup_faulty(&tmp);
        faulty.fail_read("delivert_watch_0001");

        assert!(drain.tick(&mut queue).is_err());
        assert_eq!(queue.to_vec(), vec![Address::new(1)]);
        assert!(faulty.exists("delivert_watch_0001").unwrap());

        assert_eq!(
            drain.tick(&mut queue).unwrap(),
            DrainOutcome::Drained {
                address: Address::new(1),
                slot: 0
            }
        );
        assert!(queue.is_empty());
        assert!(!faulty.exists("delivert_watch_0001").unwrap());

        settle(&transport, 1).await;
        assert_eq!(transport.transfers().len(), 1);
        assert_eq!(transport.transfers()[0].payload(), &Bytes::from_static(b"a"));
    }

    #[tokio::test]
    async fn test_failed_delete_sends_nothing_and_retries() {
        let tmp = TempDir::new().unwrap();
        let (faulty, transport, mut queue, drain) = setup_faulty(&tmp);
        faulty.fail_delete("delivert_watch_0001");

        assert!(drain.tick(&mut queue).is_err());
        assert_eq!(queue.to_vec(), vec![Address::new(1)]);
        settle(&transport, 1).await;
        assert!(transport.transfers().is_empty());

        assert!(matches!(
            drain.tick(&mut queue).unwrap(),
            DrainOutcome::Drained { .. }
        ));
        settle(&transport, 1).await;
        // Sent exactly once despite the retry
        assert_eq!(transport.transfers().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_file_is_skipped() {
        let tmp = TempDir::new().unwrap();
        let (store, transport, mut queue, drain) = setup(&tmp, ConnectionState::Open);
        queue.insert(Address::new(9)).unwrap();

        assert_eq!(
            drain.tick(&mut queue).unwrap(),
            DrainOutcome::Missing {
                address: Address::new(9)
            }
        );
        assert!(queue.is_empty());
        assert_eq!(store.read(QUEUE_KEY).unwrap(), Some(b"[]".to_vec()));
        assert!(transport.transfers().is_empty());
    }
}
