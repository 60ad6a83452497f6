//! Single-owner runtime for a relay core.
//!
//! One task owns the core and serialises everything that touches it:
//! application commands arrive over an mpsc channel, periodic triggers come
//! from tokio intervals. Replacing the config tears the triggers down and
//! restarts them with the new periods.
//!
//! ```text
//!  RelayHandle::send ──┐
//!  RelayHandle::configure ──┤   ┌──────────────┐
//!  RelayHandle::shutdown ──┼──>│  relay task   │──> TransferSlotPool ──> Transport
//!  drain interval ──────────┤   │ (owns core)   │
//!  liveness timers ─────────┘   └──────────────┘
//! ```

use crate::config::{Config, PartialConfig};
use crate::dispatch::Dispatch;
use crate::drain::DrainOutcome;
use crate::error::{RelayError, Result};
use crate::relay::{encode_value, BufferingRelay, TransientRelay};
use bytes::Bytes;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, Interval, MissedTickBehavior, Sleep};

/// Channel size for application commands
pub const COMMAND_CHANNEL_SIZE: usize = 256;

/// Why a relay task stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// `shutdown()` was requested
    Shutdown,
    /// Every handle was dropped
    HandlesDropped,
    /// Liveness restart period elapsed (buffering endpoint); the host should
    /// start a fresh relay
    AutoReset,
    /// Yield deadline elapsed (transient endpoint)
    Yield,
}

enum Command {
    Send {
        payload: Bytes,
        reply: oneshot::Sender<Result<Dispatch>>,
    },
    Configure {
        overrides: PartialConfig,
        reply: oneshot::Sender<Result<Config>>,
    },
    Shutdown {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Application-facing handle to a running relay. Cheap to clone.
#[derive(Clone)]
pub struct RelayHandle {
    tx: mpsc::Sender<Command>,
}

impl RelayHandle {
    /// Route a payload: send now, or store for later.
    pub async fn send(&self, payload: impl Into<Bytes>) -> Result<Dispatch> {
        let (reply, rx) = oneshot::channel();
        self.request(
            Command::Send {
                payload: payload.into(),
                reply,
            },
            rx,
        )
        .await
    }

    /// Encode a value as JSON and send it.
    pub async fn send_value<T: Serialize>(&self, value: &T) -> Result<Dispatch> {
        let payload = encode_value(value)?;
        self.send(payload).await
    }

    /// Merge an override into the config, persist it and reschedule the
    /// periodic triggers. Returns the config now in force.
    pub async fn configure(&self, overrides: PartialConfig) -> Result<Config> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Configure { overrides, reply }, rx)
            .await
    }

    /// Persist state and stop the relay task.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Shutdown { reply }, rx).await
    }

    async fn request<T>(&self, command: Command, rx: oneshot::Receiver<Result<T>>) -> Result<T> {
        self.tx.send(command).await.map_err(|_| RelayError::Closed)?;
        rx.await.map_err(|_| RelayError::Closed)?
    }
}

fn periodic(period: time::Duration) -> Interval {
    // First fire one full period from now, like a plain repeating timer
    let mut interval = time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn deadline(sleep: &mut Option<Pin<Box<Sleep>>>) {
    match sleep {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

/// Periodic triggers for the buffering endpoint.
struct BufferingSchedule {
    drain: Interval,
    reset: Option<Interval>,
}

impl BufferingSchedule {
    fn new(config: &Config) -> Self {
        let reset = config
            .watch_reset_enabled
            .then(|| periodic(config.auto_reset_period()));
        tracing::debug!(
            drain_ms = config.file_transmission_frequency,
            reset_minutes = reset.as_ref().map(|_| config.auto_reset_minutes),
            "Scheduled buffering triggers"
        );
        Self {
            drain: periodic(config.drain_period()),
            reset,
        }
    }
}

/// Periodic triggers for the transient endpoint.
struct TransientSchedule {
    awaken: Option<Interval>,
    exit: Option<Pin<Box<Sleep>>>,
}

impl TransientSchedule {
    fn new(config: &Config) -> Self {
        tracing::debug!(
            awaken = config.awaken_enabled,
            exit = config.exit_enabled,
            "Scheduled transient triggers"
        );
        Self {
            awaken: config
                .awaken_enabled
                .then(|| periodic(config.awaken_period())),
            exit: config
                .exit_enabled
                .then(|| Box::pin(time::sleep(config.exit_after()))),
        }
    }
}

/// Start a buffering relay on the current Tokio runtime.
pub fn spawn_buffering(relay: BufferingRelay) -> (RelayHandle, JoinHandle<Result<Exit>>) {
    spawn(run_buffering, relay)
}

/// Start a transient relay on the current Tokio runtime.
pub fn spawn_transient(relay: TransientRelay) -> (RelayHandle, JoinHandle<Result<Exit>>) {
    spawn(run_transient, relay)
}

fn spawn<R, F, Fut>(run: F, relay: R) -> (RelayHandle, JoinHandle<Result<Exit>>)
where
    R: Send + 'static,
    F: FnOnce(R, mpsc::Receiver<Command>) -> Fut,
    Fut: Future<Output = Result<Exit>> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
    let task = tokio::spawn(run(relay, rx));
    (RelayHandle { tx }, task)
}

async fn run_buffering(mut relay: BufferingRelay, mut rx: mpsc::Receiver<Command>) -> Result<Exit> {
    let mut schedule = BufferingSchedule::new(relay.config());

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(Command::Send { payload, reply }) => {
                    let _ = reply.send(relay.send(payload));
                }
                Some(Command::Configure { overrides, reply }) => {
                    let result = relay.configure(&overrides).cloned();
                    if result.is_ok() {
                        schedule = BufferingSchedule::new(relay.config());
                    }
                    let _ = reply.send(result);
                }
                Some(Command::Shutdown { reply }) => {
                    let _ = reply.send(relay.shutdown());
                    return Ok(Exit::Shutdown);
                }
                None => {
                    relay.shutdown()?;
                    return Ok(Exit::HandlesDropped);
                }
            },
            _ = schedule.drain.tick() => match relay.drain_tick() {
                Ok(DrainOutcome::Drained { address, slot }) => {
                    tracing::trace!(address = %address, slot, "Drain tick");
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "Drain tick failed"),
            },
            _ = next_tick(&mut schedule.reset) => {
                tracing::info!(
                    minutes = relay.config().auto_reset_minutes,
                    "Auto-reset period elapsed"
                );
                relay.shutdown()?;
                return Ok(Exit::AutoReset);
            }
        }
    }
}

async fn run_transient(mut relay: TransientRelay, mut rx: mpsc::Receiver<Command>) -> Result<Exit> {
    let mut schedule = TransientSchedule::new(relay.config());

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(Command::Send { payload, reply }) => {
                    let _ = reply.send(relay.send(payload));
                }
                Some(Command::Configure { overrides, reply }) => {
                    let result = relay.configure(&overrides).cloned();
                    if result.is_ok() {
                        schedule = TransientSchedule::new(relay.config());
                    }
                    let _ = reply.send(result);
                }
                Some(Command::Shutdown { reply }) => {
                    let _ = reply.send(Ok(()));
                    return Ok(Exit::Shutdown);
                }
                None => return Ok(Exit::HandlesDropped),
            },
            _ = next_tick(&mut schedule.awaken) => relay.awaken().await,
            _ = deadline(&mut schedule.exit) => {
                tracing::info!(
                    minutes = relay.config().exit_every_minutes,
                    "Yield deadline elapsed"
                );
                return Ok(Exit::Yield);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::store::{DirStore, DurableStore};
    use crate::transport::{ConnectionState, SimTransport};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn buffering(tmp: &TempDir, transport: &SimTransport) -> BufferingRelay {
        let store: Arc<dyn DurableStore> = Arc::new(DirStore::open(tmp.path()).unwrap());
        BufferingRelay::open(store, Arc::new(transport.clone())).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_runs_on_schedule() {
        let tmp = TempDir::new().unwrap();
        let transport = SimTransport::new(ConnectionState::Closed);
        let (handle, task) = spawn_buffering(buffering(&tmp, &transport));

        handle.send(&b"a"[..]).await.unwrap();
        handle.send(&b"b"[..]).await.unwrap();
        transport.set_connection(ConnectionState::Open);

        // One payload per 2s tick
        time::sleep(Duration::from_millis(2100)).await;
        assert_eq!(transport.transfers().len(), 1);
        time::sleep(Duration::from_millis(2000)).await;
        assert_eq!(transport.transfers().len(), 2);

        handle.shutdown().await.unwrap();
        assert_eq!(task.await.unwrap().unwrap(), Exit::Shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_configure_reschedules_drain() {
        let tmp = TempDir::new().unwrap();
        let transport = SimTransport::new(ConnectionState::Closed);
        let (handle, task) = spawn_buffering(buffering(&tmp, &transport));

        for body in ["a", "b", "c"] {
            handle.send(body).await.unwrap();
        }
        let config = handle
            .configure(PartialConfig {
                file_transmission_frequency: Some(100),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(config.file_transmission_frequency, 100);
        transport.set_connection(ConnectionState::Open);

        time::sleep(Duration::from_millis(350)).await;
        assert_eq!(transport.transfers().len(), 3);

        handle.shutdown().await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_reset_persists_and_exits() {
        let tmp = TempDir::new().unwrap();
        let transport = SimTransport::new(ConnectionState::Closed);
        let (handle, task) = spawn_buffering(buffering(&tmp, &transport));

        let outcome = handle.send("kept").await.unwrap();
        assert_eq!(
            outcome,
            Dispatch::Stored {
                address: Address::new(1)
            }
        );

        time::sleep(Duration::from_secs(5 * 60 + 1)).await;
        assert_eq!(task.await.unwrap().unwrap(), Exit::AutoReset);
        assert!(matches!(handle.send("late").await, Err(RelayError::Closed)));

        // A fresh relay picks up the persisted backlog
        let relay = buffering(&tmp, &transport);
        assert_eq!(relay.queue().to_vec(), vec![Address::new(1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_reset_can_be_disabled() {
        let tmp = TempDir::new().unwrap();
        let transport = SimTransport::new(ConnectionState::Closed);
        let (handle, task) = spawn_buffering(buffering(&tmp, &transport));

        handle
            .configure(PartialConfig {
                watch_reset_enabled: Some(false),
                ..Default::default()
            })
            .await
            .unwrap();
        time::sleep(Duration::from_secs(20 * 60)).await;
        assert!(!task.is_finished());

        drop(handle);
        assert_eq!(task.await.unwrap().unwrap(), Exit::HandlesDropped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_pings_then_yields() {
        let tmp = TempDir::new().unwrap();
        let store: Arc<dyn DurableStore> = Arc::new(DirStore::open(tmp.path()).unwrap());
        let transport = SimTransport::new(ConnectionState::Open);
        let relay = TransientRelay::open(store, Arc::new(transport.clone())).unwrap();
        let (handle, task) = spawn_transient(relay);

        let outcome = handle.send("now").await.unwrap();
        assert_eq!(outcome, Dispatch::Sent { slot: 0 });

        // Pings every minute; the fifth may race the yield at 5 minutes
        assert_eq!(task.await.unwrap().unwrap(), Exit::Yield);
        assert!((4..=5).contains(&transport.pings()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_configure_restarts_exit_deadline() {
        let tmp = TempDir::new().unwrap();
        let store: Arc<dyn DurableStore> = Arc::new(DirStore::open(tmp.path()).unwrap());
        let transport = SimTransport::new(ConnectionState::Open);
        let relay = TransientRelay::open(store, Arc::new(transport.clone())).unwrap();
        let (handle, task) = spawn_transient(relay);

        time::sleep(Duration::from_secs(4 * 60)).await;
        handle
            .configure(PartialConfig {
                exit_every_minutes: Some(2),
                awaken_enabled: Some(false),
                ..Default::default()
            })
            .await
            .unwrap();

        let started = Instant::now();
        assert_eq!(task.await.unwrap().unwrap(), Exit::Yield);
        assert!(started.elapsed() >= Duration::from_secs(2 * 60));
    }
}
