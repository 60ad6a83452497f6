//! Store-and-forward relay for payloads crossing an intermittent link.
//!
//! The link's transport only knows how to enqueue a named blob, and stops
//! accepting work after a handful of concurrent transfers. `delivert` sits in
//! front of it:
//!
//! ```text
//! producer --> DispatchController --+--> TransferSlotPool --> Transport
//!                                   |          ^
//!                                   v          |
//!                            PersistentQueue --+-- DrainLoop (periodic)
//! ```
//!
//! - [`address`] : address tokens and the on-disk naming convention
//! - [`store`]   : [`DurableStore`] trait and the directory-backed [`DirStore`]
//! - [`queue`]   : [`PersistentQueue`], the bounded durable FIFO
//! - [`pool`]    : [`TransferSlotPool`], the fixed set of transfer slots
//! - [`dispatch`]: send-now or store-for-later routing
//! - [`drain`]   : moves stored payloads back onto the transport
//! - [`relay`]   : owned endpoint state ([`BufferingRelay`], [`TransientRelay`])
//! - [`runtime`] : single-owner task, periodic triggers, [`RelayHandle`]
//! - [`transport`]: the [`Transport`] trait and [`SimTransport`]

pub mod address;
pub mod config;
pub mod dispatch;
pub mod drain;
pub mod error;
pub mod pool;
pub mod queue;
pub mod relay;
pub mod runtime;
pub mod store;
pub mod transport;

pub use address::{next_address, Address, Endpoint};
pub use config::{Config, ConfigStore, PartialConfig};
pub use dispatch::{scan_backlog, BacklogScan, Dispatch, DispatchController};
pub use drain::{DrainLoop, DrainOutcome};
pub use error::{RelayError, Result};
pub use pool::{SlotStatus, Submission, TransferSlotPool, SLOT_COUNT};
pub use queue::{PersistentQueue, Reconciliation};
pub use relay::{BufferingRelay, TransientRelay};
pub use runtime::{spawn_buffering, spawn_transient, Exit, RelayHandle};
pub use store::{DirStore, DurableStore};
pub use transport::{
    ConnectionState, ReadyState, SimTransport, TransferHandle, TransferHandlePtr, Transport,
};
