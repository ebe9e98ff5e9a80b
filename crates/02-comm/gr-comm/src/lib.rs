//! Cross-partition messaging framework.
//!
//! A [`CommFramework`] multiplexes independent, ordered, fixed-payload
//! queues over shared-memory ring channels towards a peer partition, with an
//! optional shared mempool per queue for bulk out-of-band data.
//!
//! * [`CommFramework::send`] – fire-and-forget; [`PeerId::SELF`] loops back.
//! * [`CommFramework::recv`] – bounded blocking receive of the oldest message.
//! * [`CommFramework::sendrecv`] – serialized request/response on one queue.
//! * [`CommFramework::oob_get_ptr`] / [`CommFramework::oob_put_ptr`] –
//!   exclusive mempool access.
//!
//! Ring channels and mempools are reserved from the backends registered in
//! [`Backends`] according to the per-queue bindings in [`CommConfig`].

mod config;
mod context;
mod element;
mod error;
mod framework;
mod oob;
mod queue;
mod ring;
mod semaphore;


pub use config::{
    BackendRef, Backends, CommConfig, QueueBinding, DEFAULT_CONTEXTS,
    DEFAULT_QUEUES_PER_CONTEXT, DEFAULT_RECV_TIMEOUT_MS, DEFAULT_SEND_TIMEOUT_MS,
};
pub use element::Message;
pub use error::{CommError, CommResult, ErrorKind};
pub use framework::CommFramework;
pub use oob::OobRegion;
pub use queue::QueueStats;
pub use transport::PeerId;
