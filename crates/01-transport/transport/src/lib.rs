//! Shared-memory transport primitives for cross-partition messaging.
//!
//! This crate exposes the pieces the comm framework is built on:
//! * [`RingChannel`] / [`RingBackend`] – contract for fixed-frame ring channels towards a peer partition.
//! * [`Mempool`] / [`MempoolBackend`] – contract for statically reserved bulk-data regions.
//! * [`IvcChannel`] / [`IvcBackend`] – in-process ring channels with the IVC reset handshake.
//! * [`MempoolTable`] – in-process mempools shared between two partitions.
//! * [`SharedRegion`] – contiguous, aligned memory backing both.
//! * [`TransportError`] – error surface for allocation, reservation and flow control.

mod channel;
mod error;
mod ivc;
mod mempool;
mod region;

pub use channel::{
    IrqHandler, LinkState, Mempool, MempoolBackend, PeerId, RingBackend, RingChannel,
};
pub use error::{TransportError, TransportResult};
pub use ivc::{ivc_align, IvcBackend, IvcChannel, IvcConfig, IVC_ALIGN};
pub use mempool::{MempoolRegion, MempoolTable, MEMPOOL_ALIGN};
pub use region::{MappedMemory, SharedRegion};
