//! Contracts between the comm framework and its partition backends.
//!
//! A ring channel is a bidirectional, fixed-frame shared-memory ring towards
//! exactly one peer partition. A mempool is a statically reserved shared
//! region used for bulk out-of-band data. Both are looked up by instance
//! number on a backend and must be reserved before use.

use std::fmt;
use std::sync::Arc;

use crate::region::MappedMemory;
use crate::TransportResult;

/// Identity of a partition (virtual machine).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u32);

impl PeerId {
    /// Pseudo-peer addressing the local partition (loopback).
    pub const SELF: PeerId = PeerId(0xFF);

    /// Returns true for the loopback identity.
    pub fn is_self(self) -> bool {
        self == Self::SELF
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_self() {
            f.write_str("self")
        } else {
            write!(f, "vm{}", self.0)
        }
    }
}

/// Fast-path interrupt callback. Must not block.
pub type IrqHandler = Arc<dyn Fn() + Send + Sync>;

/// Connection state reported after servicing a channel notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    /// Both ends completed the reset handshake; frames may flow.
    Established,
    /// A reset handshake is in progress.
    Syncing,
}

/// One reserved end of a shared-memory ring channel.
pub trait RingChannel: Send + Sync {
    /// Partition at the other end of the channel.
    fn peer_id(&self) -> PeerId;

    /// Native frame size in bytes.
    fn frame_size(&self) -> usize;

    /// Returns true if at least one frame is ready to be read.
    fn can_read(&self) -> bool;

    /// Returns true if a frame can be written without blocking.
    fn can_write(&self) -> bool;

    /// Reads the next frame into `buf`, returning the number of bytes copied.
    fn read(&self, buf: &mut [u8]) -> TransportResult<usize>;

    /// Writes `buf` as one frame, returning the number of bytes accepted.
    fn write(&self, buf: &[u8]) -> TransportResult<usize>;

    /// Forces the local end back into the reset handshake.
    fn reset(&self);

    /// Advances the reset handshake after a notification.
    fn notified(&self) -> LinkState;

    /// Arms the channel interrupt.
    fn request_irq(&self, handler: IrqHandler) -> TransportResult<()>;

    /// Disarms the channel interrupt. The handler is dropped.
    fn free_irq(&self);
}

/// Source of ring channels, keyed by instance number.
pub trait RingBackend: Send + Sync {
    /// Takes exclusive ownership of a channel instance.
    fn reserve(&self, instance: u32) -> TransportResult<Arc<dyn RingChannel>>;

    /// Hands a reserved instance back to the backend.
    fn unreserve(&self, instance: u32) -> TransportResult<()>;
}

/// One reserved shared bulk-data region.
pub trait Mempool: Send + Sync {
    /// Partition the region is shared with.
    fn peer_id(&self) -> PeerId;

    /// Partition-physical base address of the region.
    fn base(&self) -> u64;

    /// Size of the region in bytes.
    fn size(&self) -> usize;

    /// Maps the region into the local address space as cached memory.
    fn map(&self) -> TransportResult<MappedMemory>;
}

/// Source of mempools, keyed by instance number.
pub trait MempoolBackend: Send + Sync {
    /// Takes exclusive ownership of a mempool instance.
    fn reserve(&self, instance: u32) -> TransportResult<Arc<dyn Mempool>>;

    /// Hands a reserved instance back to the backend.
    fn unreserve(&self, instance: u32) -> TransportResult<()>;
}
