//! Error handling helpers for the transport crate.
//!
//! The transport layer keeps its error surface small: region allocation,
//! backend reservation bookkeeping and the ring's flow-control outcomes.
//! Callers in the comm layer translate these into their own taxonomy.

use thiserror::Error;

/// Convenience result alias for fallible transport operations.
pub type TransportResult<T, E = TransportError> = Result<T, E>;

/// Errors surfaced by low-level transport helpers and reference backends.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Requested frame count or frame size is below the minimum.
    #[error("capacity {requested} must be at least {minimum}")]
    InvalidCapacity { requested: usize, minimum: usize },

    /// Allocation of a shared region failed for the given size/alignment pair.
    #[error("failed to allocate shared region of {size} bytes aligned to {alignment}")]
    AllocationFailed { size: usize, alignment: usize },

    /// The backend has no channel or region registered under this instance.
    #[error("no instance {0} on this backend")]
    UnknownInstance(u32),

    /// A second channel or region was registered under the same instance.
    #[error("instance {0} is already registered")]
    DuplicateInstance(u32),

    /// The instance is already held by another user.
    #[error("instance {0} is already reserved")]
    AlreadyReserved(u32),

    /// Unreserve was called for an instance that is not held.
    #[error("instance {0} is not reserved")]
    NotReserved(u32),

    /// The channel handshake has not reached the established state.
    #[error("channel is not established")]
    NotEstablished,

    /// Nothing to read, or no free frame to write into.
    #[error("channel would block")]
    WouldBlock,

    /// A write larger than one frame.
    #[error("payload of {len} bytes exceeds the {frame_size}-byte frame")]
    FrameOverflow { len: usize, frame_size: usize },

    /// An interrupt handler is already armed on this channel.
    #[error("interrupt handler already registered")]
    IrqBusy,
}
