use std::time::Duration;

use thiserror::Error;
use transport::{PeerId, TransportError};

pub type CommResult<T> = Result<T, CommError>;

#[derive(Debug, Error)]
pub enum CommError {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("queue {queue} of context {context} is already initialized")]
    AlreadyExists { context: usize, queue: u32 },

    #[error("queue {queue} is not initialized")]
    NotInitialized { queue: u32 },

    #[error("peer {requested} is not the channel peer {bound}")]
    PeerMismatch { requested: PeerId, bound: PeerId },

    #[error("out of resources: {0}")]
    ResourceExhausted(&'static str),

    #[error("short channel read: {actual} of {expected} bytes")]
    ShortRead { expected: usize, actual: usize },

    #[error("torn channel write: {actual} of {expected} bytes")]
    TornIo { expected: usize, actual: usize },

    #[error("channel frame of {frame_size} bytes cannot carry {payload_size}-byte payloads")]
    FrameTooSmall {
        frame_size: usize,
        payload_size: usize,
    },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("backend error: {0}")]
    Backend(#[from] TransportError),
}

/// Coarse classification callers branch on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller or deployment bug; not retryable.
    Configuration,
    /// Allocation failure or torn channel I/O.
    ResourceExhausted,
    /// A bounded wait expired; queue state is unaffected.
    Timeout,
    /// Double initialization of a queue index.
    AlreadyExists,
}

impl CommError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        CommError::Configuration(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CommError::Configuration(_)
            | CommError::NotInitialized { .. }
            | CommError::PeerMismatch { .. } => ErrorKind::Configuration,
            CommError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            CommError::ResourceExhausted(_)
            | CommError::ShortRead { .. }
            | CommError::TornIo { .. }
            | CommError::FrameTooSmall { .. } => ErrorKind::ResourceExhausted,
            CommError::Timeout(_) => ErrorKind::Timeout,
            CommError::Backend(err) => match err {
                TransportError::UnknownInstance(_)
                | TransportError::DuplicateInstance(_)
                | TransportError::AlreadyReserved(_)
                | TransportError::NotReserved(_)
                | TransportError::IrqBusy => ErrorKind::Configuration,
                _ => ErrorKind::ResourceExhausted,
            },
        }
    }

    /// Only bounded waits are worth retrying.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy() {
        assert_eq!(
            CommError::Timeout(Duration::from_millis(5)).kind(),
            ErrorKind::Timeout
        );
        assert!(CommError::Timeout(Duration::ZERO).is_retryable());
        assert_eq!(
            CommError::TornIo {
                expected: 8,
                actual: 4
            }
            .kind(),
            ErrorKind::ResourceExhausted
        );
        assert_eq!(
            CommError::from(TransportError::UnknownInstance(2)).kind(),
            ErrorKind::Configuration
        );
        assert_eq!(
            CommError::from(TransportError::WouldBlock).kind(),
            ErrorKind::ResourceExhausted
        );
        assert!(!CommError::AlreadyExists {
            context: 0,
            queue: 1
        }
        .is_retryable());
    }
}
