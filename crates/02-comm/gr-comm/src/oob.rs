//! Out-of-band bulk data through a queue's mempool.

use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::RawMutex;
use transport::{MappedMemory, Mempool, MempoolBackend, PeerId};

use crate::error::{CommError, CommResult};

pub(crate) struct MempoolBinding {
    backend: Arc<dyn MempoolBackend>,
    instance: u32,
    pool: Arc<dyn Mempool>,
    memory: MappedMemory,
    released: AtomicBool,
}

impl MempoolBinding {
    /// Reserves `instance` and maps it into the local address space.
    pub(crate) fn reserve(backend: Arc<dyn MempoolBackend>, instance: u32) -> CommResult<Self> {
        let pool = backend.reserve(instance)?;
        let memory = match pool.map() {
            Ok(memory) => memory,
            Err(err) => {
                if let Err(unreserve) = backend.unreserve(instance) {
                    warn!("mempool {instance}: unreserve after map failure: {unreserve}");
                }
                return Err(err.into());
            }
        };
        debug!(
            "mempool {instance} reserved: peer {}, base {:#x}, {} bytes",
            pool.peer_id(),
            pool.base(),
            pool.size()
        );
        Ok(Self {
            backend,
            instance,
            pool,
            memory,
            released: AtomicBool::new(false),
        })
    }

    pub(crate) fn peer(&self) -> PeerId {
        self.pool.peer_id()
    }

    pub(crate) fn memory(&self) -> &MappedMemory {
        &self.memory
    }

    pub(crate) fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(err) = self.backend.unreserve(self.instance) {
            warn!("mempool {}: unreserve failed: {err}", self.instance);
        }
    }
}

/// Exclusive access to a queue's mempool, held from `oob_get_ptr` until
/// `oob_put_ptr` (or drop).
///
/// The region is shared with the peer partition; accesses through
/// [`OobRegion::as_ptr`] must follow whatever protocol the two sides agree
/// on.
pub struct OobRegion {
    _guard: ArcMutexGuard<RawMutex, ()>,
    memory: MappedMemory,
    peer: PeerId,
}

impl OobRegion {
    pub(crate) fn new(
        guard: ArcMutexGuard<RawMutex, ()>,
        memory: MappedMemory,
        peer: PeerId,
    ) -> Self {
        Self {
            _guard: guard,
            memory,
            peer,
        }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.memory.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.memory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memory.is_empty()
    }

    /// Partition the region is shared with.
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    fn check_range(&self, offset: usize, len: usize) -> CommResult<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len() => Ok(()),
            _ => Err(CommError::config(format!(
                "range {offset}+{len} outside {}-byte mempool",
                self.len()
            ))),
        }
    }

    /// Copies `data` into the region at `offset`.
    pub fn write_at(&mut self, offset: usize, data: &[u8]) -> CommResult<()> {
        self.check_range(offset, data.len())?;
        // SAFETY: range checked above; the mapping outlives `self`.
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.as_ptr().add(offset), data.len());
        }
        Ok(())
    }

    /// Copies bytes at `offset` out of the region.
    pub fn read_at(&self, offset: usize, out: &mut [u8]) -> CommResult<()> {
        self.check_range(offset, out.len())?;
        // SAFETY: range checked above; the mapping outlives `self`.
        unsafe {
            ptr::copy_nonoverlapping(self.as_ptr().add(offset), out.as_mut_ptr(), out.len());
        }
        Ok(())
    }
}

impl fmt::Debug for OobRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OobRegion")
            .field("peer", &self.peer)
            .field("len", &self.len())
            .finish()
    }
}
