//! Statically reserved shared regions for bulk out-of-band data.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::channel::{Mempool, MempoolBackend, PeerId};
use crate::region::{MappedMemory, SharedRegion};
use crate::{TransportError, TransportResult};

/// Page alignment used for mempool regions.
pub const MEMPOOL_ALIGN: usize = 4096;

/// One partition's view of a shared region.
#[derive(Debug)]
pub struct MempoolRegion {
    memory: Arc<SharedRegion>,
    base: u64,
    peer: PeerId,
}

impl Mempool for MempoolRegion {
    fn peer_id(&self) -> PeerId {
        self.peer
    }

    fn base(&self) -> u64 {
        self.base
    }

    fn size(&self) -> usize {
        self.memory.len()
    }

    fn map(&self) -> TransportResult<MappedMemory> {
        Ok(MappedMemory::new(Arc::clone(&self.memory)))
    }
}

struct MempoolEntry {
    region: Arc<MempoolRegion>,
    reserved: bool,
}

/// Per-partition table of mempools, keyed by instance number.
pub struct MempoolTable {
    local: PeerId,
    entries: Mutex<HashMap<u32, MempoolEntry>>,
}

impl MempoolTable {
    pub fn new(local: PeerId) -> Self {
        Self {
            local,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn insert(&self, instance: u32, region: MempoolRegion) -> TransportResult<()> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&instance) {
            return Err(TransportError::DuplicateInstance(instance));
        }
        entries.insert(
            instance,
            MempoolEntry {
                region: Arc::new(region),
                reserved: false,
            },
        );
        Ok(())
    }

    /// Allocates a zeroed region of `size` bytes at partition-physical `base`
    /// and registers it on both tables under `instance`.
    pub fn share(
        a: &MempoolTable,
        b: &MempoolTable,
        instance: u32,
        base: u64,
        size: usize,
    ) -> TransportResult<()> {
        let len = size.div_ceil(MEMPOOL_ALIGN) * MEMPOOL_ALIGN;
        let memory = Arc::new(SharedRegion::new_aligned(len, MEMPOOL_ALIGN)?);
        a.insert(
            instance,
            MempoolRegion {
                memory: Arc::clone(&memory),
                base,
                peer: b.local,
            },
        )?;
        b.insert(
            instance,
            MempoolRegion {
                memory,
                base,
                peer: a.local,
            },
        )
    }

    /// Returns true while `instance` is reserved.
    pub fn is_reserved(&self, instance: u32) -> bool {
        self.entries
            .lock()
            .get(&instance)
            .is_some_and(|entry| entry.reserved)
    }
}

impl MempoolBackend for MempoolTable {
    fn reserve(&self, instance: u32) -> TransportResult<Arc<dyn Mempool>> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(&instance)
            .ok_or(TransportError::UnknownInstance(instance))?;
        if entry.reserved {
            return Err(TransportError::AlreadyReserved(instance));
        }
        entry.reserved = true;
        let region: Arc<dyn Mempool> = entry.region.clone();
        Ok(region)
    }

    fn unreserve(&self, instance: u32) -> TransportResult<()> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(&instance)
            .ok_or(TransportError::UnknownInstance(instance))?;
        if !entry.reserved {
            return Err(TransportError::NotReserved(instance));
        }
        entry.reserved = false;
        Ok(())
    }
}
