use std::sync::Arc;

use parking_lot::RwLock;

use crate::queue::Queue;

type Slot = RwLock<Option<Arc<Queue>>>;

/// Fixed table of queue slots for one virtualization use case.
pub(crate) struct VirtContext {
    slots: Vec<Slot>,
}

impl VirtContext {
    pub(crate) fn new(queues: u32) -> Self {
        Self {
            slots: (0..queues).map(|_| RwLock::new(None)).collect(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn slot(&self, index: u32) -> Option<&Slot> {
        self.slots.get(index as usize)
    }

    /// Live queue at `index`, if initialized.
    pub(crate) fn queue(&self, index: u32) -> Option<Arc<Queue>> {
        self.slot(index).and_then(|slot| slot.read().clone())
    }

    pub(crate) fn is_valid(&self, index: u32) -> bool {
        self.slot(index).is_some_and(|slot| slot.read().is_some())
    }

    /// Takes every live queue out of the table.
    pub(crate) fn drain(&self) -> Vec<Arc<Queue>> {
        self.slots
            .iter()
            .filter_map(|slot| slot.write().take())
            .collect()
    }
}
