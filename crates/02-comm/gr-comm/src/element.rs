//! Message slots and the handle callers hold between `recv` and `release`.

use std::fmt;
use std::ops::Deref;
use std::sync::Weak;

use log::trace;
use transport::PeerId;

use crate::error::{CommError, CommResult};
use crate::queue::Queue;

/// One fixed-size message slot.
///
/// The queue back-reference is weak: elements never keep their queue alive,
/// and a slot whose queue is gone is simply freed.
pub(crate) struct Element {
    queue: Weak<Queue>,
    sender: PeerId,
    payload: Box<[u8]>,
}

impl Element {
    pub(crate) fn new(queue: Weak<Queue>, payload: Box<[u8]>) -> Self {
        Self {
            queue,
            sender: PeerId::SELF,
            payload,
        }
    }

    pub(crate) fn sender(&self) -> PeerId {
        self.sender
    }

    pub(crate) fn set_sender(&mut self, sender: PeerId) {
        self.sender = sender;
    }

    pub(crate) fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub(crate) fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.payload
    }
}

/// Allocation accounting for one queue's elements.
///
/// Payload buffers are reserved fallibly so exhaustion surfaces as an error
/// instead of aborting. Elements are recycled through the queue's lists and
/// only given back here when the queue is torn down.
pub(crate) struct ElementSlab {
    elem_size: usize,
    allocated: usize,
}

impl ElementSlab {
    pub(crate) fn new(elem_size: usize) -> Self {
        Self {
            elem_size,
            allocated: 0,
        }
    }

    pub(crate) fn elem_size(&self) -> usize {
        self.elem_size
    }

    pub(crate) fn allocated(&self) -> usize {
        self.allocated
    }

    pub(crate) fn allocate(&mut self) -> CommResult<Box<[u8]>> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(self.elem_size)
            .map_err(|_| CommError::ResourceExhausted("element payload"))?;
        buf.resize(self.elem_size, 0);
        self.allocated += 1;
        trace!(
            "slab grew to {} elements of {} bytes",
            self.allocated,
            self.elem_size
        );
        Ok(buf.into_boxed_slice())
    }

    /// Allocates `count` payload buffers up front.
    pub(crate) fn preallocate(&mut self, count: usize) -> CommResult<Vec<Box<[u8]>>> {
        let mut buffers = Vec::new();
        buffers
            .try_reserve_exact(count)
            .map_err(|_| CommError::ResourceExhausted("element table"))?;
        for _ in 0..count {
            buffers.push(self.allocate()?);
        }
        Ok(buffers)
    }

    pub(crate) fn reclaim(&mut self, count: usize) {
        self.allocated = self.allocated.saturating_sub(count);
    }
}

/// A received message, checked out of its queue.
///
/// Dereferences to the full fixed-size payload. Dropping the handle (or
/// passing it to [`Message::release`]) returns the slot to the queue's free
/// list; its contents are not cleared.
pub struct Message {
    element: Option<Element>,
}

impl Message {
    pub(crate) fn new(element: Element) -> Self {
        Self {
            element: Some(element),
        }
    }

    /// Partition that produced the message; [`PeerId::SELF`] for loopback.
    pub fn sender(&self) -> PeerId {
        self.element
            .as_ref()
            .map_or(PeerId::SELF, Element::sender)
    }

    /// Payload bytes.
    pub fn data(&self) -> &[u8] {
        self.element.as_ref().map_or(&[], Element::payload)
    }

    /// Returns the slot to its queue.
    pub fn release(self) {}
}

impl Deref for Message {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data()
    }
}

impl Drop for Message {
    fn drop(&mut self) {
        if let Some(element) = self.element.take() {
            if let Some(queue) = element.queue.upgrade() {
                queue.release(element);
            }
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("sender", &self.sender())
            .field("len", &self.data().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slab_counts_allocations() {
        let mut slab = ElementSlab::new(32);
        let buffers = slab.preallocate(4).expect("preallocate");
        assert_eq!(buffers.len(), 4);
        assert!(buffers.iter().all(|b| b.len() == 32));
        assert_eq!(slab.allocated(), 4);
        slab.allocate().expect("grow");
        assert_eq!(slab.allocated(), 5);
        slab.reclaim(5);
        assert_eq!(slab.allocated(), 0);
    }

    #[test]
    fn orphaned_message_frees_its_slot() {
        let mut slab = ElementSlab::new(8);
        let mut element = Element::new(Weak::new(), slab.allocate().expect("alloc"));
        element.set_sender(PeerId(4));
        element.payload_mut()[0] = 9;
        let message = Message::new(element);
        assert_eq!(message.sender(), PeerId(4));
        assert_eq!(message[0], 9);
        assert_eq!(message.len(), 8);
        message.release();
    }
}
