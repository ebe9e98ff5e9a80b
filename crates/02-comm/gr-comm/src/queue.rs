//! One ordered logical channel: element pool, pending FIFO and the three
//! independent lock domains (lists, request/response pairing, OOB).

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{debug, error, warn};
use parking_lot::Mutex;
use transport::{LinkState, PeerId, RingChannel};

use crate::element::{Element, ElementSlab, Message};
use crate::error::{CommError, CommResult};
use crate::oob::MempoolBinding;
use crate::ring::RingBinding;
use crate::semaphore::{Acquire, Semaphore};

/// Element accounting for one queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueStats {
    pub payload_size: usize,
    pub allocated: usize,
    pub free: usize,
    pub pending: usize,
    pub checked_out: usize,
}

struct Lists {
    free: VecDeque<Element>,
    pending: VecDeque<Element>,
    slab: ElementSlab,
    closed: bool,
}

pub(crate) struct Queue {
    context: usize,
    index: u32,
    this: Weak<Queue>,
    lists: Mutex<Lists>,
    sem: Semaphore,
    pairing: Mutex<()>,
    oob: Arc<Mutex<()>>,
    ring: Option<RingBinding>,
    mempool: Option<MempoolBinding>,
}

impl Queue {
    /// Builds a queue around preallocated payload buffers.
    pub(crate) fn assemble(
        context: usize,
        index: u32,
        slab: ElementSlab,
        buffers: Vec<Box<[u8]>>,
        ring: Option<RingBinding>,
        mempool: Option<MempoolBinding>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| {
            let free = buffers
                .into_iter()
                .map(|payload| Element::new(this.clone(), payload))
                .collect();
            Self {
                context,
                index,
                this: this.clone(),
                lists: Mutex::new(Lists {
                    free,
                    pending: VecDeque::new(),
                    slab,
                    closed: false,
                }),
                sem: Semaphore::default(),
                pairing: Mutex::new(()),
                oob: Arc::new(Mutex::new(())),
                ring,
                mempool,
            }
        })
    }

    pub(crate) fn index(&self) -> u32 {
        self.index
    }

    pub(crate) fn payload_size(&self) -> usize {
        self.lists.lock().slab.elem_size()
    }

    pub(crate) fn ring(&self) -> Option<&RingBinding> {
        self.ring.as_ref()
    }

    pub(crate) fn mempool(&self) -> Option<&MempoolBinding> {
        self.mempool.as_ref()
    }

    pub(crate) fn pairing(&self) -> &Mutex<()> {
        &self.pairing
    }

    pub(crate) fn oob_lock(&self) -> &Arc<Mutex<()>> {
        &self.oob
    }

    fn not_initialized(&self) -> CommError {
        CommError::NotInitialized { queue: self.index }
    }

    /// Moves a free element to the pending tail after `fill` succeeds.
    ///
    /// On failure the element goes back to the free list untouched, so it is
    /// never left between lists.
    fn enqueue_with(
        &self,
        sender: PeerId,
        fill: impl FnOnce(&mut [u8]) -> CommResult<()>,
    ) -> CommResult<()> {
        {
            let mut lists = self.lists.lock();
            if lists.closed {
                return Err(self.not_initialized());
            }
            let mut element = match lists.free.pop_front() {
                Some(element) => element,
                None => Element::new(self.this.clone(), lists.slab.allocate()?),
            };
            if let Err(err) = fill(element.payload_mut()) {
                lists.free.push_back(element);
                return Err(err);
            }
            element.set_sender(sender);
            lists.pending.push_back(element);
        }
        self.sem.post();
        Ok(())
    }

    /// Copies `data` into the prefix of a fresh element.
    pub(crate) fn enqueue_local(&self, data: &[u8], sender: PeerId) -> CommResult<()> {
        self.enqueue_with(sender, |payload| {
            let Some(prefix) = payload.get_mut(..data.len()) else {
                return Err(CommError::config(format!(
                    "{}-byte message exceeds {}-byte payload",
                    data.len(),
                    payload.len()
                )));
            };
            prefix.copy_from_slice(data);
            Ok(())
        })
    }

    /// Reads exactly one payload from `channel`.
    pub(crate) fn enqueue_from_channel(&self, channel: &dyn RingChannel) -> CommResult<()> {
        self.enqueue_with(channel.peer_id(), |payload| {
            let read = channel.read(payload)?;
            if read < payload.len() {
                return Err(CommError::ShortRead {
                    expected: payload.len(),
                    actual: read,
                });
            }
            Ok(())
        })
    }

    /// Pops the pending head, waiting up to `timeout` for one to arrive.
    pub(crate) fn dequeue(&self, timeout: Duration) -> CommResult<Message> {
        match self.sem.acquire(timeout) {
            Acquire::Permit => {}
            Acquire::TimedOut => return Err(CommError::Timeout(timeout)),
            Acquire::Closed => return Err(self.not_initialized()),
        }
        let mut lists = self.lists.lock();
        if lists.closed {
            return Err(self.not_initialized());
        }
        lists
            .pending
            .pop_front()
            .map(Message::new)
            .ok_or_else(|| self.not_initialized())
    }

    /// Returns an element to the free tail. Contents are kept.
    pub(crate) fn release(&self, element: Element) {
        let mut lists = self.lists.lock();
        if lists.closed {
            lists.slab.reclaim(1);
            return;
        }
        lists.free.push_back(element);
    }

    pub(crate) fn stats(&self) -> QueueStats {
        let lists = self.lists.lock();
        let allocated = lists.slab.allocated();
        let free = lists.free.len();
        let pending = lists.pending.len();
        QueueStats {
            payload_size: lists.slab.elem_size(),
            allocated,
            free,
            pending,
            checked_out: allocated.saturating_sub(free + pending),
        }
    }

    /// Deferred half of the channel interrupt.
    pub(crate) fn deliver(&self) {
        let Some(ring) = &self.ring else {
            return;
        };
        let channel = ring.channel();
        if channel.notified() != LinkState::Established {
            return;
        }
        while channel.can_read() {
            if let Err(err) = self.enqueue_from_channel(channel.as_ref()) {
                error!(
                    "queue {}/{}: drain aborted: {err}",
                    self.context, self.index
                );
                break;
            }
        }
        if channel.can_write() {
            ring.wake_writers();
        }
    }

    /// Starts interrupt delivery for the bound channel, if any.
    pub(crate) fn arm(&self) -> CommResult<()> {
        match &self.ring {
            Some(ring) => ring.arm(self.context, self.index, self.this.clone()),
            None => Ok(()),
        }
    }

    /// Disarms and unreserves the backends, then frees the pool.
    ///
    /// Must not be called from the queue's own drain thread.
    pub(crate) fn shutdown(&self) {
        if let Some(ring) = &self.ring {
            ring.release();
        }
        if let Some(mempool) = &self.mempool {
            mempool.release();
        }
        self.sem.close();

        let mut lists = self.lists.lock();
        lists.closed = true;
        let reclaimed = lists.free.len() + lists.pending.len();
        lists.free.clear();
        lists.pending.clear();
        lists.slab.reclaim(reclaimed);
        let outstanding = lists.slab.allocated();
        if outstanding > 0 {
            warn!(
                "queue {}/{} torn down with {outstanding} messages still checked out",
                self.context, self.index
            );
        }
        debug!(
            "queue {}/{} shut down, {reclaimed} elements reclaimed",
            self.context, self.index
        );
    }
}

#[cfg(test)]
pub(crate) fn loopback_queue(payload_size: usize, elems: usize) -> Arc<Queue> {
    let mut slab = ElementSlab::new(payload_size);
    let buffers = slab.preallocate(elems).expect("preallocate");
    Queue::assemble(0, 0, slab, buffers, None, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::collection;
    use proptest::prelude::*;

    const SHORT: Duration = Duration::from_millis(20);

    #[test]
    fn loopback_message_keeps_sender_and_bytes() {
        let queue = loopback_queue(16, 2);
        queue
            .enqueue_local(b"hello", PeerId::SELF)
            .expect("enqueue");
        let message = queue.dequeue(SHORT).expect("dequeue");
        assert_eq!(message.sender(), PeerId::SELF);
        assert_eq!(&message[..5], b"hello");
        assert_eq!(message.len(), 16);
    }

    #[test]
    fn oversize_local_message_is_rejected_and_element_kept() {
        let queue = loopback_queue(4, 1);
        let err = queue
            .enqueue_local(&[0u8; 5], PeerId::SELF)
            .expect_err("oversize");
        assert!(matches!(err, CommError::Configuration(_)));
        let stats = queue.stats();
        assert_eq!(stats.free, 1);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.allocated, 1);
    }

    #[test]
    fn empty_queue_times_out() {
        let queue = loopback_queue(8, 1);
        assert!(matches!(queue.dequeue(SHORT), Err(CommError::Timeout(_))));
    }

    #[test]
    fn slab_grows_when_free_list_is_empty() {
        let queue = loopback_queue(8, 1);
        for byte in 0..3u8 {
            queue.enqueue_local(&[byte], PeerId(1)).expect("enqueue");
        }
        let stats = queue.stats();
        assert_eq!(stats.allocated, 3);
        assert_eq!(stats.pending, 3);
        assert_eq!(stats.free, 0);
    }

    #[test]
    fn steady_state_cycles_do_not_grow_the_slab() {
        let queue = loopback_queue(32, 2);
        for round in 0..100u8 {
            queue.enqueue_local(&[round], PeerId::SELF).expect("enqueue");
            let message = queue.dequeue(SHORT).expect("dequeue");
            assert_eq!(message[0], round);
            message.release();
        }
        let stats = queue.stats();
        assert_eq!(stats.allocated, 2);
        assert_eq!(stats.free, 2);
        assert_eq!(stats.checked_out, 0);
    }

    #[test]
    fn checked_out_messages_are_counted() {
        let queue = loopback_queue(8, 2);
        queue.enqueue_local(&[1], PeerId::SELF).expect("enqueue");
        let held = queue.dequeue(SHORT).expect("dequeue");
        assert_eq!(queue.stats().checked_out, 1);
        drop(held);
        assert_eq!(queue.stats().checked_out, 0);
    }

    #[test]
    fn shutdown_reclaims_and_fails_later_calls() {
        let queue = loopback_queue(8, 3);
        queue.enqueue_local(&[1], PeerId::SELF).expect("enqueue");
        queue.enqueue_local(&[2], PeerId::SELF).expect("enqueue");
        let held = queue.dequeue(SHORT).expect("dequeue");

        queue.shutdown();
        assert_eq!(queue.stats().allocated, 1);
        assert!(matches!(
            queue.dequeue(SHORT),
            Err(CommError::NotInitialized { queue: 0 })
        ));
        assert!(matches!(
            queue.enqueue_local(&[3], PeerId::SELF),
            Err(CommError::NotInitialized { .. })
        ));

        drop(held);
        assert_eq!(queue.stats().allocated, 0);
    }

    #[test]
    fn blocked_receiver_wakes_on_shutdown() {
        let queue = loopback_queue(8, 1);
        let waiter = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.dequeue(Duration::from_secs(5)))
        };
        std::thread::sleep(Duration::from_millis(20));
        queue.shutdown();
        let result = waiter.join().expect("waiter");
        assert!(matches!(result, Err(CommError::NotInitialized { .. })));
    }

    proptest! {
        /// Whatever mix of producers enqueues, receivers see enqueue order.
        #[test]
        fn pending_list_is_fifo(seq in collection::vec((0u32..4, any::<u8>()), 1..64)) {
            let queue = loopback_queue(4, 4);
            for (producer, byte) in &seq {
                let sender = if *producer == 0 { PeerId::SELF } else { PeerId(*producer) };
                queue.enqueue_local(&[*byte, *producer as u8], sender).expect("enqueue");
            }
            for (producer, byte) in &seq {
                let message = queue.dequeue(Duration::ZERO).expect("dequeue");
                prop_assert_eq!(message[0], *byte);
                prop_assert_eq!(message[1], *producer as u8);
                message.release();
            }
            let stats = queue.stats();
            prop_assert_eq!(stats.free + stats.pending + stats.checked_out, stats.allocated);
            prop_assert!(stats.allocated >= 4);
        }
    }
}
