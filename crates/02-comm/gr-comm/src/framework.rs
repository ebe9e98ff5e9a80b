//! The owned framework object: context table, queue setup/teardown and the
//! public messaging API.

use std::ops::Range;
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;
use transport::PeerId;

use crate::config::{Backends, CommConfig, QueueBinding};
use crate::context::VirtContext;
use crate::element::{ElementSlab, Message};
use crate::error::{CommError, CommResult};
use crate::oob::{MempoolBinding, OobRegion};
use crate::queue::{Queue, QueueStats};
use crate::ring::RingBinding;

/// Cross-partition messaging over ring channels and shared mempools.
///
/// Queues are addressed by `(context, index)`. A queue exists between a
/// successful [`init`](Self::init) covering its index and the matching
/// [`deinit`](Self::deinit). Dropping the framework deinitializes
/// everything still live.
pub struct CommFramework {
    config: CommConfig,
    backends: Backends,
    contexts: Vec<VirtContext>,
    server_peer: Mutex<Option<PeerId>>,
    setup: Mutex<()>,
}

impl CommFramework {
    pub fn new(config: CommConfig, backends: Backends) -> CommResult<Self> {
        config.validate()?;
        let contexts = (0..config.contexts)
            .map(|_| VirtContext::new(config.queues_per_context))
            .collect();
        Ok(Self {
            config,
            backends,
            contexts,
            server_peer: Mutex::new(None),
            setup: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &CommConfig {
        &self.config
    }

    fn context(&self, ctx: usize) -> CommResult<&VirtContext> {
        self.contexts
            .get(ctx)
            .ok_or_else(|| CommError::config(format!("no context {ctx}")))
    }

    fn check_range(&self, context: &VirtContext, queues: &Range<u32>) -> CommResult<()> {
        if queues.is_empty() || queues.end as usize > context.len() {
            return Err(CommError::config(format!(
                "queue range {queues:?} outside 0..{}",
                context.len()
            )));
        }
        Ok(())
    }

    fn queue(&self, ctx: usize, index: u32) -> CommResult<Arc<Queue>> {
        let context = self.context(ctx)?;
        if index as usize >= context.len() {
            return Err(CommError::config(format!(
                "queue {index} outside 0..{}",
                context.len()
            )));
        }
        context
            .queue(index)
            .ok_or(CommError::NotInitialized { queue: index })
    }

    /// Brings up the queues in `queues`, each holding `elems` preallocated
    /// elements of `queue_sizes[i]` bytes.
    ///
    /// Every queue is bound to its configured ring channel (and mempool, if
    /// any). If any queue fails, every reservation made by this call is
    /// released and nothing is published.
    pub fn init(
        &self,
        ctx: usize,
        queues: Range<u32>,
        elems: usize,
        queue_sizes: &[usize],
    ) -> CommResult<()> {
        let _setup = self.setup.lock();
        let context = self.context(ctx)?;
        self.check_range(context, &queues)?;
        if queue_sizes.len() != queues.len() {
            return Err(CommError::config(format!(
                "{} payload sizes for {} queues",
                queue_sizes.len(),
                queues.len()
            )));
        }

        let mut staged: Vec<Arc<Queue>> = Vec::with_capacity(queues.len());
        for (index, &size) in queues.clone().zip(queue_sizes) {
            match self.setup_queue(ctx, context, index, elems, size) {
                Ok(queue) => staged.push(queue),
                Err(err) => {
                    warn!("context {ctx}: init of queue {index} failed: {err}");
                    for queue in staged.iter().rev() {
                        queue.shutdown();
                    }
                    return Err(err);
                }
            }
        }

        for queue in staged {
            if let Some(ring) = queue.ring() {
                self.record_peer(ring.peer());
            }
            if let Some(slot) = context.slot(queue.index()) {
                *slot.write() = Some(queue);
            }
        }
        debug!("context {ctx}: queues {queues:?} initialized");
        Ok(())
    }

    fn binding(&self, index: u32) -> CommResult<&QueueBinding> {
        self.config
            .bindings
            .get(&index)
            .ok_or_else(|| CommError::config(format!("no backend binding for queue {index}")))
    }

    fn setup_queue(
        &self,
        ctx: usize,
        context: &VirtContext,
        index: u32,
        elems: usize,
        size: usize,
    ) -> CommResult<Arc<Queue>> {
        if context.is_valid(index) {
            return Err(CommError::AlreadyExists {
                context: ctx,
                queue: index,
            });
        }
        if size == 0 {
            return Err(CommError::config(format!("queue {index}: zero payload size")));
        }
        let binding = self.binding(index)?;
        let ring_backend = self.backends.ring(&binding.ring.backend)?;
        let mempool_backend = match &binding.mempool {
            Some(mempool) => Some((self.backends.mempool(&mempool.backend)?, mempool.instance)),
            None => None,
        };

        let mut slab = ElementSlab::new(size);
        let buffers = slab.preallocate(elems)?;

        let ring = RingBinding::reserve(ring_backend, binding.ring.instance, size)?;

        let mempool = match mempool_backend {
            Some((backend, instance)) => match MempoolBinding::reserve(backend, instance) {
                Ok(mempool) => Some(mempool),
                Err(err) => {
                    ring.release();
                    return Err(err);
                }
            },
            None => None,
        };

        let queue = Queue::assemble(ctx, index, slab, buffers, Some(ring), mempool);
        if let Err(err) = queue.arm() {
            queue.shutdown();
            return Err(err);
        }
        debug!("context {ctx}: queue {index} up, {elems} x {size} bytes");
        Ok(queue)
    }

    fn record_peer(&self, peer: PeerId) {
        let mut server_peer = self.server_peer.lock();
        if let Some(previous) = *server_peer {
            if previous != peer {
                warn!("ring channels disagree on the server peer: {previous} then {peer}");
            }
        }
        *server_peer = Some(peer);
    }

    /// Tears down the live queues in `queues`. Indices that were never
    /// initialized are skipped.
    ///
    /// Messages still checked out are a caller bug; they are freed when
    /// dropped.
    pub fn deinit(&self, ctx: usize, queues: Range<u32>) -> CommResult<()> {
        let _setup = self.setup.lock();
        let context = self.context(ctx)?;
        self.check_range(context, &queues)?;
        for index in queues.clone() {
            let queue = context.slot(index).and_then(|slot| slot.write().take());
            if let Some(queue) = queue {
                queue.shutdown();
            }
        }
        debug!("context {ctx}: queues {queues:?} deinitialized");
        Ok(())
    }

    /// Sends one message. [`PeerId::SELF`] loops back into the local queue;
    /// any other peer must be the peer of the queue's ring channel.
    ///
    /// `data` may be shorter than the queue payload size; it then fills the
    /// prefix of the frame.
    pub fn send(&self, ctx: usize, peer: PeerId, index: u32, data: &[u8]) -> CommResult<()> {
        let queue = self.queue(ctx, index)?;
        let size = queue.payload_size();
        if data.len() > size {
            return Err(CommError::config(format!(
                "{}-byte message exceeds {size}-byte payload of queue {index}",
                data.len()
            )));
        }
        if peer.is_self() {
            return queue.enqueue_local(data, PeerId::SELF);
        }
        let ring = queue
            .ring()
            .ok_or(CommError::NotInitialized { queue: index })?;
        if ring.peer() != peer {
            return Err(CommError::PeerMismatch {
                requested: peer,
                bound: ring.peer(),
            });
        }
        ring.transmit(data, self.config.send_timeout())
    }

    /// Takes the oldest pending message, waiting up to the configured
    /// receive bound.
    pub fn recv(&self, ctx: usize, index: u32) -> CommResult<Message> {
        self.queue(ctx, index)?.dequeue(self.config.recv_timeout())
    }

    /// Sends `data` and waits for the next message on the same queue.
    ///
    /// Concurrent callers on one queue are serialized so each gets the
    /// response to its own request. A bare [`recv`](Self::recv) on the
    /// same queue while this is in flight can steal the response.
    pub fn sendrecv(
        &self,
        ctx: usize,
        peer: PeerId,
        index: u32,
        data: &[u8],
    ) -> CommResult<Message> {
        let queue = self.queue(ctx, index)?;
        let _pairing = queue.pairing().lock();
        self.send(ctx, peer, index, data)?;
        queue.dequeue(self.config.recv_timeout())
    }

    /// [`sendrecv`](Self::sendrecv) that copies the response into `out` and
    /// releases it. Returns the responder.
    pub fn sendrecv_into(
        &self,
        ctx: usize,
        peer: PeerId,
        index: u32,
        data: &[u8],
        out: &mut [u8],
    ) -> CommResult<PeerId> {
        let response = self.sendrecv(ctx, peer, index, data)?;
        let len = out.len().min(response.len());
        out[..len].copy_from_slice(&response[..len]);
        Ok(response.sender())
    }

    /// Hands a received message back to its queue.
    pub fn release(&self, message: Message) {
        message.release();
    }

    /// Locks the queue's mempool for exclusive use.
    ///
    /// Blocks while another caller holds it. Returns `None` if the queue has
    /// no mempool or `peer` is not the partition it is shared with.
    pub fn oob_get_ptr(
        &self,
        ctx: usize,
        peer: PeerId,
        index: u32,
    ) -> CommResult<Option<OobRegion>> {
        let queue = self.queue(ctx, index)?;
        let guard = queue.oob_lock().lock_arc();
        let Some(mempool) = queue.mempool() else {
            return Ok(None);
        };
        if mempool.peer() != peer {
            debug!(
                "queue {index}: oob request from {peer}, mempool shared with {}",
                mempool.peer()
            );
            return Ok(None);
        }
        Ok(Some(OobRegion::new(
            guard,
            mempool.memory().clone(),
            mempool.peer(),
        )))
    }

    /// Gives up the mempool lock taken by [`oob_get_ptr`](Self::oob_get_ptr).
    pub fn oob_put_ptr(&self, region: OobRegion) {
        drop(region);
    }

    /// Peer of the last ring channel brought up by a successful
    /// [`init`](Self::init).
    pub fn get_peer_id(&self) -> Option<PeerId> {
        *self.server_peer.lock()
    }

    pub fn queue_stats(&self, ctx: usize, index: u32) -> CommResult<QueueStats> {
        Ok(self.queue(ctx, index)?.stats())
    }
}

impl Drop for CommFramework {
    fn drop(&mut self) {
        for context in &self.contexts {
            for queue in context.drain() {
                queue.shutdown();
            }
        }
    }
}
