//! Ring-channel binding: reservation, the two-phase interrupt path and the
//! transmit wait queue.
//!
//! The notify phase runs in whatever context the backend raises the channel
//! interrupt from and only posts a wake-up to a bounded channel. The deliver
//! phase runs on a dedicated drain thread per queue and does all the work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use log::{debug, error, trace, warn};
use parking_lot::{Condvar, Mutex};
use transport::{IrqHandler, PeerId, RingBackend, RingChannel};

use crate::error::{CommError, CommResult};
use crate::queue::Queue;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DrainEvent {
    Interrupt,
    Shutdown,
}

struct Drain {
    events: Sender<DrainEvent>,
    thread: JoinHandle<()>,
}

#[derive(Default)]
struct WriteWait {
    lock: Mutex<()>,
    writable: Condvar,
}

pub(crate) struct RingBinding {
    backend: Arc<dyn RingBackend>,
    instance: u32,
    channel: Arc<dyn RingChannel>,
    write_wait: WriteWait,
    drain: Mutex<Option<Drain>>,
    released: AtomicBool,
}

impl RingBinding {
    /// Reserves `instance` and forces the channel back into its handshake.
    ///
    /// Fails with [`CommError::FrameTooSmall`] if the channel cannot carry
    /// `payload_size` bytes per frame; the reservation is dropped first.
    pub(crate) fn reserve(
        backend: Arc<dyn RingBackend>,
        instance: u32,
        payload_size: usize,
    ) -> CommResult<Self> {
        let channel = backend.reserve(instance)?;
        let frame_size = channel.frame_size();
        if frame_size < payload_size {
            if let Err(err) = backend.unreserve(instance) {
                warn!("ring {instance}: unreserve after size check failed: {err}");
            }
            return Err(CommError::FrameTooSmall {
                frame_size,
                payload_size,
            });
        }
        debug!(
            "ring {instance} reserved: peer {}, {frame_size}-byte frames",
            channel.peer_id()
        );
        channel.reset();
        Ok(Self {
            backend,
            instance,
            channel,
            write_wait: WriteWait::default(),
            drain: Mutex::new(None),
            released: AtomicBool::new(false),
        })
    }

    pub(crate) fn peer(&self) -> PeerId {
        self.channel.peer_id()
    }

    pub(crate) fn channel(&self) -> &Arc<dyn RingChannel> {
        &self.channel
    }

    /// Spawns the drain thread and registers the notify half with the
    /// channel.
    pub(crate) fn arm(&self, context: usize, index: u32, queue: Weak<Queue>) -> CommResult<()> {
        let (events, rx) = crossbeam_channel::bounded(1);
        let thread = thread::Builder::new()
            .name(format!("gr-comm-drain-{context}.{index}"))
            .spawn(move || drain_loop(rx, queue))
            .map_err(|_| CommError::ResourceExhausted("drain thread"))?;
        let notify = events.clone();
        *self.drain.lock() = Some(Drain { events, thread });

        let handler: IrqHandler = Arc::new(move || {
            // A full slot already guarantees one more deliver pass.
            let _ = notify.try_send(DrainEvent::Interrupt);
        });
        self.channel.request_irq(handler)?;
        Ok(())
    }

    /// Writes one frame, waiting up to `timeout` for the ring to drain.
    pub(crate) fn transmit(&self, data: &[u8], timeout: Duration) -> CommResult<()> {
        if !self.channel.can_write() {
            let mut guard = self.write_wait.lock.lock();
            let waited = self.write_wait.writable.wait_while_for(
                &mut guard,
                |_| !self.channel.can_write(),
                timeout,
            );
            if waited.timed_out() && !self.channel.can_write() {
                return Err(CommError::Timeout(timeout));
            }
        }
        let written = self.channel.write(data)?;
        if written < data.len() {
            return Err(CommError::TornIo {
                expected: data.len(),
                actual: written,
            });
        }
        trace!("ring {}: sent {written} bytes", self.instance);
        Ok(())
    }

    pub(crate) fn wake_writers(&self) {
        let _guard = self.write_wait.lock.lock();
        self.write_wait.writable.notify_all();
    }

    /// Disarms the interrupt, stops the drain thread and gives the instance
    /// back. Later calls do nothing.
    pub(crate) fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.channel.free_irq();
        let drain = self.drain.lock().take();
        if let Some(drain) = drain {
            let _ = drain.events.send(DrainEvent::Shutdown);
            if drain.thread.join().is_err() {
                error!("ring {}: drain thread panicked", self.instance);
            }
        }
        if let Err(err) = self.backend.unreserve(self.instance) {
            warn!("ring {}: unreserve failed: {err}", self.instance);
        }
        self.wake_writers();
        debug!("ring {} released", self.instance);
    }
}

fn drain_loop(events: Receiver<DrainEvent>, queue: Weak<Queue>) {
    for event in events.iter() {
        match event {
            DrainEvent::Interrupt => match queue.upgrade() {
                Some(queue) => queue.deliver(),
                None => break,
            },
            DrainEvent::Shutdown => break,
        }
    }
}
