//! In-process inter-VM communication (IVC) ring channels.
//!
//! A channel pair shares one region laid out as two directional queues. Each
//! queue has a header split across two cache lines (the writer owns
//! `w_count`/`state`, the reader owns `r_count`) followed by `nframes`
//! fixed-size frames. Counters are free running; `w - r` is the number of
//! frames in flight.
//!
//! Before frames may flow both ends walk the reset handshake:
//!
//! | local | remote | action                                 |
//! |-------|--------|----------------------------------------|
//! | SYNC  | EST    | none                                   |
//! | SYNC  | ACK    | reset counters, move to EST, notify    |
//! | SYNC  | SYNC   | reset counters, move to ACK, notify    |
//! | ACK   | EST    | move to EST, notify                    |
//! | ACK   | ACK    | move to EST, notify                    |
//! | ACK   | SYNC   | reset counters, move to ACK, notify    |
//! | EST   | EST    | none                                   |
//! | EST   | ACK    | none                                   |
//! | EST   | SYNC   | reset counters, move to ACK, notify    |

use std::collections::HashMap;
use std::fmt;
use std::mem::size_of;
#[cfg(not(feature = "loom"))]
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

#[cfg(feature = "loom")]
use loom::sync::atomic::{AtomicU32, Ordering};
use log::trace;
use parking_lot::Mutex;

use crate::channel::{IrqHandler, LinkState, PeerId, RingBackend, RingChannel};
use crate::region::SharedRegion;
use crate::{TransportError, TransportResult};

/// Alignment of frames and header cache lines.
pub const IVC_ALIGN: usize = 64;

const STATE_SYNC: u32 = 0;
const STATE_ACK: u32 = 1;
const STATE_ESTABLISHED: u32 = 2;

#[repr(C, align(64))]
struct WriterLine {
    w_count: AtomicU32,
    state: AtomicU32,
}

impl WriterLine {
    fn new() -> Self {
        Self {
            w_count: AtomicU32::new(0),
            state: AtomicU32::new(STATE_SYNC),
        }
    }
}

#[repr(C, align(64))]
struct ReaderLine {
    r_count: AtomicU32,
}

impl ReaderLine {
    fn new() -> Self {
        Self {
            r_count: AtomicU32::new(0),
        }
    }
}

const READER_LINE_OFFSET: usize = size_of::<WriterLine>();
const HEADER_SIZE: usize = size_of::<WriterLine>() + size_of::<ReaderLine>();

/// Rounds `size` up to the IVC frame alignment, or `None` on overflow.
pub fn ivc_align(size: usize) -> Option<usize> {
    size.checked_add(IVC_ALIGN - 1)
        .map(|padded| padded & !(IVC_ALIGN - 1))
}

/// Shape of one channel pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IvcConfig {
    /// Frames per direction.
    pub nframes: u32,
    /// Requested frame size; rounded up to [`IVC_ALIGN`].
    pub frame_size: usize,
}

impl IvcConfig {
    pub fn new(nframes: u32, frame_size: usize) -> Self {
        Self {
            nframes,
            frame_size,
        }
    }

    fn validate(&self) -> TransportResult<usize> {
        if self.nframes == 0 {
            return Err(TransportError::InvalidCapacity {
                requested: 0,
                minimum: 1,
            });
        }
        if self.frame_size == 0 {
            return Err(TransportError::InvalidCapacity {
                requested: 0,
                minimum: IVC_ALIGN,
            });
        }
        ivc_align(self.frame_size).ok_or(TransportError::InvalidCapacity {
            requested: self.frame_size,
            minimum: IVC_ALIGN,
        })
    }
}

#[derive(Default)]
struct IrqState {
    handler: Option<IrqHandler>,
    pending: bool,
}

/// Interrupt line raised towards one end of a pair.
///
/// Notifications raised while no handler is armed are latched and delivered
/// as soon as one is registered.
#[derive(Default)]
struct IrqLine {
    state: Mutex<IrqState>,
}

impl IrqLine {
    fn raise(&self) {
        let handler = {
            let mut state = self.state.lock();
            match &state.handler {
                Some(handler) => Some(Arc::clone(handler)),
                None => {
                    state.pending = true;
                    None
                }
            }
        };
        if let Some(handler) = handler {
            handler();
        }
    }

    fn register(&self, handler: IrqHandler) -> TransportResult<()> {
        let fire = {
            let mut state = self.state.lock();
            if state.handler.is_some() {
                return Err(TransportError::IrqBusy);
            }
            state.handler = Some(Arc::clone(&handler));
            std::mem::take(&mut state.pending)
        };
        if fire {
            handler();
        }
        Ok(())
    }

    fn clear(&self) {
        self.state.lock().handler = None;
    }
}

struct IvcShared {
    region: SharedRegion,
    nframes: u32,
    frame_size: usize,
    /// `irq[side]` is raised towards `side`.
    irq: [IrqLine; 2],
}

impl IvcShared {
    fn writer_line(&self, dir: usize) -> &WriterLine {
        self.region.header(dir * HEADER_SIZE)
    }

    fn reader_line(&self, dir: usize) -> &ReaderLine {
        self.region.header(dir * HEADER_SIZE + READER_LINE_OFFSET)
    }

    fn frame_offset(&self, dir: usize, pos: u32) -> usize {
        2 * HEADER_SIZE + (dir * self.nframes as usize + pos as usize) * self.frame_size
    }
}

impl Drop for IvcShared {
    fn drop(&mut self) {
        for dir in 0..2 {
            // SAFETY: written by `IvcChannel::pair`; the last endpoint is gone.
            unsafe {
                self.region.drop_header::<WriterLine>(dir * HEADER_SIZE);
                self.region
                    .drop_header::<ReaderLine>(dir * HEADER_SIZE + READER_LINE_OFFSET);
            }
        }
    }
}

/// One end of an in-process IVC channel pair.
pub struct IvcChannel {
    shared: Arc<IvcShared>,
    side: usize,
    peer: PeerId,
    tx_pos: Mutex<u32>,
    rx_pos: Mutex<u32>,
}

impl IvcChannel {
    /// Creates a connected pair. The first endpoint belongs to partition `a`
    /// and talks to `b`; the second is its mirror image.
    pub fn pair(config: IvcConfig, a: PeerId, b: PeerId) -> TransportResult<(Self, Self)> {
        let frame_size = config.validate()?;
        let overflow = TransportError::InvalidCapacity {
            requested: config.frame_size,
            minimum: IVC_ALIGN,
        };
        let frames_len = frame_size
            .checked_mul(config.nframes as usize)
            .and_then(|len| len.checked_mul(2))
            .ok_or_else(|| overflow.clone())?;
        let len = frames_len.checked_add(2 * HEADER_SIZE).ok_or(overflow)?;
        let region = SharedRegion::new_aligned(len, IVC_ALIGN)?;
        for dir in 0..2 {
            // SAFETY: both header slots lie inside the fresh region, are
            // aligned to `IVC_ALIGN` and nothing references them yet.
            unsafe {
                region.init_header(dir * HEADER_SIZE, WriterLine::new());
                region.init_header(dir * HEADER_SIZE + READER_LINE_OFFSET, ReaderLine::new());
            }
        }

        let shared = Arc::new(IvcShared {
            region,
            nframes: config.nframes,
            frame_size,
            irq: [IrqLine::default(), IrqLine::default()],
        });
        Ok((
            Self::endpoint(Arc::clone(&shared), 0, b),
            Self::endpoint(shared, 1, a),
        ))
    }

    fn endpoint(shared: Arc<IvcShared>, side: usize, peer: PeerId) -> Self {
        Self {
            shared,
            side,
            peer,
            tx_pos: Mutex::new(0),
            rx_pos: Mutex::new(0),
        }
    }

    /// Frames per direction.
    pub fn nframes(&self) -> u32 {
        self.shared.nframes
    }

    fn tx_dir(&self) -> usize {
        self.side
    }

    fn rx_dir(&self) -> usize {
        1 - self.side
    }

    fn local_state(&self) -> &AtomicU32 {
        &self.shared.writer_line(self.tx_dir()).state
    }

    fn notify_peer(&self) {
        self.shared.irq[1 - self.side].raise();
    }

    fn established(&self) -> bool {
        self.local_state().load(Ordering::Acquire) == STATE_ESTABLISHED
    }

    fn check_read(&self) -> TransportResult<()> {
        if !self.established() {
            return Err(TransportError::NotEstablished);
        }
        let w = self
            .shared
            .writer_line(self.rx_dir())
            .w_count
            .load(Ordering::Acquire);
        let r = self
            .shared
            .reader_line(self.rx_dir())
            .r_count
            .load(Ordering::Relaxed);
        // An over-full count can only come from a misbehaving peer; report
        // the channel as silent rather than trusting it.
        let avail = w.wrapping_sub(r);
        if avail == 0 || avail > self.shared.nframes {
            return Err(TransportError::WouldBlock);
        }
        Ok(())
    }

    fn check_write(&self) -> TransportResult<()> {
        if !self.established() {
            return Err(TransportError::NotEstablished);
        }
        let w = self
            .shared
            .writer_line(self.tx_dir())
            .w_count
            .load(Ordering::Relaxed);
        let r = self
            .shared
            .reader_line(self.tx_dir())
            .r_count
            .load(Ordering::Acquire);
        if w.wrapping_sub(r) >= self.shared.nframes {
            return Err(TransportError::WouldBlock);
        }
        Ok(())
    }

    fn reset_counters(&self) {
        let mut tx_pos = self.tx_pos.lock();
        let mut rx_pos = self.rx_pos.lock();
        self.shared
            .writer_line(self.tx_dir())
            .w_count
            .store(0, Ordering::Relaxed);
        self.shared
            .reader_line(self.rx_dir())
            .r_count
            .store(0, Ordering::Relaxed);
        *tx_pos = 0;
        *rx_pos = 0;
    }

    fn advance(&self, pos: u32) -> u32 {
        if pos + 1 == self.shared.nframes {
            0
        } else {
            pos + 1
        }
    }

    fn transition(&self, state: u32) {
        trace!(
            "ivc side {} -> {}",
            self.side,
            match state {
                STATE_SYNC => "sync",
                STATE_ACK => "ack",
                _ => "established",
            }
        );
        self.local_state().store(state, Ordering::Release);
        self.notify_peer();
    }
}

impl RingChannel for IvcChannel {
    fn peer_id(&self) -> PeerId {
        self.peer
    }

    fn frame_size(&self) -> usize {
        self.shared.frame_size
    }

    fn can_read(&self) -> bool {
        self.check_read().is_ok()
    }

    fn can_write(&self) -> bool {
        self.check_write().is_ok()
    }

    fn read(&self, buf: &mut [u8]) -> TransportResult<usize> {
        let mut pos = self.rx_pos.lock();
        self.check_read()?;

        let len = buf.len().min(self.shared.frame_size);
        let offset = self.shared.frame_offset(self.rx_dir(), *pos);
        // SAFETY: the frame at `pos` was published by the peer and is not
        // reused until `r_count` moves past it; `rx_pos` serialises readers.
        unsafe { self.shared.region.copy_out(offset, &mut buf[..len]) };

        let reader = self.shared.reader_line(self.rx_dir());
        let r = reader.r_count.load(Ordering::Relaxed).wrapping_add(1);
        reader.r_count.store(r, Ordering::Release);
        *pos = self.advance(*pos);
        drop(pos);

        let w = self
            .shared
            .writer_line(self.rx_dir())
            .w_count
            .load(Ordering::Acquire);
        if w.wrapping_sub(r) == self.shared.nframes - 1 {
            self.notify_peer();
        }
        Ok(len)
    }

    fn write(&self, buf: &[u8]) -> TransportResult<usize> {
        if buf.len() > self.shared.frame_size {
            return Err(TransportError::FrameOverflow {
                len: buf.len(),
                frame_size: self.shared.frame_size,
            });
        }

        let mut pos = self.tx_pos.lock();
        self.check_write()?;

        let offset = self.shared.frame_offset(self.tx_dir(), *pos);
        // SAFETY: the frame at `pos` is free (checked above) and invisible to
        // the peer until `w_count` is bumped; `tx_pos` serialises writers.
        unsafe { self.shared.region.copy_in(offset, buf) };

        let writer = self.shared.writer_line(self.tx_dir());
        let w = writer.w_count.load(Ordering::Relaxed).wrapping_add(1);
        writer.w_count.store(w, Ordering::Release);
        *pos = self.advance(*pos);
        drop(pos);

        let r = self
            .shared
            .reader_line(self.tx_dir())
            .r_count
            .load(Ordering::Acquire);
        if w.wrapping_sub(r) == 1 {
            self.notify_peer();
        }
        Ok(buf.len())
    }

    fn reset(&self) {
        self.transition(STATE_SYNC);
    }

    fn notified(&self) -> LinkState {
        let peer_state = self
            .shared
            .writer_line(self.rx_dir())
            .state
            .load(Ordering::Acquire);
        let local = self.local_state().load(Ordering::Relaxed);

        if peer_state == STATE_SYNC {
            self.reset_counters();
            self.transition(STATE_ACK);
        } else if local == STATE_SYNC && peer_state == STATE_ACK {
            self.reset_counters();
            self.transition(STATE_ESTABLISHED);
        } else if local == STATE_ACK {
            self.transition(STATE_ESTABLISHED);
        }

        if self.established() {
            LinkState::Established
        } else {
            LinkState::Syncing
        }
    }

    fn request_irq(&self, handler: IrqHandler) -> TransportResult<()> {
        self.shared.irq[self.side].register(handler)
    }

    fn free_irq(&self) {
        self.shared.irq[self.side].clear();
    }
}

impl fmt::Debug for IvcChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IvcChannel")
            .field("side", &self.side)
            .field("peer", &self.peer)
            .field("nframes", &self.shared.nframes)
            .field("frame_size", &self.shared.frame_size)
            .finish()
    }
}

struct IvcEntry {
    channel: Arc<IvcChannel>,
    reserved: bool,
}

/// Per-partition table of IVC channels, keyed by instance number.
pub struct IvcBackend {
    local: PeerId,
    entries: Mutex<HashMap<u32, IvcEntry>>,
}

impl IvcBackend {
    pub fn new(local: PeerId) -> Self {
        Self {
            local,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Partition this backend belongs to.
    pub fn local_id(&self) -> PeerId {
        self.local
    }

    /// Registers a channel end under `instance`.
    pub fn insert(&self, instance: u32, channel: IvcChannel) -> TransportResult<()> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&instance) {
            return Err(TransportError::DuplicateInstance(instance));
        }
        entries.insert(
            instance,
            IvcEntry {
                channel: Arc::new(channel),
                reserved: false,
            },
        );
        Ok(())
    }

    /// Creates a channel pair between two partitions and registers each end
    /// under the same instance number on its side.
    pub fn connect(
        a: &IvcBackend,
        b: &IvcBackend,
        instance: u32,
        config: IvcConfig,
    ) -> TransportResult<()> {
        let (end_a, end_b) = IvcChannel::pair(config, a.local, b.local)?;
        a.insert(instance, end_a)?;
        b.insert(instance, end_b)
    }

    /// Returns true while `instance` is reserved.
    pub fn is_reserved(&self, instance: u32) -> bool {
        self.entries
            .lock()
            .get(&instance)
            .is_some_and(|entry| entry.reserved)
    }
}

impl RingBackend for IvcBackend {
    fn reserve(&self, instance: u32) -> TransportResult<Arc<dyn RingChannel>> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(&instance)
            .ok_or(TransportError::UnknownInstance(instance))?;
        if entry.reserved {
            return Err(TransportError::AlreadyReserved(instance));
        }
        entry.reserved = true;
        let channel: Arc<dyn RingChannel> = entry.channel.clone();
        Ok(channel)
    }

    fn unreserve(&self, instance: u32) -> TransportResult<()> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(&instance)
            .ok_or(TransportError::UnknownInstance(instance))?;
        if !entry.reserved {
            return Err(TransportError::NotReserved(instance));
        }
        entry.channel.free_irq();
        entry.reserved = false;
        Ok(())
    }
}


#[cfg(all(test, feature = "loom"))]
mod loom_tests {
    use loom::thread;

    use super::*;

    fn established_pair(nframes: u32) -> (IvcChannel, IvcChannel) {
        let (a, b) = IvcChannel::pair(IvcConfig::new(nframes, 8), PeerId(1), PeerId(0))
            .expect("ivc pair");
        a.reset();
        b.reset();
        a.notified();
        b.notified();
        a.notified();
        assert!(a.can_write());
        (a, b)
    }

    #[test]
    #[ignore]
    fn slow_loom_ivc_frames_keep_fifo() {
        loom::model(|| {
            const COUNT: u32 = 3;
            let (a, b) = established_pair(2);

            let writer = thread::spawn(move || {
                for value in 0..COUNT {
                    while a.write(&value.to_le_bytes()).is_err() {
                        thread::yield_now();
                    }
                }
                a
            });

            let mut buf = [0u8; 4];
            for expected in 0..COUNT {
                while b.read(&mut buf).is_err() {
                    thread::yield_now();
                }
                assert_eq!(u32::from_le_bytes(buf), expected);
            }

            let a = writer.join().unwrap();
            assert!(!b.can_read());
            assert!(a.can_write());
        });
    }

    #[test]
    #[ignore]
    fn slow_loom_ivc_full_ring_blocks_writer() {
        loom::model(|| {
            let (a, b) = established_pair(1);
            a.write(&[1]).expect("first frame");

            let reader = thread::spawn(move || {
                let mut buf = [0u8; 1];
                while b.read(&mut buf).is_err() {
                    thread::yield_now();
                }
                assert_eq!(buf[0], 1);
                b
            });

            while a.write(&[2]).is_err() {
                thread::yield_now();
            }
            let b = reader.join().unwrap();
            assert!(b.can_read());
        });
    }
}
