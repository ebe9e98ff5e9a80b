//! Mock two-partition deployment: a guest framework wired to an in-process
//! server partition over IVC rings and shared mempools.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use crossbeam_channel::{Receiver, Sender};
use gr_comm::{BackendRef, Backends, CommConfig, CommFramework, QueueBinding};
use log::{debug, warn};
use transport::{
    IvcBackend, IvcConfig, LinkState, Mempool, MempoolBackend, MempoolTable, PeerId, RingBackend,
    RingChannel,
};

/// Partition running the framework under test.
pub const GUEST_VM: PeerId = PeerId(1);
/// Partition playing the server.
pub const SERVER_VM: PeerId = PeerId(0);

pub const RING_BACKEND: &str = "ivc";
pub const MEMPOOL_BACKEND: &str = "mempool";

const MEMPOOL_BASE: u64 = 0x8000_0000;
const MEMPOOL_STRIDE: u64 = 0x0100_0000;

/// Builder for a guest/server pair. Queue `i` uses ring (and mempool)
/// instance `i` on both sides.
pub struct Deployment {
    guest_rings: Arc<IvcBackend>,
    server_rings: Arc<IvcBackend>,
    guest_pools: Arc<MempoolTable>,
    server_pools: Arc<MempoolTable>,
    config: CommConfig,
}

impl Default for Deployment {
    fn default() -> Self {
        Self::new()
    }
}

impl Deployment {
    pub fn new() -> Self {
        Self {
            guest_rings: Arc::new(IvcBackend::new(GUEST_VM)),
            server_rings: Arc::new(IvcBackend::new(SERVER_VM)),
            guest_pools: Arc::new(MempoolTable::new(GUEST_VM)),
            server_pools: Arc::new(MempoolTable::new(SERVER_VM)),
            config: CommConfig::default(),
        }
    }

    pub fn with_timeouts(mut self, recv: Duration, send: Duration) -> Self {
        self.config.recv_timeout_ms = u64::try_from(recv.as_millis()).unwrap_or(u64::MAX);
        self.config.send_timeout_ms = u64::try_from(send.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Connects an IVC pair for queue `index` and binds it.
    pub fn queue(mut self, index: u32, ivc: IvcConfig) -> Result<Self> {
        IvcBackend::connect(&self.guest_rings, &self.server_rings, index, ivc)
            .with_context(|| format!("connect ring {index}"))?;
        self.config = self.config.bind(
            index,
            QueueBinding::ring(BackendRef::new(RING_BACKEND, index)),
        );
        Ok(self)
    }

    /// Like [`Deployment::queue`], plus a shared mempool of `size` bytes.
    pub fn queue_with_mempool(mut self, index: u32, ivc: IvcConfig, size: usize) -> Result<Self> {
        IvcBackend::connect(&self.guest_rings, &self.server_rings, index, ivc)
            .with_context(|| format!("connect ring {index}"))?;
        let base = MEMPOOL_BASE + MEMPOOL_STRIDE * u64::from(index);
        MempoolTable::share(&self.guest_pools, &self.server_pools, index, base, size)
            .with_context(|| format!("share mempool {index}"))?;
        self.config = self.config.bind(
            index,
            QueueBinding::ring(BackendRef::new(RING_BACKEND, index))
                .with_mempool(BackendRef::new(MEMPOOL_BACKEND, index)),
        );
        Ok(self)
    }

    pub fn config(&self) -> &CommConfig {
        &self.config
    }

    /// Guest-side backend registry.
    pub fn backends(&self) -> Backends {
        Backends::new()
            .with_ring(RING_BACKEND, self.guest_rings.clone())
            .with_mempool(MEMPOOL_BACKEND, self.guest_pools.clone())
    }

    pub fn guest_rings(&self) -> &IvcBackend {
        &self.guest_rings
    }

    pub fn guest_pools(&self) -> &MempoolTable {
        &self.guest_pools
    }

    pub fn framework(&self) -> Result<CommFramework> {
        CommFramework::new(self.config.clone(), self.backends()).context("build framework")
    }

    /// Reserves the server end of ring `index`.
    pub fn server_channel(&self, index: u32) -> Result<Arc<dyn RingChannel>> {
        self.server_rings
            .reserve(index)
            .with_context(|| format!("reserve server ring {index}"))
    }

    /// Reserves the server view of mempool `index`.
    pub fn server_mempool(&self, index: u32) -> Result<Arc<dyn Mempool>> {
        self.server_pools
            .reserve(index)
            .with_context(|| format!("reserve server mempool {index}"))
    }
}

/// Drives the reset handshake on a channel nobody services by interrupt.
pub fn establish(channel: &dyn RingChannel, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    while channel.notified() != LinkState::Established {
        if Instant::now() >= deadline {
            bail!("link to {} not established after {timeout:?}", channel.peer_id());
        }
        thread::sleep(Duration::from_millis(1));
    }
    Ok(())
}

/// Server that writes every frame it receives straight back, after passing
/// it through a transform.
pub struct EchoPeer {
    channel: Arc<dyn RingChannel>,
    stopping: Arc<AtomicBool>,
    echoed: Arc<AtomicUsize>,
    events: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl EchoPeer {
    pub fn spawn(channel: Arc<dyn RingChannel>) -> Result<Self> {
        Self::spawn_with(channel, |_| {})
    }

    pub fn spawn_with<F>(channel: Arc<dyn RingChannel>, transform: F) -> Result<Self>
    where
        F: FnMut(&mut [u8]) + Send + 'static,
    {
        let (events, rx) = crossbeam_channel::bounded(1);
        let stopping = Arc::new(AtomicBool::new(false));
        let echoed = Arc::new(AtomicUsize::new(0));
        let worker = {
            let channel = Arc::clone(&channel);
            let stopping = Arc::clone(&stopping);
            let echoed = Arc::clone(&echoed);
            thread::Builder::new()
                .name(format!("echo-peer-{}", channel.peer_id()))
                .spawn(move || serve(channel.as_ref(), rx, &stopping, &echoed, transform))
                .context("spawn echo peer")?
        };

        channel.reset();
        let notify = events.clone();
        channel
            .request_irq(Arc::new(move || {
                let _ = notify.try_send(());
            }))
            .context("arm echo peer")?;
        Ok(Self {
            channel,
            stopping,
            echoed,
            events: Some(events),
            worker: Some(worker),
        })
    }

    /// Frames written back so far.
    pub fn echoed(&self) -> usize {
        self.echoed.load(Ordering::Acquire)
    }

    /// Stops serving and returns the final echo count.
    pub fn stop(mut self) -> usize {
        self.shutdown();
        self.echoed()
    }

    fn shutdown(&mut self) {
        self.stopping.store(true, Ordering::Release);
        self.channel.free_irq();
        self.events.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("echo peer panicked");
            }
        }
    }
}

impl Drop for EchoPeer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn serve<F>(
    channel: &dyn RingChannel,
    events: Receiver<()>,
    stopping: &AtomicBool,
    echoed: &AtomicUsize,
    mut transform: F,
) where
    F: FnMut(&mut [u8]),
{
    let mut frame = vec![0u8; channel.frame_size()];
    for () in events.iter() {
        if channel.notified() != LinkState::Established {
            continue;
        }
        while channel.can_read() && !stopping.load(Ordering::Acquire) {
            let len = match channel.read(&mut frame) {
                Ok(len) => len,
                Err(err) => {
                    warn!("echo peer read failed: {err}");
                    break;
                }
            };
            transform(&mut frame[..len]);
            while !channel.can_write() {
                if stopping.load(Ordering::Acquire) {
                    return;
                }
                thread::sleep(Duration::from_micros(200));
            }
            if let Err(err) = channel.write(&frame[..len]) {
                warn!("echo peer write failed: {err}");
                break;
            }
            echoed.fetch_add(1, Ordering::AcqRel);
        }
    }
    debug!("echo peer for {} stopped", channel.peer_id());
}
