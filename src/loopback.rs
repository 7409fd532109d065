//! In-process stand-in for the kernel message channel.
//!
//! Two bounded queues of fixed-size packets connect a [`CoprocessorEnd`]
//! (non-blocking [`Transport`]) with a [`HostEnd`] (blocking [`HostLink`]).
//! Host writes raise the attention flag the coprocessor watches, the way the
//! kernel kicks the remote processor.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::debug;

use crate::{channel::Transport, host::HostLink, MAX_PAYLOAD};

/// Default queue depth in each direction
pub const VRING_DEPTH: usize = 16;

/// One channel message, stored inline
#[derive(Clone, Copy)]
pub struct Packet {
    len: usize,
    bytes: [u8; MAX_PAYLOAD],
}

impl Packet {
    pub fn new(payload: &[u8]) -> Option<Self> {
        let mut bytes = [0u8; MAX_PAYLOAD];
        bytes.get_mut(..payload.len())?.copy_from_slice(payload);
        Some(Self {
            len: payload.len(),
            bytes,
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    /// Copy into `buf`, truncating like a datagram read
    fn copy_to(&self, buf: &mut [u8]) -> usize {
        let n = self.len.min(buf.len());
        buf[..n].copy_from_slice(&self.bytes[..n]);
        n
    }
}

#[derive(Debug)]
struct Shared {
    driver_ready: AtomicBool,
    announced: AtomicBool,
    attention: AtomicBool,
}

/// Create a connected pair of channel ends with `depth` packets of buffering
/// in each direction
pub fn loopback(depth: usize) -> (CoprocessorEnd, HostEnd) {
    let (to_host, from_coprocessor) = bounded(depth);
    let (to_coprocessor, from_host) = bounded(depth);
    let shared = Arc::new(Shared {
        driver_ready: AtomicBool::new(true),
        announced: AtomicBool::new(false),
        attention: AtomicBool::new(false),
    });
    (
        CoprocessorEnd {
            tx: to_host,
            rx: from_host,
            shared: shared.clone(),
        },
        HostEnd {
            tx: to_coprocessor,
            rx: from_coprocessor,
            shared,
            pending: None,
            open: false,
        },
    )
}

pub struct CoprocessorEnd {
    tx: Sender<Packet>,
    rx: Receiver<Packet>,
    shared: Arc<Shared>,
}

impl Transport for CoprocessorEnd {
    fn is_ready(&self) -> bool {
        self.shared.driver_ready.load(Ordering::Acquire)
    }

    fn open(&mut self) -> bool {
        self.shared.announced.store(true, Ordering::Release);
        true
    }

    fn close(&mut self) -> bool {
        self.shared.announced.store(false, Ordering::Release);
        true
    }

    fn take_attention(&mut self) -> bool {
        self.shared.attention.swap(false, Ordering::AcqRel)
    }

    fn try_recv(&mut self, buf: &mut [u8]) -> Option<usize> {
        self.rx.try_recv().ok().map(|p| p.copy_to(buf))
    }

    fn send(&mut self, payload: &[u8]) -> bool {
        if !self.shared.announced.load(Ordering::Acquire) {
            return false;
        }
        match Packet::new(payload) {
            Some(packet) => self.tx.try_send(packet).is_ok(),
            None => false,
        }
    }
}

pub struct HostEnd {
    tx: Sender<Packet>,
    rx: Receiver<Packet>,
    shared: Arc<Shared>,
    pending: Option<Packet>,
    open: bool,
}

impl HostEnd {
    /// Simulate the host driver (un)loading
    pub fn set_driver_ready(&self, ready: bool) {
        self.shared.driver_ready.store(ready, Ordering::Release);
    }

    fn broken_pipe() -> io::Error {
        io::Error::new(io::ErrorKind::BrokenPipe, "coprocessor end is gone")
    }
}

impl HostLink for HostEnd {
    fn is_ready(&self) -> bool {
        self.shared.announced.load(Ordering::Acquire)
    }

    fn open(&mut self) -> io::Result<()> {
        if !self.is_ready() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "channel not announced",
            ));
        }
        if self.open {
            return Err(io::Error::new(io::ErrorKind::Other, "channel already open"));
        }
        // Anything queued belongs to an earlier session
        let mut stale = 0;
        while self.rx.try_recv().is_ok() {
            stale += 1;
        }
        if stale > 0 {
            debug!(stale, "Discarded stale frames");
        }
        self.pending = None;
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
        self.pending = None;
    }

    fn write(&mut self, message: &[u8]) -> io::Result<usize> {
        if !self.open {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "channel closed"));
        }
        let packet = Packet::new(message).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "message exceeds payload size")
        })?;
        self.tx.send(packet).map_err(|_| Self::broken_pipe())?;
        self.shared.attention.store(true, Ordering::Release);
        Ok(message.len())
    }

    fn poll_readable(&mut self, timeout: Option<Duration>) -> io::Result<bool> {
        if !self.open {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "channel closed"));
        }
        if self.pending.is_some() {
            return Ok(true);
        }
        let packet = match timeout {
            None => self.rx.recv().map_err(|_| Self::broken_pipe())?,
            Some(t) => match self.rx.recv_timeout(t) {
                Ok(packet) => packet,
                Err(RecvTimeoutError::Timeout) => return Ok(false),
                Err(RecvTimeoutError::Disconnected) => return Err(Self::broken_pipe()),
            },
        };
        self.pending = Some(packet);
        Ok(true)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let packet = match self.pending.take() {
            Some(packet) => packet,
            None => self
                .rx
                .try_recv()
                .map_err(|_| io::Error::new(io::ErrorKind::WouldBlock, "no message"))?,
        };
        Ok(packet.copy_to(buf))
    }
}
