//! Host side of a capture session.
//!
//! Every exchange is one blocking write followed by waiting for the channel
//! to become readable and exactly one read. A session handle is meant for a
//! single reader; share it across threads only behind your own lock.

use std::io;
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    channel::{NotReady, ReadinessWait},
    code_to_volts,
    protocol::{
        ConfigError, ControlMessage, FrameView, StartConfig, WireError, DROPPED_SATURATED,
        START_LEN,
    },
    MAX_PAYLOAD, RING_SIZE,
};

/// Blocking message channel as seen from the host
pub trait HostLink {
    /// The coprocessor has announced the channel
    fn is_ready(&self) -> bool {
        true
    }
    fn open(&mut self) -> io::Result<()>;
    fn close(&mut self);
    fn write(&mut self, message: &[u8]) -> io::Result<usize>;
    /// Block until a message can be read. `None` waits forever; returns
    /// `false` when the timeout ran out first.
    fn poll_readable(&mut self, timeout: Option<Duration>) -> io::Result<bool>;
    /// Read exactly one message into `buf`
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Lets a session borrow a link, so one channel can carry session after session
impl<L: HostLink + ?Sized> HostLink for &mut L {
    fn is_ready(&self) -> bool {
        (**self).is_ready()
    }

    fn open(&mut self) -> io::Result<()> {
        (**self).open()
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn write(&mut self, message: &[u8]) -> io::Result<usize> {
        (**self).write(message)
    }

    fn poll_readable(&mut self, timeout: Option<Duration>) -> io::Result<bool> {
        (**self).poll_readable(timeout)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(buf)
    }
}

#[derive(Error, Debug)]
pub enum HostError {
    #[error("invalid capture configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    NotReady(#[from] NotReady),
    #[error("failed to open channel: {0}")]
    Open(#[source] io::Error),
    #[error("transport failure: {0}")]
    Transport(#[from] io::Error),
    #[error("short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },
    #[error("received {actual} byte message, expected {expected}")]
    FrameSize { expected: usize, actual: usize },
    #[error("frame holds {actual} records, expected {expected}")]
    RecordCount { expected: usize, actual: usize },
    #[error("malformed frame: {0}")]
    Malformed(#[from] WireError),
    #[error("no frame arrived in time")]
    Timeout,
    #[error("session is closed")]
    Closed,
}

#[derive(Clone, Copy, Debug)]
pub struct HostOptions {
    /// How long to wait for the coprocessor to announce the channel
    pub ready_wait: ReadinessWait,
    pub ready_poll_interval: Duration,
    /// Bound on waiting for a frame, `None` blocks indefinitely
    pub read_timeout: Option<Duration>,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            ready_wait: ReadinessWait::Attempts(100),
            ready_poll_interval: Duration::from_millis(30),
            read_timeout: None,
        }
    }
}

/// One delivered frame, converted to volts
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FrameReadout {
    /// Sample sets lost right before this frame
    pub dropped: u16,
    pub channel_count: usize,
    /// Cycle ticks since the previous sample set, one per record
    pub timestamps: Vec<u32>,
    /// `channel_count` readings per record, record after record
    pub volts: Vec<f32>,
}

impl FrameReadout {
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// The drop count overflowed or a batch was lost in transit
    pub fn loss_unknown(&self) -> bool {
        self.dropped == DROPPED_SATURATED
    }

    pub fn records(&self) -> impl Iterator<Item = (u32, &[f32])> {
        self.timestamps
            .iter()
            .copied()
            .zip(self.volts.chunks_exact(self.channel_count.max(1)))
    }

    fn fill(&mut self, view: &FrameView<'_>, channel_count: usize) {
        self.dropped = view.dropped_count();
        self.channel_count = channel_count;
        self.timestamps.clear();
        self.volts.clear();
        for record in view.records() {
            self.timestamps.push(record.elapsed_cycles());
            self.volts.extend(record.samples().map(code_to_volts));
        }
    }
}

pub struct HostSession<L: HostLink> {
    link: L,
    config: StartConfig,
    options: HostOptions,
    open: bool,
    /// Frames that may still be left over from an earlier session
    stale_budget: usize,
    buf: Vec<u8>,
}

impl<L: HostLink> HostSession<L> {
    /// Open the channel and ask the coprocessor to start capturing. Fails
    /// without retrying and without leaving the channel open.
    ///
    /// Until the first frame of this session arrives, frames that do not fit
    /// its layout are taken as leftovers of an earlier session and discarded
    /// without an ack.
    pub fn start(
        mut link: L,
        config: StartConfig,
        options: HostOptions,
    ) -> Result<Self, HostError> {
        config.validate()?;
        let spins = options.ready_wait.spin("capture channel", || {
            if link.is_ready() {
                return true;
            }
            thread::sleep(options.ready_poll_interval);
            false
        })?;
        link.open().map_err(HostError::Open)?;

        let mut session = Self {
            link,
            config,
            options,
            open: true,
            // The coprocessor never has more than RING_SIZE frames unacked
            stale_budget: RING_SIZE,
            buf: vec![0; MAX_PAYLOAD],
        };
        if let Err(err) = session.send(ControlMessage::Start(config)) {
            session.open = false;
            session.link.close();
            return Err(err);
        }
        debug!(spins, channels = ?config.channels(), "Capture started");
        Ok(session)
    }

    pub fn config(&self) -> &StartConfig {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    fn send(&mut self, msg: ControlMessage) -> Result<(), HostError> {
        let mut bytes = [0u8; START_LEN];
        let n = msg.encode(&mut bytes)?;
        let written = self.link.write(&bytes[..n])?;
        if written != n {
            return Err(HostError::ShortWrite {
                written,
                expected: n,
            });
        }
        Ok(())
    }

    /// Block for the next frame and acknowledge it
    pub fn read_frame(&mut self) -> Result<FrameReadout, HostError> {
        let mut readout = FrameReadout::default();
        self.read_frame_into(&mut readout)?;
        Ok(readout)
    }

    /// Like [`Self::read_frame`] but reuses `out`'s allocations
    pub fn read_frame_into(&mut self, out: &mut FrameReadout) -> Result<(), HostError> {
        if !self.open {
            return Err(HostError::Closed);
        }
        let n = loop {
            if !self.link.poll_readable(self.options.read_timeout)? {
                return Err(HostError::Timeout);
            }
            let n = self.link.read(&mut self.buf)?;
            match self.check_layout(n) {
                Ok(()) => break n,
                Err(err) if self.stale_budget > 0 => {
                    self.stale_budget -= 1;
                    debug!(%err, "Discarded frame from an earlier session");
                }
                Err(err) => return Err(err),
            }
        };
        self.stale_budget = 0;

        let channel_count = self.config.channel_count();
        let view = FrameView::parse(&self.buf[..n], channel_count)?;
        out.fill(&view, channel_count);
        if out.dropped > 0 {
            warn!(dropped = out.dropped, "Coprocessor dropped sample sets");
        }

        // Hand the buffer credit back
        self.send(ControlMessage::Ack)
    }

    /// Check that the `n` bytes in the receive buffer are a frame of this
    /// session
    fn check_layout(&self, n: usize) -> Result<(), HostError> {
        let expected = self.config.frame_len();
        if n != expected {
            return Err(HostError::FrameSize {
                expected,
                actual: n,
            });
        }
        let view = FrameView::parse(&self.buf[..n], self.config.channel_count())?;
        if view.record_count() != self.config.records_per_frame() {
            return Err(HostError::RecordCount {
                expected: self.config.records_per_frame(),
                actual: view.record_count(),
            });
        }
        Ok(())
    }

    /// Iterate over frames until the first error
    pub fn frames(&mut self) -> Frames<'_, L> {
        Frames {
            session: self,
            failed: false,
        }
    }

    /// Ask the coprocessor to stop and close the channel. Safe to call again.
    pub fn stop(&mut self) -> Result<(), HostError> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        let result = self.send(ControlMessage::Stop);
        self.link.close();
        debug!("Capture stopped");
        result
    }
}

impl<L: HostLink> Drop for HostSession<L> {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!(%err, "Failed to stop capture");
        }
    }
}

pub struct Frames<'a, L: HostLink> {
    session: &'a mut HostSession<L>,
    failed: bool,
}

impl<'a, L: HostLink> Iterator for Frames<'a, L> {
    type Item = Result<FrameReadout, HostError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || !self.session.is_open() {
            return None;
        }
        let frame = self.session.read_frame();
        self.failed = frame.is_err();
        Some(frame)
    }
}
