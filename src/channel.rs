//! Coprocessor side of the message channel.
//!
//! The transport never blocks. The host raises an edge-triggered attention
//! flag whenever it writes; [`ChannelWatcher`] notices the edge and then keeps
//! receiving until the inbound queue is empty.

use thiserror::Error;
use tracing::{debug, trace};

/// Non-blocking message transport as seen from the coprocessor
pub trait Transport {
    /// Host side infrastructure is up and the channel can be announced
    fn is_ready(&self) -> bool;
    /// Attempt to announce the channel to the host
    fn open(&mut self) -> bool;
    /// Attempt to tear the channel down
    fn close(&mut self) -> bool;
    /// Read and clear the "host wants attention" edge
    fn take_attention(&mut self) -> bool;
    /// Receive one pending message into `buf`, returning its length
    fn try_recv(&mut self, buf: &mut [u8]) -> Option<usize>;
    /// Best-effort send of one message, no queueing or retry
    fn send(&mut self, payload: &[u8]) -> bool;
}

/// How long a readiness spin may run
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReadinessWait {
    /// Spin until ready, however long that takes
    #[default]
    Unbounded,
    /// Give up after this many failed checks
    Attempts(u32),
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("{what} not ready after {attempts} attempts")]
pub struct NotReady {
    pub what: &'static str,
    pub attempts: u32,
}

impl ReadinessWait {
    /// Call `check` until it succeeds or the bound runs out. Returns the number
    /// of failed checks before success.
    pub fn spin(
        &self,
        what: &'static str,
        mut check: impl FnMut() -> bool,
    ) -> Result<u32, NotReady> {
        let mut failed = 0u32;
        loop {
            if check() {
                return Ok(failed);
            }
            failed = failed.saturating_add(1);
            if let Self::Attempts(max) = *self {
                if failed >= max {
                    return Err(NotReady {
                        what,
                        attempts: failed,
                    });
                }
            }
            core::hint::spin_loop();
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WatchState {
    #[default]
    WaitForSignal,
    Draining,
}

/// Turns attention edges into a stream of received messages
#[derive(Debug, Default)]
pub struct ChannelWatcher {
    state: WatchState,
}

impl ChannelWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> WatchState {
        self.state
    }

    /// Wait for the host, then announce the channel
    pub fn connect<T: Transport>(
        transport: &mut T,
        wait: ReadinessWait,
    ) -> Result<Self, NotReady> {
        let spins = wait.spin("host driver", || transport.is_ready())?;
        debug!(spins, "Host driver ready");
        wait.spin("channel announce", || transport.open())?;
        Ok(Self::new())
    }

    pub fn disconnect<T: Transport>(
        transport: &mut T,
        wait: ReadinessWait,
    ) -> Result<(), NotReady> {
        wait.spin("channel teardown", || transport.close()).map(|_| ())
    }

    /// One non-blocking step. Returns the length of a message written to `buf`.
    pub fn poll<T: Transport>(&mut self, transport: &mut T, buf: &mut [u8]) -> Option<usize> {
        if self.state == WatchState::WaitForSignal {
            if !transport.take_attention() {
                return None;
            }
            trace!("Host raised attention");
            self.state = WatchState::Draining;
        }
        match transport.try_recv(buf) {
            Some(len) => Some(len),
            None => {
                // Nothing more to read
                self.state = WatchState::WaitForSignal;
                None
            }
        }
    }
}
