//! Software stand-ins for the hardware the capture loop talks to.
//!
//! [`SimAdc`] behaves like the converter: a triggered sweep lands tagged words
//! in a bounded FIFO, optionally after a few polls. The clocks and the
//! recording transport make the coprocessor loop drivable from tests and from
//! the demo binary.

use std::cell::Cell;
use std::collections::VecDeque;
use std::time::Instant;

use rtrb::{Consumer, Producer, RingBuffer};
use tracing::warn;

use crate::{
    adc::{conversion_word, AdcPeripheral, AdcSetup, CycleCounter},
    channel::Transport,
    protocol::{ConfigError, ControlMessage, START_LEN},
    CYCLE_CLOCK_HZ, LANES,
};

/// Words the converter FIFO holds before it overruns
pub const FIFO_DEPTH: usize = 64;

/// What the simulated inputs are connected to
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Waveform {
    /// Every lane reads the same code
    Constant(u16),
    /// Lane number in the high nibble of the code, sweep count in the low byte
    LaneTagged,
    /// Sawtooth, each lane offset by an eighth of full scale
    Ramp { step: u16 },
    /// Full scale sine, each lane phase shifted, `period` sweeps long
    Sine { period: u32 },
}

impl Waveform {
    pub fn code(&self, lane: u8, sweep: u64) -> u16 {
        match *self {
            Self::Constant(code) => code & 0xfff,
            Self::LaneTagged => ((lane as u16) << 8) | (sweep & 0xff) as u16,
            Self::Ramp { step } => {
                let offset = lane as u64 * 512;
                ((sweep * step as u64 + offset) % 4096) as u16
            }
            Self::Sine { period } => {
                let period = period.max(1) as f32;
                let phase = (sweep % period as u64) as f32 / period
                    + lane as f32 / LANES as f32;
                let v = 2047.5 + 2047.5 * (2.0 * std::f32::consts::PI * phase).sin();
                v.round().clamp(0.0, 4095.0) as u16
            }
        }
    }
}

pub struct SimAdc {
    fifo_in: Producer<u32>,
    fifo_out: Consumer<u32>,
    waveform: Waveform,
    lane_order: [u8; LANES],
    setup: Option<AdcSetup>,
    refuse: bool,
    conversion_delay: u32,
    countdown: u32,
    staged: Option<[u32; LANES]>,
    sweeps: u64,
    triggers: u64,
    overruns: u64,
}

impl SimAdc {
    pub fn new(waveform: Waveform) -> Self {
        let (fifo_in, fifo_out) = RingBuffer::new(FIFO_DEPTH);
        let mut lane_order = [0u8; LANES];
        for (i, lane) in lane_order.iter_mut().enumerate() {
            *lane = i as u8;
        }
        Self {
            fifo_in,
            fifo_out,
            waveform,
            lane_order,
            setup: None,
            refuse: false,
            conversion_delay: 0,
            countdown: 0,
            staged: None,
            sweeps: 0,
            triggers: 0,
            overruns: 0,
        }
    }

    /// Order in which lanes report within a sweep
    pub fn set_lane_order(&mut self, order: [u8; LANES]) {
        self.lane_order = order;
    }

    /// Number of `ready` polls a sweep takes to complete
    pub fn set_conversion_delay(&mut self, polls: u32) {
        self.conversion_delay = polls;
    }

    pub fn refuse_configuration(&mut self, refuse: bool) {
        self.refuse = refuse;
    }

    /// Queue words as if left over from an earlier run
    pub fn inject_stale(&mut self, words: &[u32]) {
        for &w in words {
            self.push_word(w);
        }
    }

    pub fn setup(&self) -> Option<AdcSetup> {
        self.setup
    }

    pub fn triggers(&self) -> u64 {
        self.triggers
    }

    pub fn overruns(&self) -> u64 {
        self.overruns
    }

    fn push_word(&mut self, word: u32) {
        if self.fifo_in.push(word).is_err() {
            self.overruns += 1;
        }
    }

    fn complete_sweep(&mut self) {
        if let Some(words) = self.staged.take() {
            for w in words {
                self.push_word(w);
            }
        }
    }
}

impl AdcPeripheral for SimAdc {
    fn configure(&mut self, setup: &AdcSetup) -> Result<(), ConfigError> {
        if self.refuse {
            return Err(ConfigError::Rejected);
        }
        self.setup = Some(*setup);
        Ok(())
    }

    fn trigger(&mut self, lane_mask: u8) {
        // A sweep already in flight ignores the trigger
        if self.setup.is_none() || self.staged.is_some() {
            return;
        }
        self.triggers += 1;
        let mut words = [0u32; LANES];
        let mut n = 0;
        for &lane in self.lane_order.iter() {
            if lane_mask & (1 << lane) != 0 {
                words[n] = conversion_word(lane, self.waveform.code(lane, self.sweeps));
                n += 1;
            }
        }
        self.sweeps += 1;
        if n < LANES {
            warn!(lane_mask, "Partial sweep requested");
        }
        self.staged = Some(words);
        self.countdown = self.conversion_delay;
        if self.countdown == 0 {
            self.complete_sweep();
        }
    }

    fn ready(&mut self) -> usize {
        if self.staged.is_some() {
            if self.countdown == 0 {
                self.complete_sweep();
            } else {
                self.countdown -= 1;
            }
        }
        self.fifo_out.slots()
    }

    fn pop(&mut self) -> Option<u32> {
        self.fifo_out.pop().ok()
    }
}

/// Counter that only moves when told to. Each `elapsed` read can also
/// advance it by a fixed step, standing in for time spent per tick.
#[derive(Debug, Default)]
pub struct ManualClock {
    ticks: Cell<u32>,
    step: u32,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stepping(step: u32) -> Self {
        Self {
            ticks: Cell::new(0),
            step,
        }
    }

    pub fn advance(&mut self, ticks: u32) {
        self.ticks.set(self.ticks.get().saturating_add(ticks));
    }
}

impl CycleCounter for ManualClock {
    fn elapsed(&self) -> u32 {
        let now = self.ticks.get();
        self.ticks.set(now.saturating_add(self.step));
        now
    }

    fn restart(&mut self) {
        self.ticks.set(0);
    }
}

/// Wall clock time expressed in cycle counter ticks
#[derive(Debug)]
pub struct InstantClock {
    start: Instant,
}

impl Default for InstantClock {
    fn default() -> Self {
        Self::new()
    }
}

impl InstantClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl CycleCounter for InstantClock {
    fn elapsed(&self) -> u32 {
        let nanos = self.start.elapsed().as_nanos();
        let ticks = nanos * CYCLE_CLOCK_HZ as u128 / 1_000_000_000;
        ticks.min(u32::MAX as u128) as u32
    }

    fn restart(&mut self) {
        self.start = Instant::now();
    }
}

/// Transport double that keeps everything sent and replays queued input
#[derive(Debug, Default)]
pub struct RecordingTransport {
    inbound: VecDeque<Vec<u8>>,
    sent: Vec<Vec<u8>>,
    attention: bool,
    failing_sends: usize,
    ready_after: Cell<u32>,
    open: bool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a raw message and raise attention
    pub fn queue_inbound(&mut self, bytes: &[u8]) {
        self.inbound.push_back(bytes.to_vec());
        self.attention = true;
    }

    pub fn queue_control(&mut self, msg: ControlMessage) {
        let mut buf = [0u8; START_LEN];
        if let Ok(n) = msg.encode(&mut buf) {
            self.queue_inbound(&buf[..n]);
        }
    }

    pub fn clear_attention(&mut self) {
        self.attention = false;
    }

    /// Fail the next `n` sends
    pub fn fail_sends(&mut self, n: usize) {
        self.failing_sends = n;
    }

    /// Report not ready for the next `n` readiness checks
    pub fn set_ready_after(&mut self, n: u32) {
        self.ready_after.set(n);
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn sent(&self) -> &[Vec<u8>] {
        &self.sent
    }

    pub fn take_sent(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.sent)
    }
}

impl Transport for RecordingTransport {
    fn is_ready(&self) -> bool {
        let n = self.ready_after.get();
        if n == 0 {
            return true;
        }
        self.ready_after.set(n - 1);
        false
    }

    fn open(&mut self) -> bool {
        self.open = true;
        true
    }

    fn close(&mut self) -> bool {
        self.open = false;
        true
    }

    fn take_attention(&mut self) -> bool {
        std::mem::take(&mut self.attention)
    }

    fn try_recv(&mut self, buf: &mut [u8]) -> Option<usize> {
        let msg = self.inbound.pop_front()?;
        let n = msg.len().min(buf.len());
        buf[..n].copy_from_slice(&msg[..n]);
        Some(n)
    }

    fn send(&mut self, payload: &[u8]) -> bool {
        if self.failing_sends > 0 {
            self.failing_sends -= 1;
            return false;
        }
        self.sent.push(payload.to_vec());
        true
    }
}
