//! Cooperative capture of multi-channel sample sets.
//!
//! The converter always sweeps all [`LANES`] inputs; each result word carries
//! the lane it came from, so results are demultiplexed by tag rather than by
//! arrival order. Lanes nobody asked for land in a dump slot and are dropped.

use tracing::{trace, warn};

use crate::{protocol::ConfigError, StartConfig, LANES};

/// Bit offset of the lane tag inside a conversion word
pub const LANE_TAG_SHIFT: u32 = 16;
pub const LANE_TAG_MASK: u32 = 0xf;
/// Conversions are 12 bit
pub const CODE_MASK: u32 = 0xfff;
/// Enable every lane of the sweep
pub const ALL_LANES: u8 = 0xff;

// Logical slot that swallows results for lanes that were not requested
const DUMP: usize = LANES;

/// Build a tagged conversion word the way the converter reports it
#[inline]
pub fn conversion_word(lane: u8, code: u16) -> u32 {
    ((lane as u32 & LANE_TAG_MASK) << LANE_TAG_SHIFT) | (code as u32 & CODE_MASK)
}

/// Peripheral settings derived from a [`StartConfig`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdcSetup {
    pub clock_divider: u32,
    pub averaging_exponent: u32,
    /// Bit `n` enables lane `n`
    pub lane_mask: u8,
}

/// What the capture loop needs from the analog-to-digital converter
pub trait AdcPeripheral {
    /// Program clock divider, averaging depth and enabled lanes
    fn configure(&mut self, setup: &AdcSetup) -> Result<(), ConfigError>;
    /// Fire one conversion sweep over the enabled lanes
    fn trigger(&mut self, lane_mask: u8);
    /// Number of result words waiting to be read
    fn ready(&mut self) -> usize;
    /// Pop one tagged result word
    fn pop(&mut self) -> Option<u32>;

    /// Pop a whole sweep, returning how many words were read
    fn read_set(&mut self, out: &mut [u32; LANES]) -> usize {
        let mut n = 0;
        for word in out.iter_mut() {
            match self.pop() {
                Some(w) => *word = w,
                None => break,
            }
            n += 1;
        }
        n
    }
}

/// Free-running tick counter used to timestamp sample sets
pub trait CycleCounter {
    /// Ticks since the last restart
    fn elapsed(&self) -> u32;
    fn restart(&mut self);
}

/// One multi-channel reading, in requested channel order
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SampleSet {
    values: [u16; LANES],
    len: usize,
}

impl SampleSet {
    pub fn from_slice(values: &[u16]) -> Self {
        let mut set = Self::default();
        for (dst, src) in set.values.iter_mut().zip(values) {
            *dst = *src;
            set.len += 1;
        }
        set
    }

    #[inline]
    pub fn as_slice(&self) -> &[u16] {
        &self.values[..self.len]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureState {
    /// Throw away results left over from before the session
    Draining,
    /// Waiting for the pacing gap, then fire a sweep
    Triggering,
    /// Sweep in progress
    Awaiting,
    /// A full sweep is queued
    Collecting,
}

pub struct AdcCapture {
    state: CaptureState,
    channel_count: usize,
    /// Physical lane -> logical slot (or DUMP)
    index: [usize; LANES],
    /// One extra slot used as the dump
    values: [u16; LANES + 1],
    min_cycle_gap: u32,
}

impl AdcCapture {
    /// Validate `config`, build the lane remap and program the peripheral
    pub fn open<A: AdcPeripheral>(config: &StartConfig, adc: &mut A) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut index = [DUMP; LANES];
        for (slot, &lane) in config.channels().iter().enumerate() {
            index[lane as usize] = slot;
        }
        adc.configure(&AdcSetup {
            clock_divider: config.clock_divider,
            averaging_exponent: config.averaging_exponent,
            // The sweep always covers every lane, unused ones go to the dump
            lane_mask: ALL_LANES,
        })?;
        Ok(Self {
            state: CaptureState::Draining,
            channel_count: config.channel_count(),
            index,
            values: [0; LANES + 1],
            min_cycle_gap: config.min_cycle_gap,
        })
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    /// Advance one step. `elapsed` is the tick count since the previous
    /// accepted sample set. Never blocks.
    pub fn poll<A: AdcPeripheral>(&mut self, adc: &mut A, elapsed: u32) -> Option<SampleSet> {
        match self.state {
            CaptureState::Draining => {
                let stale = adc.ready();
                for _ in 0..stale {
                    adc.pop();
                }
                if stale > 0 {
                    trace!(stale, "Discarded stale conversions");
                }
                self.state = CaptureState::Triggering;
                None
            }
            CaptureState::Triggering => {
                if elapsed < self.min_cycle_gap {
                    return None;
                }
                adc.trigger(ALL_LANES);
                self.state = CaptureState::Awaiting;
                None
            }
            CaptureState::Awaiting => {
                if adc.ready() >= LANES {
                    self.state = CaptureState::Collecting;
                }
                None
            }
            CaptureState::Collecting => {
                self.state = CaptureState::Triggering;
                let mut raw = [0u32; LANES];
                let n = adc.read_set(&mut raw);
                if n < LANES {
                    warn!(n, "Short conversion sweep");
                    return None;
                }
                for word in raw {
                    let lane = ((word >> LANE_TAG_SHIFT) & LANE_TAG_MASK) as usize;
                    let slot = self.index.get(lane).copied().unwrap_or(DUMP);
                    self.values[slot] = (word & CODE_MASK) as u16;
                }
                Some(SampleSet::from_slice(&self.values[..self.channel_count]))
            }
        }
    }
}
