//! Multi-channel ADC streaming between a cooperative coprocessor loop and a
//! host reader.
//!
//! The coprocessor half ([`controller`], [`adc`], [`pool`], [`packer`],
//! [`channel`]) never allocates and never blocks: every step is a bounded poll
//! over storage owned by the controller value. The host half ([`host`]) does
//! blocking reads of whole frames and turns raw codes into volts.

pub mod adc;
pub mod channel;
pub mod controller;
pub mod host;
pub mod loopback;
pub mod monitoring;
pub mod packer;
pub mod pool;
pub mod protocol;
pub mod sim;

pub use adc::{AdcCapture, AdcPeripheral, CaptureState, CycleCounter, SampleSet};
pub use channel::{ChannelWatcher, NotReady, ReadinessWait, Transport};
pub use controller::{CaptureController, ControllerStats};
pub use host::{FrameReadout, HostError, HostLink, HostOptions, HostSession};
pub use monitoring::CaptureMonitor;
pub use packer::{FramePacker, PushOutcome, SendFailurePolicy};
pub use pool::{BufferPool, Slot};
pub use protocol::{ConfigError, ControlMessage, StartConfig, WireError};

/// Size of an rpmsg buffer, header included
pub const RPMSG_BUF_SIZE: usize = 512;
/// Bytes of every rpmsg buffer reserved for the transport header
pub const RPMSG_HEADER_SIZE: usize = 16;
/// Largest payload a single channel message can carry
pub const MAX_PAYLOAD: usize = RPMSG_BUF_SIZE - RPMSG_HEADER_SIZE;

/// Number of frame buffers (and so credits) on the coprocessor
pub const RING_SIZE: usize = 8;

/// Physical analog lanes the converter sweeps every cycle
pub const LANES: usize = 8;

/// Full-scale input voltage of the converter
pub const V_REF: f32 = 1.8;
/// Largest code a 12 bit conversion produces
pub const CODE_MAX: u16 = 4095;

/// Cycle counter frequency (one tick is 5ns)
pub const CYCLE_CLOCK_HZ: u32 = 200_000_000;

/// Convert a raw conversion code to volts
#[inline]
pub fn code_to_volts(code: u16) -> f32 {
    code as f32 * V_REF / CODE_MAX as f32
}

/// Minimum cycle gap that paces capture at `rate_hz` sample sets per second.
/// A rate of zero (or one faster than the clock) disables pacing.
pub fn cycle_gap_for_rate(rate_hz: u32) -> u32 {
    if rate_hz == 0 {
        return 0;
    }
    CYCLE_CLOCK_HZ / rate_hz
}

/// Convert cycle counter ticks into seconds
#[inline]
pub fn ticks_to_seconds(ticks: u32) -> f64 {
    ticks as f64 / CYCLE_CLOCK_HZ as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_payload_size() {
        assert_eq!(MAX_PAYLOAD, 496);
    }

    #[test]
    fn test_code_to_volts() {
        assert_abs_diff_eq!(code_to_volts(0), 0.0);
        assert_abs_diff_eq!(code_to_volts(CODE_MAX), V_REF, epsilon = 1e-6);
        assert_abs_diff_eq!(code_to_volts(2048), 0.900_22, epsilon = 1e-4);
    }

    #[test]
    fn test_rate_pacing() {
        assert_eq!(cycle_gap_for_rate(0), 0);
        assert_eq!(cycle_gap_for_rate(3000), 66_666);
        assert_eq!(cycle_gap_for_rate(CYCLE_CLOCK_HZ), 1);
        assert_abs_diff_eq!(ticks_to_seconds(200), 1e-6, epsilon = 1e-12);
    }
}
