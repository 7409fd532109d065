//! Running statistics over the frames a host session delivers

use std::time::{Duration, Instant};

use tracing::info;

use crate::{host::FrameReadout, CYCLE_CLOCK_HZ};

#[derive(Debug)]
pub struct CaptureMonitor {
    started: Instant,
    frames: u64,
    records: u64,
    dropped: u64,
    saturated_frames: u64,
    ticks: u64,
}

impl Default for CaptureMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureMonitor {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            frames: 0,
            records: 0,
            dropped: 0,
            saturated_frames: 0,
            ticks: 0,
        }
    }

    pub fn observe(&mut self, frame: &FrameReadout) {
        self.frames += 1;
        self.records += frame.len() as u64;
        if frame.loss_unknown() {
            // Count is a floor, the real loss is unknown
            self.saturated_frames += 1;
        }
        self.dropped += frame.dropped as u64;
        self.ticks += frame.timestamps.iter().map(|&t| t as u64).sum::<u64>();
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn saturated_frames(&self) -> u64 {
        self.saturated_frames
    }

    /// Fraction of sample sets that never reached the host
    pub fn loss_ratio(&self) -> f64 {
        let total = self.records + self.dropped;
        if total == 0 {
            0.0
        } else {
            self.dropped as f64 / total as f64
        }
    }

    /// Delivered sample sets per second of coprocessor time
    pub fn sample_rate(&self) -> Option<f64> {
        if self.ticks == 0 {
            return None;
        }
        let seconds = self.ticks as f64 / CYCLE_CLOCK_HZ as f64;
        Some(self.records as f64 / seconds)
    }

    /// Delivered sample sets per second of host wall time
    pub fn wall_rate(&self) -> f64 {
        let elapsed = self.started.elapsed().max(Duration::from_micros(1));
        self.records as f64 / elapsed.as_secs_f64()
    }

    pub fn report(&self) {
        info!(
            frames = self.frames,
            records = self.records,
            dropped = self.dropped,
            saturated = self.saturated_frames,
            loss = %format!("{:.3}%", self.loss_ratio() * 100.0),
            rate_hz = ?self.sample_rate(),
            wall_rate = %format!("{:.1} Hz", self.wall_rate()),
            "Capture summary"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DROPPED_SATURATED;
    use approx::assert_relative_eq;

    fn readout(dropped: u16, timestamps: Vec<u32>) -> FrameReadout {
        FrameReadout {
            dropped,
            channel_count: 1,
            volts: vec![0.0; timestamps.len()],
            timestamps,
        }
    }

    #[test]
    fn test_empty_monitor() {
        let monitor = CaptureMonitor::new();
        assert_eq!(monitor.loss_ratio(), 0.0);
        assert_eq!(monitor.sample_rate(), None);
    }

    #[test]
    fn test_tallies() {
        let mut monitor = CaptureMonitor::new();
        // 1 kHz worth of ticks
        monitor.observe(&readout(0, vec![200_000; 3]));
        monitor.observe(&readout(2, vec![200_000; 3]));
        monitor.observe(&readout(DROPPED_SATURATED, vec![200_000; 2]));
        assert_eq!(monitor.frames(), 3);
        assert_eq!(monitor.records(), 8);
        assert_eq!(monitor.dropped(), 2 + DROPPED_SATURATED as u64);
        assert_eq!(monitor.saturated_frames(), 1);
        assert_relative_eq!(monitor.sample_rate().unwrap(), 1000.0, epsilon = 1e-9);
        assert_relative_eq!(
            monitor.loss_ratio(),
            monitor.dropped() as f64 / (monitor.dropped() + 8) as f64
        );
        assert!(monitor.wall_rate() > 0.0);
    }
}
