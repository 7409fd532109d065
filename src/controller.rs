//! The coprocessor main loop.
//!
//! One owned value holds the whole coprocessor state: peripheral, transport,
//! cycle counter, buffer pool, packer, channel watcher and the receive staging
//! area. Each [`CaptureController::tick`] first handles every pending control
//! message, then advances capture by one step, so a Stop or Ack is always seen
//! before the next sample set is produced or the next credit is spent.

use tracing::{debug, trace, warn};

use crate::{
    adc::{AdcCapture, AdcPeripheral, CaptureState, CycleCounter},
    channel::{ChannelWatcher, NotReady, ReadinessWait, Transport},
    packer::{FramePacker, PushOutcome, SendFailurePolicy},
    pool::BufferPool,
    protocol::{ControlMessage, StartConfig},
    MAX_PAYLOAD,
};

/// Running totals, mostly for diagnostics
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ControllerStats {
    pub ticks: u64,
    pub sessions: u64,
    pub sample_sets: u64,
    pub frames_sent: u64,
    pub send_failures: u64,
    /// Sample sets lost to backpressure or failed sends
    pub dropped_sets: u64,
    /// Foreign traffic and commands that did not apply in the current state
    pub ignored_messages: u64,
    /// Acks that arrived with no credit outstanding
    pub surplus_acks: u64,
    pub rejected_starts: u64,
}

pub struct CaptureController<A, T, C> {
    adc: A,
    transport: T,
    clock: C,
    watcher: ChannelWatcher,
    pool: BufferPool,
    packer: FramePacker,
    capture: Option<AdcCapture>,
    policy: SendFailurePolicy,
    rx: [u8; MAX_PAYLOAD],
    stats: ControllerStats,
}

impl<A, T, C> CaptureController<A, T, C>
where
    A: AdcPeripheral,
    T: Transport,
    C: CycleCounter,
{
    /// Build a controller over a transport that is already connected
    pub fn new(adc: A, transport: T, clock: C) -> Self {
        Self {
            adc,
            transport,
            clock,
            watcher: ChannelWatcher::new(),
            pool: BufferPool::new(),
            packer: FramePacker::new(0, 0, SendFailurePolicy::default()),
            capture: None,
            policy: SendFailurePolicy::default(),
            rx: [0; MAX_PAYLOAD],
            stats: ControllerStats::default(),
        }
    }

    /// Wait for the host side and announce the channel before building the
    /// controller
    pub fn connect(
        adc: A,
        mut transport: T,
        clock: C,
        wait: ReadinessWait,
    ) -> Result<Self, NotReady> {
        let watcher = ChannelWatcher::connect(&mut transport, wait)?;
        let mut controller = Self::new(adc, transport, clock);
        controller.watcher = watcher;
        Ok(controller)
    }

    pub fn with_policy(mut self, policy: SendFailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Tear the channel down and hand the collaborators back
    pub fn shutdown(mut self, wait: ReadinessWait) -> Result<(A, T, C), NotReady> {
        ChannelWatcher::disconnect(&mut self.transport, wait)?;
        Ok((self.adc, self.transport, self.clock))
    }

    pub fn is_active(&self) -> bool {
        self.capture.is_some()
    }

    pub fn capture_state(&self) -> Option<CaptureState> {
        self.capture.as_ref().map(AdcCapture::state)
    }

    pub fn stats(&self) -> &ControllerStats {
        &self.stats
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn packer(&self) -> &FramePacker {
        &self.packer
    }

    pub fn adc_mut(&mut self) -> &mut A {
        &mut self.adc
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn clock_mut(&mut self) -> &mut C {
        &mut self.clock
    }

    /// Tick until `keep_running` says otherwise
    pub fn run(&mut self, keep_running: impl Fn() -> bool) {
        while keep_running() {
            self.tick();
        }
    }

    pub fn tick(&mut self) {
        self.stats.ticks += 1;

        // Control first, always
        while let Some(len) = self.watcher.poll(&mut self.transport, &mut self.rx) {
            self.handle(len);
        }

        let capture = match self.capture.as_mut() {
            Some(capture) => capture,
            None => return,
        };
        let elapsed = self.clock.elapsed();
        let set = match capture.poll(&mut self.adc, elapsed) {
            Some(set) => set,
            None => return,
        };
        self.clock.restart();
        self.stats.sample_sets += 1;

        match self
            .packer
            .push(&mut self.pool, &mut self.transport, elapsed, set.as_slice())
        {
            PushOutcome::Buffered => {}
            PushOutcome::Dropped => self.stats.dropped_sets += 1,
            PushOutcome::Sent { .. } => self.stats.frames_sent += 1,
            PushOutcome::SendFailed { records } => {
                self.stats.send_failures += 1;
                self.stats.dropped_sets += records as u64;
            }
        }
    }

    fn handle(&mut self, len: usize) {
        let msg = match self.rx.get(..len).and_then(ControlMessage::decode) {
            Some(msg) => msg,
            None => {
                trace!(len, "Ignoring foreign message");
                self.stats.ignored_messages += 1;
                return;
            }
        };

        match msg {
            ControlMessage::Start(config) if self.capture.is_none() => self.start(&config),
            ControlMessage::Ack if self.capture.is_some() => {
                // Host finished with one frame
                if !self.pool.release() {
                    self.stats.surplus_acks += 1;
                }
            }
            ControlMessage::Stop if self.capture.is_some() => {
                debug!(stats = ?self.stats, "Session stopped");
                self.capture = None;
                self.packer.reset();
            }
            other => {
                trace!(kind = ?other.kind(), active = self.is_active(), "Ignoring control message");
                self.stats.ignored_messages += 1;
            }
        }
    }

    fn start(&mut self, config: &StartConfig) {
        match AdcCapture::open(config, &mut self.adc) {
            Ok(capture) => {
                // Credits from an earlier session will never be acked
                self.pool.reset();
                self.packer = FramePacker::for_config(config, self.policy);
                self.clock.restart();
                self.capture = Some(capture);
                self.stats.sessions += 1;
                debug!(
                    channels = ?config.channels(),
                    clock_divider = config.clock_divider,
                    averaging = config.averaging_exponent,
                    max_records = config.max_records_per_frame,
                    min_cycle_gap = config.min_cycle_gap,
                    "Session started"
                );
            }
            Err(err) => {
                warn!(%err, "Rejected start");
                self.stats.rejected_starts += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{records_per_frame, FrameView};
    use crate::sim::{ManualClock, RecordingTransport, SimAdc, Waveform};
    use crate::RING_SIZE;

    type TestController = CaptureController<SimAdc, RecordingTransport, ManualClock>;

    fn controller(waveform: Waveform) -> TestController {
        CaptureController::new(
            SimAdc::new(waveform),
            RecordingTransport::new(),
            ManualClock::stepping(100),
        )
    }

    fn started(config: StartConfig) -> TestController {
        let mut c = controller(Waveform::LaneTagged);
        c.transport_mut().queue_control(ControlMessage::Start(config));
        c.tick();
        assert!(c.is_active());
        c
    }

    fn tick_until_sets(c: &mut TestController, sets: u64) {
        for _ in 0..10_000 {
            if c.stats().sample_sets >= sets {
                return;
            }
            c.tick();
        }
        panic!("only {} sample sets produced", c.stats().sample_sets);
    }

    #[test]
    fn test_session_produces_frames() {
        let mut c = started(StartConfig::new(&[5, 1]).with_max_records(3));
        tick_until_sets(&mut c, 6);
        assert_eq!(c.stats().frames_sent, 2);
        let sent = c.transport_mut().take_sent();
        for frame in &sent {
            let view = FrameView::parse(frame, 2).unwrap();
            assert_eq!(view.record_count(), 3);
            assert_eq!(view.dropped_count(), 0);
            for record in view.records() {
                assert!(record.elapsed_cycles() > 0);
                let lanes: Vec<u16> = record.samples().map(|s| s >> 8).collect();
                assert_eq!(lanes, vec![5, 1]);
            }
        }
        assert_eq!(c.pool().available(), RING_SIZE - 2);
    }

    #[test]
    fn test_start_ignored_while_active() {
        let mut c = started(StartConfig::new(&[0]));
        c.transport_mut()
            .queue_control(ControlMessage::Start(StartConfig::new(&[1, 2])));
        c.tick();
        assert_eq!(c.stats().sessions, 1);
        assert_eq!(c.stats().ignored_messages, 1);
        assert_eq!(c.packer().open_records(), 0);
        // Still capturing one channel
        tick_until_sets(&mut c, 1);
        assert_eq!(c.packer().open_records(), 1);
    }

    #[test]
    fn test_stop_without_session_is_ignored() {
        let mut c = controller(Waveform::Constant(0));
        c.transport_mut().queue_control(ControlMessage::Stop);
        c.tick();
        assert!(!c.is_active());
        assert_eq!(c.stats().ignored_messages, 1);
    }

    #[test]
    fn test_ack_without_session_is_noop() {
        let mut c = controller(Waveform::Constant(0));
        c.transport_mut().queue_control(ControlMessage::Ack);
        c.tick();
        assert_eq!(c.pool().available(), RING_SIZE);
        assert_eq!(c.stats().ignored_messages, 1);
        assert_eq!(c.stats().surplus_acks, 0);
    }

    #[test]
    fn test_acks_return_credits() {
        let mut c = started(StartConfig::new(&[0]).with_max_records(1));
        tick_until_sets(&mut c, 3);
        assert_eq!(c.pool().available(), RING_SIZE - 3);
        c.transport_mut().queue_control(ControlMessage::Ack);
        c.transport_mut().queue_control(ControlMessage::Ack);
        c.tick();
        assert_eq!(c.pool().available(), RING_SIZE - 1);

        // More acks than frames in flight
        for _ in 0..3 {
            c.transport_mut().queue_control(ControlMessage::Ack);
        }
        c.tick();
        assert_eq!(c.pool().available(), RING_SIZE);
        assert!(c.stats().surplus_acks >= 1);
    }

    #[test]
    fn test_backpressure_reported_in_next_frame() {
        let mut c = started(StartConfig::new(&[3]).with_max_records(1));
        tick_until_sets(&mut c, RING_SIZE as u64 + 5);
        assert_eq!(c.stats().frames_sent, RING_SIZE as u64);
        assert_eq!(c.stats().dropped_sets, 5);

        c.transport_mut().take_sent();
        c.transport_mut().queue_control(ControlMessage::Ack);
        let before = c.stats().sample_sets;
        tick_until_sets(&mut c, before + 1);
        let sent = c.transport_mut().take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(FrameView::parse(&sent[0], 1).unwrap().dropped_count(), 5);
    }

    #[test]
    fn test_stop_seen_before_next_sample() {
        let mut c = started(StartConfig::new(&[0]));
        while c.capture_state() != Some(CaptureState::Collecting) {
            c.tick();
        }
        let sets = c.stats().sample_sets;
        c.transport_mut().queue_control(ControlMessage::Stop);
        c.tick();
        assert!(!c.is_active());
        assert_eq!(c.stats().sample_sets, sets);
        // Nothing more happens until the next start
        for _ in 0..20 {
            c.tick();
        }
        assert_eq!(c.stats().sample_sets, sets);
    }

    #[test]
    fn test_restart_resets_pool() {
        let mut c = started(StartConfig::new(&[0]).with_max_records(1));
        tick_until_sets(&mut c, 4);
        c.transport_mut().queue_control(ControlMessage::Stop);
        // Ack after stop is dropped
        c.transport_mut().queue_control(ControlMessage::Ack);
        c.tick();
        assert_eq!(c.pool().available(), RING_SIZE - 4);
        c.transport_mut()
            .queue_control(ControlMessage::Start(StartConfig::new(&[0])));
        c.tick();
        assert_eq!(c.stats().sessions, 2);
        assert_eq!(c.pool().available(), RING_SIZE);
    }

    #[test]
    fn test_invalid_start_rejected() {
        let mut c = controller(Waveform::Constant(0));
        c.transport_mut()
            .queue_control(ControlMessage::Start(StartConfig::new(&[4, 4])));
        c.tick();
        assert!(!c.is_active());
        assert_eq!(c.stats().rejected_starts, 1);

        c.adc_mut().refuse_configuration(true);
        c.transport_mut()
            .queue_control(ControlMessage::Start(StartConfig::new(&[4])));
        c.tick();
        assert!(!c.is_active());
        assert_eq!(c.stats().rejected_starts, 2);
    }

    #[test]
    fn test_noise_ignored() {
        let mut c = controller(Waveform::Constant(0));
        c.transport_mut().queue_inbound(&[0xde, 0xad, 0x01, 0x00]);
        c.transport_mut().queue_inbound(&[0xef]);
        c.tick();
        assert!(!c.is_active());
        assert_eq!(c.stats().ignored_messages, 2);
    }

    #[test]
    fn test_pacing_spaces_records() {
        let mut c = started(StartConfig::new(&[0]).with_min_cycle_gap(1000).with_max_records(4));
        tick_until_sets(&mut c, 4);
        let sent = c.transport_mut().take_sent();
        let view = FrameView::parse(&sent[0], 1).unwrap();
        for record in view.records() {
            assert!(record.elapsed_cycles() >= 1000);
        }
    }

    #[test]
    fn test_full_frames_without_cap() {
        let mut c = started(StartConfig::new(&[0, 1, 2, 3, 4, 5, 6, 7]));
        let per_frame = records_per_frame(8, 0) as u64;
        tick_until_sets(&mut c, per_frame);
        assert_eq!(c.stats().frames_sent, 1);
    }

    #[test]
    fn test_connect_and_shutdown() {
        let mut transport = RecordingTransport::new();
        transport.set_ready_after(2);
        let c = CaptureController::connect(
            SimAdc::new(Waveform::Constant(0)),
            transport,
            ManualClock::new(),
            ReadinessWait::Attempts(5),
        )
        .unwrap();
        assert!(c.transport().is_open());
        let (_, transport, _) = c.shutdown(ReadinessWait::Unbounded).unwrap();
        assert!(!transport.is_open());
    }
}
