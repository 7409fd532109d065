//! Packs sample sets into pool buffers and flushes full frames.
//!
//! Backpressure is purely credit based: when the pool has no free slot the
//! sample set is discarded and counted. The count rides along in the
//! `dropped_count` of the next frame that gets a slot, so the host learns
//! about losses late but exactly.

use tracing::{trace, warn};

use crate::{
    channel::Transport,
    pool::{BufferPool, Slot},
    protocol::{
        record_len, write_record, FrameHeader, StartConfig, DROPPED_SATURATED, FRAME_HEADER_LEN,
    },
    MAX_PAYLOAD,
};

/// What to do with a frame whose send failed
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SendFailurePolicy {
    /// Give the slot's credit back and count the lost records as drops
    #[default]
    ReleaseSlot,
    /// Keep the slot open for the next sample set and mark the frame's drop
    /// count as unknown ([`DROPPED_SATURATED`])
    PinSlot,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushOutcome {
    /// Appended to the open frame
    Buffered,
    /// No slot available (or the set didn't match the frame), counted as lost
    Dropped,
    /// Frame filled up and went out
    Sent { records: u16 },
    /// Frame filled up but the transport refused it
    SendFailed { records: u16 },
}

#[derive(Clone, Copy, Debug)]
struct OpenFrame {
    slot: Slot,
    len: usize,
    header: FrameHeader,
}

pub struct FramePacker {
    open: Option<OpenFrame>,
    dropped: u16,
    channel_count: usize,
    max_records: usize,
    policy: SendFailurePolicy,
}

impl FramePacker {
    pub fn new(
        channel_count: usize,
        max_records_per_frame: u32,
        policy: SendFailurePolicy,
    ) -> Self {
        Self {
            open: None,
            dropped: 0,
            channel_count,
            max_records: max_records_per_frame as usize,
            policy,
        }
    }

    pub fn for_config(config: &StartConfig, policy: SendFailurePolicy) -> Self {
        Self::new(config.channel_count(), config.max_records_per_frame, policy)
    }

    /// Sets lost since the last frame that got a slot
    pub fn pending_dropped(&self) -> u16 {
        self.dropped
    }

    /// Records in the frame currently being filled
    pub fn open_records(&self) -> usize {
        self.open.map_or(0, |f| f.header.record_count as usize)
    }

    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    pub fn policy(&self) -> SendFailurePolicy {
        self.policy
    }

    /// Forget the open frame and the drop counter. The open frame's credit is
    /// not returned.
    pub fn reset(&mut self) {
        self.open = None;
        self.dropped = 0;
    }

    fn count_drops(&mut self, n: u16) {
        self.dropped = self.dropped.saturating_add(n);
    }

    /// Append one sample set, flushing the frame through `transport` when it
    /// is full
    pub fn push<T: Transport>(
        &mut self,
        pool: &mut BufferPool,
        transport: &mut T,
        elapsed_cycles: u32,
        samples: &[u16],
    ) -> PushOutcome {
        if samples.len() != self.channel_count {
            warn!(
                expected = self.channel_count,
                got = samples.len(),
                "Sample set does not match the session"
            );
            self.count_drops(1);
            return PushOutcome::Dropped;
        }

        let mut frame = match self.open.take() {
            Some(frame) => frame,
            None => match pool.allocate() {
                Some(slot) => {
                    let frame = OpenFrame {
                        slot,
                        len: FRAME_HEADER_LEN,
                        header: FrameHeader {
                            record_count: 0,
                            dropped_count: self.dropped,
                        },
                    };
                    self.dropped = 0;
                    frame
                }
                None => {
                    // No more buffers!
                    self.count_drops(1);
                    return PushOutcome::Dropped;
                }
            },
        };

        match write_record(pool.slot_mut(frame.slot), frame.len, elapsed_cycles, samples) {
            Ok(end) => frame.len = end,
            Err(err) => {
                warn!(%err, "Record does not fit the frame");
                self.count_drops(1);
                self.open = Some(frame);
                return PushOutcome::Dropped;
            }
        }
        frame.header.record_count += 1;

        let full = frame.len + record_len(self.channel_count) > MAX_PAYLOAD;
        let capped =
            self.max_records != 0 && frame.header.record_count as usize >= self.max_records;
        if !(full || capped) {
            self.open = Some(frame);
            return PushOutcome::Buffered;
        }
        self.flush(pool, transport, frame)
    }

    fn flush<T: Transport>(
        &mut self,
        pool: &mut BufferPool,
        transport: &mut T,
        mut frame: OpenFrame,
    ) -> PushOutcome {
        let records = frame.header.record_count;
        let buf = pool.slot_mut(frame.slot);
        let sent = frame.header.write(&mut buf[..]).is_ok() && transport.send(&buf[..frame.len]);
        if sent {
            trace!(slot = frame.slot.index(), records, "Frame sent");
            // The slot's credit comes back with the host's ack
            return PushOutcome::Sent { records };
        }

        warn!(records, policy = ?self.policy, "Frame send failed");
        match self.policy {
            SendFailurePolicy::PinSlot => {
                frame.header = FrameHeader {
                    record_count: 0,
                    dropped_count: DROPPED_SATURATED,
                };
                frame.len = FRAME_HEADER_LEN;
                self.dropped = 0;
                self.open = Some(frame);
            }
            SendFailurePolicy::ReleaseSlot => {
                // No ack will ever come for this frame, so the same slot goes
                // out next instead of one still awaiting an ack
                if !pool.unallocate(frame.slot) {
                    pool.release();
                }
                self.count_drops(frame.header.dropped_count);
                self.count_drops(records);
            }
        }
        PushOutcome::SendFailed { records }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{frame_len, records_per_frame, FrameView};
    use crate::sim::RecordingTransport;
    use crate::RING_SIZE;

    fn parse(bytes: &[u8], channels: usize) -> FrameView<'_> {
        FrameView::parse(bytes, channels).unwrap()
    }

    #[test]
    fn test_flush_on_byte_capacity() {
        let mut pool = BufferPool::new();
        let mut transport = RecordingTransport::new();
        let mut packer = FramePacker::new(8, 0, SendFailurePolicy::default());
        let per_frame = records_per_frame(8, 0);
        for i in 0..per_frame - 1 {
            assert_eq!(
                packer.push(&mut pool, &mut transport, i as u32, &[i as u16; 8]),
                PushOutcome::Buffered
            );
        }
        assert_eq!(
            packer.push(&mut pool, &mut transport, 0, &[0; 8]),
            PushOutcome::Sent {
                records: per_frame as u16
            }
        );
        assert!(!packer.is_open());
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].len(), frame_len(8, per_frame));
        let view = parse(&sent[0], 8);
        assert_eq!(view.record_count(), per_frame);
        assert_eq!(view.dropped_count(), 0);
        let first = view.records().nth(1).unwrap();
        assert_eq!(first.elapsed_cycles(), 1);
        assert!(first.samples().all(|s| s == 1));
        // Credit stays spent until acked
        assert_eq!(pool.available(), RING_SIZE - 1);
    }

    #[test]
    fn test_flush_on_record_cap() {
        let mut pool = BufferPool::new();
        let mut transport = RecordingTransport::new();
        let mut packer = FramePacker::new(2, 4, SendFailurePolicy::default());
        for _ in 0..3 {
            assert_eq!(
                packer.push(&mut pool, &mut transport, 5, &[1, 2]),
                PushOutcome::Buffered
            );
        }
        assert_eq!(
            packer.push(&mut pool, &mut transport, 5, &[1, 2]),
            PushOutcome::Sent { records: 4 }
        );
        assert_eq!(transport.sent()[0].len(), frame_len(2, 4));
        assert!(frame_len(2, 4) + record_len(2) < MAX_PAYLOAD);
    }

    #[test]
    fn test_pool_exhaustion_counts_drops() {
        let mut pool = BufferPool::new();
        let mut transport = RecordingTransport::new();
        let mut packer = FramePacker::new(1, 1, SendFailurePolicy::default());

        // 10 sets, one per frame, only 8 credits
        let outcomes: Vec<_> = (0..10)
            .map(|_| packer.push(&mut pool, &mut transport, 1, &[7]))
            .collect();
        assert_eq!(
            outcomes.iter().filter(|o| matches!(o, PushOutcome::Sent { .. })).count(),
            RING_SIZE
        );
        assert_eq!(&outcomes[RING_SIZE..], &[PushOutcome::Dropped; 2]);
        assert_eq!(packer.pending_dropped(), 2);
        assert_eq!(pool.available(), 0);

        // Host acks one frame, the next frame reports the two losses
        pool.release();
        packer.push(&mut pool, &mut transport, 1, &[7]);
        let last = transport.sent().last().unwrap();
        assert_eq!(parse(last, 1).dropped_count(), 2);
        assert_eq!(packer.pending_dropped(), 0);
    }

    #[test]
    fn test_drops_since_last_delivered_frame() {
        let mut pool = BufferPool::new();
        let mut transport = RecordingTransport::new();
        let mut packer = FramePacker::new(1, 2, SendFailurePolicy::ReleaseSlot);
        for _ in 0..RING_SIZE {
            pool.allocate().unwrap();
        }
        for _ in 0..3 {
            packer.push(&mut pool, &mut transport, 1, &[0]);
        }
        pool.release();
        // Frame opens and fails to send, its 2 records plus the 3 stamped
        // drops carry over
        transport.fail_sends(1);
        packer.push(&mut pool, &mut transport, 1, &[0]);
        assert_eq!(
            packer.push(&mut pool, &mut transport, 1, &[0]),
            PushOutcome::SendFailed { records: 2 }
        );
        assert_eq!(pool.available(), 1);
        assert_eq!(packer.pending_dropped(), 5);
        packer.push(&mut pool, &mut transport, 1, &[0]);
        packer.push(&mut pool, &mut transport, 1, &[0]);
        assert_eq!(parse(&transport.sent()[0], 1).dropped_count(), 5);
    }

    #[test]
    fn test_drop_count_saturates() {
        let mut pool = BufferPool::new();
        let mut transport = RecordingTransport::new();
        let mut packer = FramePacker::new(1, 1, SendFailurePolicy::default());
        for _ in 0..RING_SIZE {
            pool.allocate().unwrap();
        }
        for _ in 0..70_000 {
            packer.push(&mut pool, &mut transport, 1, &[0]);
        }
        assert_eq!(packer.pending_dropped(), u16::MAX);
        pool.release();
        packer.push(&mut pool, &mut transport, 1, &[0]);
        assert_eq!(parse(&transport.sent()[0], 1).dropped_count(), u16::MAX);
    }

    #[test]
    fn test_send_failure_pins_slot() {
        let mut pool = BufferPool::new();
        let mut transport = RecordingTransport::new();
        let mut packer = FramePacker::new(3, 4, SendFailurePolicy::PinSlot);
        transport.fail_sends(1);
        for _ in 0..3 {
            packer.push(&mut pool, &mut transport, 9, &[1, 2, 3]);
        }
        assert_eq!(
            packer.push(&mut pool, &mut transport, 9, &[1, 2, 3]),
            PushOutcome::SendFailed { records: 4 }
        );
        // Slot kept, content reset, not returned to the pool
        assert!(packer.is_open());
        assert_eq!(packer.open_records(), 0);
        assert_eq!(pool.available(), RING_SIZE - 1);

        for _ in 0..4 {
            packer.push(&mut pool, &mut transport, 9, &[1, 2, 3]);
        }
        // Same slot reused, no new credit spent
        assert_eq!(pool.available(), RING_SIZE - 1);
        let view = parse(&transport.sent()[0], 3);
        assert_eq!(view.dropped_count(), DROPPED_SATURATED);
        assert_eq!(view.record_count(), 4);
    }

    #[test]
    fn test_send_failure_releases_slot() {
        let mut pool = BufferPool::new();
        let mut transport = RecordingTransport::new();
        let mut packer = FramePacker::new(1, 3, SendFailurePolicy::ReleaseSlot);
        transport.fail_sends(1);
        for _ in 0..3 {
            packer.push(&mut pool, &mut transport, 1, &[0]);
        }
        assert!(!packer.is_open());
        assert_eq!(pool.available(), RING_SIZE);
        assert_eq!(packer.pending_dropped(), 3);
    }

    #[test]
    fn test_failed_slot_is_reused_before_unacked_ones() {
        let mut pool = BufferPool::new();
        let mut transport = RecordingTransport::new();
        let mut packer = FramePacker::new(1, 1, SendFailurePolicy::ReleaseSlot);

        // Slot 0 goes out and is never acked
        assert_eq!(
            packer.push(&mut pool, &mut transport, 1, &[0]),
            PushOutcome::Sent { records: 1 }
        );
        // Slot 1 fails and comes straight back
        transport.fail_sends(1);
        assert_eq!(
            packer.push(&mut pool, &mut transport, 1, &[1]),
            PushOutcome::SendFailed { records: 1 }
        );
        assert_eq!(pool.available(), RING_SIZE - 1);
        for i in 0..RING_SIZE - 2 {
            assert_eq!(
                packer.push(&mut pool, &mut transport, 1, &[i as u16]),
                PushOutcome::Sent { records: 1 }
            );
        }
        // Seven frames await acks, slot 0's among them
        assert_eq!(pool.in_flight(), RING_SIZE - 1);
        assert_eq!(pool.allocate().map(|s| s.index()), Some(RING_SIZE - 1));
        assert_eq!(pool.allocate(), None);
    }

    #[test]
    fn test_mismatched_set_is_dropped() {
        let mut pool = BufferPool::new();
        let mut transport = RecordingTransport::new();
        let mut packer = FramePacker::new(2, 0, SendFailurePolicy::default());
        assert_eq!(
            packer.push(&mut pool, &mut transport, 1, &[0]),
            PushOutcome::Dropped
        );
        assert_eq!(packer.pending_dropped(), 1);
        assert_eq!(pool.available(), RING_SIZE);
    }
}
