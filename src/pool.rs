//! Fixed pool of frame buffers with credit accounting.
//!
//! Every slot handed out costs one credit. Credits come back through
//! [`BufferPool::release`], driven by host acknowledgements, and are fungible:
//! a release does not name the slot it frees. Slots are handed out in ring
//! order, so a slot is only reused once `RING_SIZE` credits have cycled.

use tracing::warn;

use crate::{MAX_PAYLOAD, RING_SIZE};

/// Handle to one buffer of the pool
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Slot(usize);

impl Slot {
    pub fn index(&self) -> usize {
        self.0
    }
}

pub struct BufferPool {
    available: usize,
    head: usize,
    slots: [[u8; MAX_PAYLOAD]; RING_SIZE],
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            available: RING_SIZE,
            head: 0,
            slots: [[0u8; MAX_PAYLOAD]; RING_SIZE],
        }
    }

    /// Credits currently held
    #[inline]
    pub fn available(&self) -> usize {
        self.available
    }

    /// Credits spent on frames the host has not acknowledged yet
    #[inline]
    pub fn in_flight(&self) -> usize {
        RING_SIZE - self.available
    }

    /// Take the next slot, or `None` when every credit is spent
    pub fn allocate(&mut self) -> Option<Slot> {
        if self.available == 0 {
            return None;
        }
        let slot = Slot(self.head);
        // RING_SIZE is a power of 2
        self.head = (self.head + 1) & (RING_SIZE - 1);
        self.available -= 1;
        Some(slot)
    }

    /// Return one credit. Returns false (and keeps the pool full) when there is
    /// no outstanding credit to return.
    pub fn release(&mut self) -> bool {
        if self.available == RING_SIZE {
            warn!("Credit returned with no buffer in flight");
            return false;
        }
        self.available += 1;
        true
    }

    /// Undo the most recent [`Self::allocate`] for a slot that never reached
    /// the host, so the ring hands that same slot out next. Any other slot is
    /// refused, since later slots may still be waiting for an ack.
    pub fn unallocate(&mut self, slot: Slot) -> bool {
        let last = self.head.wrapping_sub(1) & (RING_SIZE - 1);
        if slot.0 != last || self.available == RING_SIZE {
            warn!(slot = slot.0, last, "Only the newest slot can be handed back");
            return false;
        }
        self.head = last;
        self.available += 1;
        true
    }

    /// Forget every outstanding credit
    pub fn reset(&mut self) {
        self.available = RING_SIZE;
        self.head = 0;
    }

    pub fn slot(&self, slot: Slot) -> &[u8; MAX_PAYLOAD] {
        &self.slots[slot.0]
    }

    pub fn slot_mut(&mut self, slot: Slot) -> &mut [u8; MAX_PAYLOAD] {
        &mut self.slots[slot.0]
    }
}
