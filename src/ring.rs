//! Ring metadata and the producer/consumer counter algebra.
//!
//! Every ring shared with the modem is described by a [`RingMetadata`]
//! block. The indices `pi`/`ci` select slots; the free-running counters
//! `pc`/`cc` tell full from empty when the indices coincide:
//!
//! ```text
//!   occupancy = pc - cc  (mod 2^32)
//!   empty  ⇔ occupancy == 0
//!   full   ⇔ occupancy == ring_size
//! ```
//!
//! The producer owns `pi`/`pc`, the consumer owns `ci`/`cc`. A side writes
//! its slot first and then publishes its counter with release ordering; the
//! other side reads the counter with acquire ordering before touching the
//! slot. Neither side ever writes the other's fields.

use crate::memory::SharedLayout;
use std::sync::atomic::{AtomicU32, Ordering};

/// Metadata of one ring, as laid out in shared memory.
#[repr(C)]
#[derive(Debug, Default)]
pub struct RingMetadata {
    ring_size: AtomicU32,
    msg_size: AtomicU32,
    pi: AtomicU32,
    ci: AtomicU32,
    pc: AtomicU32,
    cc: AtomicU32,
}

// SAFETY: repr(C), only atomics.
unsafe impl SharedLayout for RingMetadata {}

const _: () = assert!(std::mem::size_of::<RingMetadata>() == 24);

/// A point-in-time copy of a ring's metadata.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingState {
    /// Capacity in slots.
    pub ring_size: u32,
    /// Maximum bytes per slot.
    pub msg_size: u32,
    /// Producer index.
    pub pi: u32,
    /// Consumer index.
    pub ci: u32,
    /// Producer counter.
    pub pc: u32,
    /// Consumer counter.
    pub cc: u32,
}

impl RingState {
    /// Slots holding data.
    pub fn occupancy(&self) -> u32 {
        self.pc.wrapping_sub(self.cc)
    }

    /// No slot holds data.
    pub fn is_empty(&self) -> bool {
        self.pc == self.cc
    }

    /// Every slot holds data.
    pub fn is_full(&self) -> bool {
        self.occupancy() == self.ring_size
    }
}

#[inline]
fn next_index(index: u32, ring_size: u32) -> u32 {
    if index.wrapping_add(1) >= ring_size {
        0
    } else {
        index + 1
    }
}

impl RingMetadata {
    /// A detached ring, for local use and tests.
    pub fn new(ring_size: u32, msg_size: u32) -> Self {
        let md = Self::default();
        md.reset(ring_size, msg_size);
        md
    }

    /// Empty the ring and set its geometry.
    pub fn reset(&self, ring_size: u32, msg_size: u32) {
        self.seed(ring_size, msg_size, 0, 0);
    }

    /// Set the geometry with every slot already produced.
    ///
    /// Used for free-list rings, whose buffers are in place from the start.
    pub fn reset_stocked(&self, ring_size: u32, msg_size: u32) {
        self.seed(ring_size, msg_size, ring_size, 0);
    }

    /// Set geometry, indices at 0, and the counters to arbitrary values.
    ///
    /// `pc - cc` must not exceed `ring_size`.
    pub fn seed(&self, ring_size: u32, msg_size: u32, pc: u32, cc: u32) {
        debug_assert!(pc.wrapping_sub(cc) <= ring_size);
        self.ring_size.store(ring_size, Ordering::Relaxed);
        self.msg_size.store(msg_size, Ordering::Relaxed);
        self.pi.store(pc.wrapping_sub(cc) % ring_size.max(1), Ordering::Relaxed);
        self.ci.store(0, Ordering::Relaxed);
        self.cc.store(cc, Ordering::Relaxed);
        self.pc.store(pc, Ordering::Release);
    }

    /// Capacity in slots.
    #[inline]
    pub fn ring_size(&self) -> u32 {
        self.ring_size.load(Ordering::Acquire)
    }

    /// Maximum bytes per slot.
    #[inline]
    pub fn msg_size(&self) -> u32 {
        self.msg_size.load(Ordering::Acquire)
    }

    /// Slot the producer writes next.
    #[inline]
    pub fn producer_index(&self) -> u32 {
        self.pi.load(Ordering::Acquire)
    }

    /// Slot the consumer reads next.
    #[inline]
    pub fn consumer_index(&self) -> u32 {
        self.ci.load(Ordering::Acquire)
    }

    /// Producer counter.
    #[inline]
    pub fn producer_count(&self) -> u32 {
        self.pc.load(Ordering::Acquire)
    }

    /// Consumer counter.
    #[inline]
    pub fn consumer_count(&self) -> u32 {
        self.cc.load(Ordering::Acquire)
    }

    /// Slots holding data.
    #[inline]
    pub fn occupancy(&self) -> u32 {
        self.producer_count().wrapping_sub(self.consumer_count())
    }

    /// Slots the producer may still fill.
    #[inline]
    pub fn free_slots(&self) -> u32 {
        self.ring_size().saturating_sub(self.occupancy())
    }

    /// `pc - cc == ring_size`.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.occupancy() == self.ring_size()
    }

    /// `cc == pc`.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.consumer_count() == self.producer_count()
    }

    /// Publish the slot at the current producer index.
    ///
    /// Call only after the slot is completely written.
    #[inline]
    pub fn advance_producer(&self) {
        let ring_size = self.ring_size();
        let pi = self.pi.load(Ordering::Relaxed);
        self.pi.store(next_index(pi, ring_size), Ordering::Release);
        let pc = self.pc.load(Ordering::Relaxed);
        self.pc.store(pc.wrapping_add(1), Ordering::Release);
    }

    /// Release the slot at the current consumer index.
    ///
    /// Call only after the slot is completely read.
    #[inline]
    pub fn advance_consumer(&self) {
        let ring_size = self.ring_size();
        let ci = self.ci.load(Ordering::Relaxed);
        self.ci.store(next_index(ci, ring_size), Ordering::Release);
        let cc = self.cc.load(Ordering::Relaxed);
        self.cc.store(cc.wrapping_add(1), Ordering::Release);
    }

    /// Copy of all six fields.
    pub fn snapshot(&self) -> RingState {
        RingState {
            ring_size: self.ring_size(),
            msg_size: self.msg_size(),
            pi: self.producer_index(),
            ci: self.consumer_index(),
            pc: self.producer_count(),
            cc: self.consumer_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_and_drain() {
        for ring_size in 1..=16 {
            let md = RingMetadata::new(ring_size, 64);
            assert!(md.is_empty());
            for _ in 0..ring_size {
                assert!(!md.is_full());
                md.advance_producer();
            }
            assert!(md.is_full());
            assert_eq!(md.free_slots(), 0);
            assert_eq!(md.producer_index(), 0);

            for _ in 0..ring_size {
                assert!(!md.is_empty());
                md.advance_consumer();
            }
            assert!(md.is_empty());
            assert_eq!(md.consumer_index(), 0);
        }
    }

    #[test]
    fn test_indices_wrap_modulo_size() {
        let md = RingMetadata::new(3, 8);
        for expected in [1, 2, 0, 1] {
            md.advance_producer();
            md.advance_consumer();
            assert_eq!(md.producer_index(), expected);
            assert_eq!(md.consumer_index(), expected);
        }
        assert_eq!(md.producer_count(), 4);
    }

    #[test]
    fn test_counters_wrap_past_u32_max() {
        let md = RingMetadata::default();
        md.seed(4, 64, u32::MAX - 1, u32::MAX - 1);
        assert!(md.is_empty());

        for _ in 0..4 {
            md.advance_producer();
        }
        assert_eq!(md.producer_count(), 2);
        assert!(md.is_full());
        assert_eq!(md.occupancy(), 4);

        md.advance_consumer();
        assert!(!md.is_full());
        assert_eq!(md.occupancy(), 3);
        for _ in 0..3 {
            md.advance_consumer();
        }
        assert!(md.is_empty());
        assert_eq!(md.consumer_count(), 2);
    }

    #[test]
    fn test_stocked_ring_starts_full() {
        let md = RingMetadata::default();
        md.reset_stocked(4, 1024);
        assert!(md.is_full());
        assert_eq!(md.producer_index(), 0);
        assert_eq!(md.snapshot().pc, 4);

        md.advance_consumer();
        assert_eq!(md.free_slots(), 1);
    }

    #[test]
    fn test_snapshot_matches_state() {
        let md = RingMetadata::new(8, 2048);
        md.advance_producer();
        md.advance_producer();
        md.advance_consumer();

        let state = md.snapshot();
        assert_eq!(
            state,
            RingState {
                ring_size: 8,
                msg_size: 2048,
                pi: 2,
                ci: 1,
                pc: 2,
                cc: 1
            }
        );
        assert_eq!(state.occupancy(), 1);
        assert!(!state.is_empty());
        assert!(!state.is_full());
    }
}
