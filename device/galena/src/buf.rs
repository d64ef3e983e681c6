//! Fixed-capacity byte rings shared between interrupt and main context.
//!
//! The producer/consumer indices count bytes forever and wrap at `u16`
//! boundaries; the occupied length is always `index_in - index_out` in
//! wrapping arithmetic, so the ring never needs a separate "full" marker
//! and a full ring is distinguishable from an empty one.

/// Circular FIFO over a fixed `N`-byte array.
///
/// `N` must be at most `u16::MAX` so the wrapping index arithmetic stays
/// unambiguous.
pub struct RingBuffer<const N: usize> {
    storage: [u8; N],
    index_in: u16,
    index_out: u16,
}

impl<const N: usize> RingBuffer<N> {
    const CAPACITY_OK: () = assert!(N > 0 && N <= u16::MAX as usize);

    pub const fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::CAPACITY_OK;
        Self {
            storage: [0; N],
            index_in: 0,
            index_out: 0,
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Number of bytes currently queued.
    pub fn len(&self) -> usize {
        self.index_in.wrapping_sub(self.index_out) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.index_in == self.index_out
    }

    pub fn is_full(&self) -> bool {
        self.len() >= N
    }

    pub fn remaining_space(&self) -> usize {
        N - self.len()
    }

    /// Raw producer index. Compares against an earlier snapshot to tell
    /// whether anything arrived in between, even across a drain.
    pub fn index_in(&self) -> u16 {
        self.index_in
    }

    pub fn clear(&mut self) {
        self.index_out = self.index_in;
    }

    /// Appends one byte. Returns `false` (byte dropped) when the ring is
    /// full.
    pub fn enqueue(&mut self, byte: u8) -> bool {
        if self.is_full() {
            return false;
        }
        self.storage[self.index_in as usize % N] = byte;
        self.index_in = self.index_in.wrapping_add(1);
        true
    }

    /// Removes the oldest byte, if any.
    ///
    /// When the ring drains empty both indices collapse onto the slot just
    /// past the last byte read, which keeps the `index_in` snapshot
    /// comparison meaningful for consumers that poll it.
    pub fn dequeue(&mut self) -> Option<u8> {
        if self.index_in == self.index_out {
            return None;
        }
        let slot = self.index_out as usize % N;
        let byte = self.storage[slot];
        self.index_out = self.index_out.wrapping_add(1);
        if self.index_in == self.index_out {
            let collapsed = (slot as u16).wrapping_add(1);
            self.index_in = collapsed;
            self.index_out = collapsed;
        }
        Some(byte)
    }
}

impl<const N: usize> Default for RingBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Bytes come out in the order they went in.
    #[test]
    fn fifo_order() {
        let mut ring = RingBuffer::<8>::new();
        for b in 0..5u8 {
            assert!(ring.enqueue(b));
        }
        assert_eq!(ring.len(), 5);
        for b in 0..5u8 {
            assert_eq!(ring.dequeue(), Some(b));
        }
        assert_eq!(ring.dequeue(), None);
        assert!(ring.is_empty());
    }

    /// A full ring drops the incoming byte instead of overwriting.
    #[test]
    fn full_ring_drops() {
        let mut ring = RingBuffer::<4>::new();
        for b in 0..4u8 {
            assert!(ring.enqueue(b));
        }
        assert!(ring.is_full());
        assert!(!ring.enqueue(99));
        assert_eq!(ring.len(), 4);
        assert_eq!(ring.dequeue(), Some(0));
    }

    /// Occupancy stays `index_in - index_out` across many wraps of the
    /// u16 counters.
    #[test]
    fn occupancy_across_index_wrap() {
        let mut ring = RingBuffer::<3>::new();
        for i in 0..200_000u32 {
            assert!(ring.enqueue(i as u8));
            assert_eq!(ring.len(), 1);
            assert_eq!(ring.dequeue(), Some(i as u8));
            assert!(ring.is_empty());
        }
    }

    /// Draining to empty collapses both indices but the producer index
    /// still moves when new data arrives.
    #[test]
    fn index_snapshot_survives_drain() {
        let mut ring = RingBuffer::<8>::new();
        ring.enqueue(1);
        ring.enqueue(2);
        let before = ring.index_in();
        while ring.dequeue().is_some() {}
        ring.enqueue(3);
        assert_ne!(ring.index_in(), before);
    }

    /// Interleaved produce/consume at partial fill keeps order.
    #[test]
    fn interleaved_wrap() {
        let mut ring = RingBuffer::<4>::new();
        let mut expect = 0u8;
        let mut next = 0u8;
        for _ in 0..64 {
            for _ in 0..3 {
                if ring.enqueue(next) {
                    next = next.wrapping_add(1);
                }
            }
            for _ in 0..2 {
                if let Some(b) = ring.dequeue() {
                    assert_eq!(b, expect);
                    expect = expect.wrapping_add(1);
                }
            }
        }
        while let Some(b) = ring.dequeue() {
            assert_eq!(b, expect);
            expect = expect.wrapping_add(1);
        }
        assert_eq!(expect, next);
    }
}
