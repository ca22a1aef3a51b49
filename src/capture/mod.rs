//! Bounded capture buffer feeding animated-image export.

use std::collections::VecDeque;
use std::sync::Mutex;

/// One captured frame: a raw RGBA pixel block at the capture resolution.
#[derive(Debug)]
pub struct CaptureBlock {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl CaptureBlock {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; (width * height * 4) as usize],
        }
    }

    /// Reshape an existing block, reusing its allocation where possible.
    pub fn reset(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        self.data.clear();
        self.data.resize((width * height * 4) as usize, 0);
    }
}

/// Fixed-capacity, thread-safe FIFO-overwrite buffer.
///
/// `put` on a full buffer evicts the oldest entry and hands it back to the
/// caller, which is then responsible for it (usually recycling the
/// allocation). Capacity is fixed at construction. The lock exists because
/// the encode step drains the buffer from a different context than the
/// delivery thread appending to it.
pub struct RingBuffer<T> {
    capacity: usize,
    items: Mutex<VecDeque<T>>,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be non-zero");
        Self {
            capacity,
            items: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Append an item, evicting and returning the oldest one when full.
    pub fn put(&self, item: T) -> Option<T> {
        let mut items = self.items.lock().unwrap();
        let evicted = if items.len() == self.capacity {
            items.pop_front()
        } else {
            None
        };
        items.push_back(item);
        evicted
    }

    /// Remove and return the oldest item.
    pub fn get(&self) -> Option<T> {
        self.items.lock().unwrap().pop_front()
    }

    pub fn num_items(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.num_items() == 0
    }

    pub fn is_full(&self) -> bool {
        self.num_items() == self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn items_come_out_in_arrival_order() {
        let ring = RingBuffer::new(3);
        assert!(ring.is_empty());
        for n in 0..3 {
            assert!(ring.put(n).is_none());
        }
        assert!(ring.is_full());
        assert_eq!(ring.get(), Some(0));
        assert_eq!(ring.get(), Some(1));
        assert_eq!(ring.get(), Some(2));
        assert_eq!(ring.get(), None);
    }

    #[test]
    fn put_on_full_buffer_evicts_exactly_the_oldest() {
        let ring = RingBuffer::new(2);
        ring.put('a');
        ring.put('b');
        assert_eq!(ring.put('c'), Some('a'));
        assert_eq!(ring.num_items(), 2);
        assert_eq!(ring.get(), Some('b'));
        assert_eq!(ring.get(), Some('c'));
    }

    #[test]
    fn num_items_never_exceeds_capacity() {
        let ring = RingBuffer::new(4);
        for n in 0..20 {
            ring.put(n);
            assert!(ring.num_items() <= 4);
        }
    }

    #[test]
    fn capacity_seven_overwrite_scenario() {
        // 10 monotonically labeled blocks into a capacity-7 ring: blocks
        // 0..=2 fall out, 3..=9 remain in order.
        let ring = RingBuffer::new(7);
        for n in 0u32..10 {
            ring.put(n);
        }
        assert_eq!(ring.num_items(), 7);
        assert_eq!(ring.get(), Some(3));
        assert_eq!(ring.num_items(), 6);
        let rest: Vec<u32> = std::iter::from_fn(|| ring.get()).collect();
        assert_eq!(rest, vec![4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn capture_block_reset_reuses_allocation() {
        let mut block = CaptureBlock::new(4, 4);
        block.data[0] = 9;
        block.reset(2, 2);
        assert_eq!(block.data.len(), 16);
        assert_eq!(block.data[0], 0);
        assert_eq!((block.width, block.height), (2, 2));
    }
}
