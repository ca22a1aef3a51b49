//! Frame source collaborators.
//!
//! The engine never opens a camera itself; it consumes frames from anything
//! implementing [`FrameSource`]. The in-repo [`TestPatternSource`] drives the
//! demo binary and tests with synthetic frames drawn from a small recycled
//! buffer pool, mimicking how a real camera stack cycles a fixed set of
//! hardware buffers.

use crate::frame::{HardwareBuffer, HardwareFrame, PixelFormat};
use crate::sync::FrameFence;
use std::sync::Arc;

/// A producer of externally-owned frame buffers.
pub trait FrameSource {
    /// Hand out the most recent frame, discarding any older undelivered
    /// ones. Returns `None` when no buffer is currently available, for
    /// example because every pool buffer is still referenced downstream.
    fn acquire_latest_frame(&mut self) -> Option<HardwareFrame>;

    /// Native frame dimensions.
    fn frame_size(&self) -> (u32, u32);
}

/// Number of pool buffers the synthetic source cycles through. Each frame
/// slot downstream holds one buffer until its swapchain position is reused,
/// so the pool must exceed the slot ring depth or delivery stalls.
const POOL_SIZE: usize = 8;

/// Synthetic frame source producing a moving gradient with speckle noise.
pub struct TestPatternSource {
    pool: Vec<Arc<HardwareBuffer>>,
    width: u32,
    height: u32,
    tick: u64,
}

impl TestPatternSource {
    pub fn new(width: u32, height: u32) -> Self {
        let pool = (0..POOL_SIZE as u64)
            .map(|id| Arc::new(HardwareBuffer::new(id, width, height, PixelFormat::Rgba)))
            .collect();
        Self {
            pool,
            width,
            height,
            tick: 0,
        }
    }

    /// Find a pool buffer nothing downstream still holds.
    fn free_buffer(&mut self) -> Option<&mut Arc<HardwareBuffer>> {
        self.pool
            .iter_mut()
            .find(|buffer| Arc::strong_count(buffer) == 1)
    }

    fn fill_pattern(buffer: &mut HardwareBuffer, tick: u64) {
        let (w, h) = (buffer.width as usize, buffer.height as usize);
        for y in 0..h {
            for x in 0..w {
                let i = (y * w + x) * 4;
                buffer.data[i] = ((x + tick as usize) % 256) as u8;
                buffer.data[i + 1] = ((y + tick as usize / 2) % 256) as u8;
                buffer.data[i + 2] = ((x + y) % 256) as u8;
                buffer.data[i + 3] = 255;
            }
        }
        // Sparse speckle so consecutive frames never compare equal
        for _ in 0..64 {
            let x = rand::random::<u32>() as usize % w;
            let y = rand::random::<u32>() as usize % h;
            let i = (y * w + x) * 4;
            buffer.data[i] = rand::random::<u8>();
            buffer.data[i + 1] = rand::random::<u8>();
            buffer.data[i + 2] = rand::random::<u8>();
        }
    }
}

impl FrameSource for TestPatternSource {
    fn acquire_latest_frame(&mut self) -> Option<HardwareFrame> {
        let tick = self.tick;
        let buffer = self.free_buffer()?;
        Self::fill_pattern(
            Arc::get_mut(buffer).expect("buffer with strong count 1 is uniquely owned"),
            tick,
        );
        let delivered = buffer.clone();
        self.tick = self.tick.wrapping_add(1);
        // The pattern is written synchronously, so the producer fence is
        // handed out already signaled.
        Some(HardwareFrame::with_fence(delivered, FrameFence::signaled()))
    }

    fn frame_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_ids_stay_stable_across_reuse() {
        let mut source = TestPatternSource::new(8, 8);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..32 {
            let frame = source.acquire_latest_frame().unwrap();
            seen.insert(frame.buffer.id);
            // Frame dropped here, returning the buffer to the pool
        }
        assert!(seen.len() <= POOL_SIZE);
    }

    #[test]
    fn exhausted_pool_yields_no_frame() {
        let mut source = TestPatternSource::new(4, 4);
        let held: Vec<HardwareFrame> = (0..POOL_SIZE)
            .map(|_| source.acquire_latest_frame().unwrap())
            .collect();
        assert!(source.acquire_latest_frame().is_none());
        drop(held);
        assert!(source.acquire_latest_frame().is_some());
    }

    #[test]
    fn delivered_frames_carry_a_signaled_fence() {
        let mut source = TestPatternSource::new(4, 4);
        let frame = source.acquire_latest_frame().unwrap();
        assert!(frame.fence.as_ref().unwrap().is_signaled());
        assert!(frame.buffer.is_single_layer());
    }
}
