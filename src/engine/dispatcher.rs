//! Per-frame ingestion: the callback invoked once per available frame.

use super::{EngineEvents, FilterParams, SessionFlags};
use crate::capture::{CaptureBlock, RingBuffer};
use crate::gpu::import::ImportCache;
use crate::gpu::GpuContext;
use crate::render::{FrameRenderer, RenderState};
use crate::source::FrameSource;
use crate::stats::FrameStats;
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Only every twelfth frame is diverted into the capture buffer, keeping
/// the exported animation's effective rate well below the camera's.
pub const CAPTURE_STRIDE: u64 = 12;

/// Captured frames per animation.
pub const CAPTURE_FRAME_COUNT: usize = 7;

/// Throughput statistics are republished every this many frames.
pub const STATS_INTERVAL: u32 = 50;

/// Whether the frame at `frame_index` should be diverted into the capture
/// buffer.
pub fn capture_due(frame_index: u64, requested: bool, encoding: bool) -> bool {
    requested && !encoding && frame_index % CAPTURE_STRIDE == 1
}

/// Progress fraction reported after `captured` frames, with the sentinel
/// `-1.0` once the target count is reached.
pub fn capture_progress(captured: usize) -> f32 {
    if captured >= CAPTURE_FRAME_COUNT {
        -1.0
    } else {
        captured as f32 / CAPTURE_FRAME_COUNT as f32
    }
}

/// Sequences one frame through acquisition, import, render dispatch,
/// capture-buffer population, and statistics. Runs synchronously on the
/// delivery thread; all GPU work it starts is asynchronous.
pub struct FrameDispatcher {
    ctx: Arc<GpuContext>,
    renderer: FrameRenderer,
    cache: ImportCache,
    ring: Arc<RingBuffer<CaptureBlock>>,
    flags: Arc<SessionFlags>,
    filter: Arc<Mutex<FilterParams>>,
    events: Arc<dyn EngineEvents>,
    capture_extent: (u32, u32),
    frame_count: u64,
    stats: FrameStats,
}

impl FrameDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: Arc<GpuContext>,
        renderer: FrameRenderer,
        ring: Arc<RingBuffer<CaptureBlock>>,
        flags: Arc<SessionFlags>,
        filter: Arc<Mutex<FilterParams>>,
        events: Arc<dyn EngineEvents>,
        capture_extent: (u32, u32),
    ) -> Self {
        Self {
            ctx,
            renderer,
            cache: ImportCache::new(),
            ring,
            flags,
            filter,
            events,
            capture_extent,
            frame_count: 0,
            stats: FrameStats::new(STATS_INTERVAL),
        }
    }

    /// Handle one newly available source frame.
    ///
    /// If a required output is not ready the frame is left with the source,
    /// whose latest-wins semantics discard it on the next acquire. Import
    /// and render failures drop the frame and recover on the next call.
    pub fn on_frame_available(&mut self, source: &mut dyn FrameSource) {
        let surfaces = self.renderer.swapchains().len();
        if !self.flags.all_surfaces_ready(surfaces) {
            return;
        }

        let Some(frame) = source.acquire_latest_frame() else {
            return;
        };
        self.frame_count += 1;

        let imported = match self.cache.resolve(&self.ctx, &frame, true) {
            Ok(image) => image,
            Err(e) => {
                warn!("frame import failed, dropping frame: {e:#}");
                return;
            }
        };

        // First frame decides the sampler configuration; rebuild only if a
        // later source changes it.
        if self.renderer.needs_pipeline(imported.has_conversion()) {
            self.renderer.init_pipeline(imported.has_conversion());
        }

        let mut block = if capture_due(
            self.frame_count,
            self.flags.capture_requested(),
            self.flags.capture_in_progress(),
        ) {
            Some(self.allocate_block())
        } else {
            None
        };

        let draw = self.flags.draw_enabled();
        let params = self.filter.lock().unwrap().clone();

        let (state, submit_ms) = match self.renderer.render(
            &imported,
            &frame.buffer,
            &params,
            draw,
            block.as_mut(),
        ) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("render failed, dropping frame: {e:#}");
                return;
            }
        };

        if let Some(block) = block.take() {
            self.ring.put(block);
            let captured = self.flags.increment_frames_captured();
            self.events.capture_progress(capture_progress(captured));
            if captured >= CAPTURE_FRAME_COUNT {
                self.flags.set_capture_requested(false);
                self.events.capture_ready_to_encode();
            }
        }

        self.flags
            .set_queue_empty(!draw && state == RenderState::QueueEmpty);

        if draw {
            if let Some(sample) = self.stats.record(submit_ms) {
                self.events.framerate_update(sample.fps_x10, sample.submit_ms);
            }
        }
    }

    /// Obtain a block for the coming capture, recycling the oldest ring
    /// entry's allocation when the ring is already full.
    fn allocate_block(&self) -> CaptureBlock {
        let (width, height) = self.capture_extent;
        if self.ring.is_full() {
            if let Some(mut oldest) = self.ring.get() {
                oldest.reset(width, height);
                return oldest;
            }
        }
        CaptureBlock::new(width, height)
    }

    pub fn renderer(&self) -> &FrameRenderer {
        &self.renderer
    }

    pub fn renderer_mut(&mut self) -> &mut FrameRenderer {
        &mut self.renderer
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_follows_the_decimation_stride() {
        // Capture requested from the start: exactly frames 1, 13, 25, ...
        let captured: Vec<u64> = (1..=120)
            .filter(|&idx| capture_due(idx, true, false))
            .collect();
        assert_eq!(captured, vec![1, 13, 25, 37, 49, 61, 73, 85, 97, 109]);
    }

    #[test]
    fn capture_requires_request_and_no_encode_in_flight() {
        assert!(!capture_due(1, false, false));
        assert!(!capture_due(1, true, true));
        assert!(capture_due(1, true, false));
        assert!(!capture_due(2, true, false));
    }

    #[test]
    fn progress_goes_indeterminate_at_target() {
        assert_eq!(capture_progress(0), 0.0);
        let mid = capture_progress(3);
        assert!(mid > 0.0 && mid < 1.0);
        assert_eq!(capture_progress(CAPTURE_FRAME_COUNT), -1.0);
        assert_eq!(capture_progress(CAPTURE_FRAME_COUNT + 1), -1.0);
    }
}
