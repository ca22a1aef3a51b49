//! Engine facade: the surface exposed to the embedding application.

pub mod dispatcher;

use crate::capture::{CaptureBlock, RingBuffer};
use crate::encode::{encode_boomerang, AnimationEncoder, GifAnimationEncoder};
use crate::gpu::GpuContext;
use crate::output::swapchain::SurfaceSwapchain;
use crate::output::PresentationSurface;
use crate::render::{FrameRenderer, NUM_EFFECTS};
use crate::source::FrameSource;
use anyhow::{anyhow, Result};
use dispatcher::{FrameDispatcher, CAPTURE_FRAME_COUNT};
use serde::Deserialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{error, info};
use winit::dpi::PhysicalSize;
use winit::window::Window;

/// Upper bound on simultaneously attached output displays.
pub const MAX_DISPLAYS: usize = 3;

/// Duration of one exported animation frame.
pub const EXPORT_FRAME_MS: u32 = 250;

/// Errors surfaced by the engine facade. Initialization-time capability
/// failures are explicit; per-frame faults never appear here because the
/// dispatcher recovers from them by dropping the frame.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("display count {0} out of range (1-{MAX_DISPLAYS})")]
    InvalidDisplayCount(usize),
    #[error("surface slot {0} out of range for {1} displays")]
    InvalidSurfaceSlot(usize, usize),
    #[error("GPU initialization failed: {0}")]
    GpuInit(#[source] anyhow::Error),
    #[error("presentation surface setup failed: {0}")]
    SurfaceSetup(#[source] anyhow::Error),
}

/// Static engine geometry, loadable from the demo's YAML config.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Native dimensions of source frames.
    pub image_width: u32,
    pub image_height: u32,
    /// Width of captured animation frames.
    pub capture_width: u32,
    /// Height of captured animation frames; zero derives it from the
    /// primary surface's aspect ratio.
    pub capture_height: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            image_width: 1280,
            image_height: 720,
            capture_width: 500,
            capture_height: 0,
        }
    }
}

/// Resolve the capture-copy extent, deriving the height from the primary
/// surface's aspect ratio when it was left at zero.
pub fn derive_capture_extent(
    width: u32,
    height: u32,
    surface_w: u32,
    surface_h: u32,
) -> (u32, u32) {
    if height != 0 {
        return (width, height);
    }
    let derived = (width as f32 * (surface_h as f32 / surface_w as f32)) as u32;
    (width, derived.max(1))
}

/// Shared mutable filter configuration, written by the UI layer and
/// snapshotted by the renderer once per frame.
#[derive(Debug, Clone)]
pub struct FilterParams {
    /// Degrees clockwise from right-side up.
    pub rotation: i32,
    pub values: [i32; NUM_EFFECTS],
    pub toggles: [bool; NUM_EFFECTS],
}

impl FilterParams {
    /// Overwrite from the UI layer's arrays. Entries beyond the effect
    /// count are ignored, missing ones keep their previous value.
    pub fn apply(&mut self, rotation: i32, values: &[i32], toggles: &[bool]) {
        self.rotation = rotation;
        for (dst, src) in self.values.iter_mut().zip(values) {
            *dst = *src;
        }
        for (dst, src) in self.toggles.iter_mut().zip(toggles) {
            *dst = *src;
        }
    }
}

impl Default for FilterParams {
    fn default() -> Self {
        Self {
            rotation: 0,
            values: [50; NUM_EFFECTS],
            toggles: [false; NUM_EFFECTS],
        }
    }
}

/// Cross-component session flags. Each flag has a single writer but many
/// readers across threads, so every one is an atomic rather than a bare
/// global.
pub struct SessionFlags {
    surface_ready: [AtomicBool; MAX_DISPLAYS],
    draw_enabled: AtomicBool,
    queue_empty: AtomicBool,
    capture_requested: AtomicBool,
    capture_in_progress: AtomicBool,
    frames_captured: AtomicUsize,
}

impl SessionFlags {
    pub fn new() -> Self {
        Self {
            surface_ready: Default::default(),
            draw_enabled: AtomicBool::new(true),
            queue_empty: AtomicBool::new(true),
            capture_requested: AtomicBool::new(false),
            capture_in_progress: AtomicBool::new(false),
            frames_captured: AtomicUsize::new(0),
        }
    }

    pub fn set_surface_ready(&self, slot: usize, ready: bool) {
        self.surface_ready[slot].store(ready, Ordering::SeqCst);
    }

    pub fn all_surfaces_ready(&self, count: usize) -> bool {
        self.surface_ready[..count]
            .iter()
            .all(|flag| flag.load(Ordering::SeqCst))
    }

    /// Disabling drawing also clears queue-empty: the queue only counts as
    /// empty again once a drain has actually completed.
    pub fn set_draw_enabled(&self, enabled: bool) {
        self.draw_enabled.store(enabled, Ordering::SeqCst);
        if !enabled {
            self.queue_empty.store(false, Ordering::SeqCst);
        }
    }

    pub fn draw_enabled(&self) -> bool {
        self.draw_enabled.load(Ordering::SeqCst)
    }

    pub fn set_queue_empty(&self, empty: bool) {
        self.queue_empty.store(empty, Ordering::SeqCst);
    }

    pub fn queue_empty(&self) -> bool {
        self.queue_empty.load(Ordering::SeqCst)
    }

    pub fn set_capture_requested(&self, requested: bool) {
        self.capture_requested.store(requested, Ordering::SeqCst);
    }

    pub fn capture_requested(&self) -> bool {
        self.capture_requested.load(Ordering::SeqCst)
    }

    pub fn set_capture_in_progress(&self, encoding: bool) {
        self.capture_in_progress.store(encoding, Ordering::SeqCst);
    }

    pub fn capture_in_progress(&self) -> bool {
        self.capture_in_progress.load(Ordering::SeqCst)
    }

    pub fn reset_frames_captured(&self) {
        self.frames_captured.store(0, Ordering::SeqCst);
    }

    /// Returns the new count.
    pub fn increment_frames_captured(&self) -> usize {
        self.frames_captured.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn frames_captured(&self) -> usize {
        self.frames_captured.load(Ordering::SeqCst)
    }
}

impl Default for SessionFlags {
    fn default() -> Self {
        Self::new()
    }
}

/// Asynchronous notifications published back to the embedding application.
pub trait EngineEvents: Send + Sync {
    fn framerate_update(&self, _fps_x10: i32, _submit_ms: i32) {}
    /// Fraction of the capture target reached, or `-1.0` once the target
    /// count is in hand and the spinner should go indeterminate.
    fn capture_progress(&self, _fraction: f32) {}
    fn capture_ready_to_encode(&self) {}
}

/// Event sink that ignores everything.
pub struct NullEvents;

impl EngineEvents for NullEvents {}

/// A new capture may not start while one is being collected or encoded.
pub fn capture_busy(flags: &SessionFlags) -> bool {
    flags.capture_requested() || flags.capture_in_progress()
}

/// The frame engine.
///
/// Surfaces attach one at a time as the platform windows come up; the
/// renderer and dispatcher are created the moment the last expected surface
/// arrives, and frames flow on the delivery thread from then on.
pub struct Engine {
    ctx: Arc<GpuContext>,
    config: EngineConfig,
    num_displays: usize,
    windows: Vec<Option<Arc<Window>>>,
    dispatcher: Option<FrameDispatcher>,
    flags: Arc<SessionFlags>,
    filter: Arc<Mutex<FilterParams>>,
    ring: Arc<RingBuffer<CaptureBlock>>,
    events: Arc<dyn EngineEvents>,
    encoder: Mutex<Option<Box<dyn AnimationEncoder>>>,
    capture_extent: Option<(u32, u32)>,
}

impl Engine {
    /// Set up the GPU context for the given number of displays. Fails
    /// explicitly when the display count is out of range or no suitable
    /// adapter exists; there is no degraded mode.
    pub fn initialize(
        num_displays: usize,
        config: EngineConfig,
        events: Arc<dyn EngineEvents>,
    ) -> Result<Self, EngineError> {
        if num_displays == 0 || num_displays > MAX_DISPLAYS {
            return Err(EngineError::InvalidDisplayCount(num_displays));
        }

        let ctx = GpuContext::new(None).map_err(EngineError::GpuInit)?;
        info!("engine initialized for {num_displays} display(s)");

        Ok(Self {
            ctx: Arc::new(ctx),
            config,
            num_displays,
            windows: vec![None; MAX_DISPLAYS],
            dispatcher: None,
            flags: Arc::new(SessionFlags::new()),
            filter: Arc::new(Mutex::new(FilterParams::default())),
            ring: Arc::new(RingBuffer::new(CAPTURE_FRAME_COUNT)),
            events,
            encoder: Mutex::new(None),
            capture_extent: None,
        })
    }

    /// Attach one platform output target. The renderer comes up once every
    /// expected slot has a window.
    pub fn attach_surface(&mut self, slot: usize, window: Arc<Window>) -> Result<(), EngineError> {
        if slot >= self.num_displays {
            return Err(EngineError::InvalidSurfaceSlot(slot, self.num_displays));
        }
        self.windows[slot] = Some(window);
        self.try_bring_up()
    }

    fn try_bring_up(&mut self) -> Result<(), EngineError> {
        if self.dispatcher.is_some() {
            return Ok(());
        }
        if self.windows[..self.num_displays].iter().any(Option::is_none) {
            return Ok(());
        }

        let mut surfaces = Vec::with_capacity(self.num_displays);
        for slot in 0..self.num_displays {
            let window = self.windows[slot].as_ref().expect("checked above").clone();
            let surface = PresentationSurface::new(&self.ctx, window)
                .map_err(EngineError::SurfaceSetup)?;
            surfaces.push(surface);
        }

        let (primary_w, primary_h) = surfaces[0].size();
        let capture_extent = derive_capture_extent(
            self.config.capture_width,
            self.config.capture_height,
            primary_w,
            primary_h,
        );
        self.capture_extent = Some(capture_extent);

        let image_extent = (self.config.image_width, self.config.image_height);
        let swapchains: Vec<SurfaceSwapchain> = surfaces
            .into_iter()
            .map(|surface| SurfaceSwapchain::new(&self.ctx, surface, image_extent, capture_extent))
            .collect();

        let renderer = FrameRenderer::new(self.ctx.clone(), swapchains, image_extent)
            .map_err(EngineError::SurfaceSetup)?;

        self.dispatcher = Some(FrameDispatcher::new(
            self.ctx.clone(),
            renderer,
            self.ring.clone(),
            self.flags.clone(),
            self.filter.clone(),
            self.events.clone(),
            capture_extent,
        ));

        for slot in 0..self.num_displays {
            self.flags.set_surface_ready(slot, true);
        }
        info!(
            "all {} surface(s) attached, renderer running (capture {}x{})",
            self.num_displays, capture_extent.0, capture_extent.1
        );
        Ok(())
    }

    /// Delivery-thread entry point: one call per newly available frame.
    pub fn on_frame_available(&mut self, source: &mut dyn FrameSource) {
        let Some(dispatcher) = self.dispatcher.as_mut() else {
            return;
        };
        dispatcher.on_frame_available(source);
    }

    pub fn set_draw_enabled(&self, enabled: bool) {
        self.flags.set_draw_enabled(enabled);
    }

    pub fn is_draw_enabled(&self) -> bool {
        self.flags.draw_enabled()
    }

    pub fn is_queue_empty(&self) -> bool {
        self.flags.queue_empty()
    }

    pub fn set_surface_ready(&self, slot: usize, ready: bool) {
        if slot < self.num_displays {
            self.flags.set_surface_ready(slot, ready);
        }
    }

    /// Track a window resize for the given surface slot.
    pub fn resize_surface(&mut self, slot: usize, size: PhysicalSize<u32>) {
        let device = &self.ctx.device;
        if let Some(dispatcher) = self.dispatcher.as_mut() {
            if let Some(sc) = dispatcher.renderer_mut().swapchains_mut().get_mut(slot) {
                sc.surface.resize(device, size);
            }
        }
    }

    /// Replace the shared filter configuration.
    pub fn update_filter_config(&self, rotation: i32, values: &[i32], toggles: &[bool]) {
        self.filter.lock().unwrap().apply(rotation, values, toggles);
    }

    /// Begin diverting frames into the capture buffer, to be exported to
    /// `path`. Returns `false` without side effects while a capture or an
    /// encode is already in flight, or before any surface is attached.
    pub fn request_capture(&self, path: &Path) -> bool {
        if capture_busy(&self.flags) {
            return false;
        }
        let Some((width, height)) = self.capture_extent else {
            return false;
        };

        let mut encoder = GifAnimationEncoder::new();
        if let Err(e) = encoder.init(width, height, path) {
            error!("capture encoder setup failed: {e:#}");
            return false;
        }

        *self.encoder.lock().unwrap() = Some(Box::new(encoder));
        self.flags.reset_frames_captured();
        self.flags.set_capture_requested(true);
        info!("capture requested -> {:?}", path);
        true
    }

    /// Encode the captured frames and finalize the output file. Runs the
    /// boomerang sequence: all frames forward, then backward without the
    /// endpoints.
    pub fn encode_and_export(&self) -> Result<()> {
        let mut encoder = self
            .encoder
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| anyhow!("no capture pending"))?;

        self.flags.set_capture_in_progress(true);
        let result = encode_boomerang(&self.ring, encoder.as_mut(), EXPORT_FRAME_MS);
        self.flags.set_capture_in_progress(false);
        result
    }

    pub fn flags(&self) -> &Arc<SessionFlags> {
        &self.flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_start_drawable_with_empty_queue() {
        let flags = SessionFlags::new();
        assert!(flags.draw_enabled());
        assert!(flags.queue_empty());
        assert!(!flags.capture_requested());
        assert!(!flags.capture_in_progress());
    }

    #[test]
    fn disabling_draw_clears_queue_empty_until_drained() {
        let flags = SessionFlags::new();
        flags.set_draw_enabled(false);
        assert!(!flags.queue_empty());
        // A completed drain reports back
        flags.set_queue_empty(true);
        assert!(flags.queue_empty());
    }

    #[test]
    fn surface_readiness_requires_every_slot() {
        let flags = SessionFlags::new();
        assert!(!flags.all_surfaces_ready(2));
        flags.set_surface_ready(0, true);
        assert!(flags.all_surfaces_ready(1));
        assert!(!flags.all_surfaces_ready(2));
        flags.set_surface_ready(1, true);
        assert!(flags.all_surfaces_ready(2));
    }

    #[test]
    fn capture_extent_derives_height_from_aspect() {
        assert_eq!(derive_capture_extent(500, 0, 1000, 500), (500, 250));
        assert_eq!(derive_capture_extent(500, 0, 720, 1280), (500, 888));
        // Explicit height wins
        assert_eq!(derive_capture_extent(500, 400, 1000, 500), (500, 400));
    }

    #[test]
    fn filter_update_clamps_to_effect_count() {
        let mut params = FilterParams::default();
        params.apply(90, &[1, 2, 3, 4, 5, 6, 7, 8], &[true; 8]);
        assert_eq!(params.rotation, 90);
        assert_eq!(params.values, [1, 2, 3, 4, 5, 6]);
        assert_eq!(params.toggles, [true; NUM_EFFECTS]);

        // A partial update keeps the remaining entries
        params.apply(0, &[9], &[false]);
        assert_eq!(params.values, [9, 2, 3, 4, 5, 6]);
        assert_eq!(params.toggles[1..], [true; NUM_EFFECTS - 1]);
    }

    #[test]
    fn capture_request_is_rejected_while_one_is_in_flight() {
        let flags = SessionFlags::new();
        assert!(!capture_busy(&flags));

        flags.set_capture_requested(true);
        flags.increment_frames_captured();
        assert!(capture_busy(&flags));
        // A rejected request leaves the counters untouched
        assert_eq!(flags.frames_captured(), 1);

        flags.set_capture_requested(false);
        flags.set_capture_in_progress(true);
        assert!(capture_busy(&flags));
        flags.set_capture_in_progress(false);
        assert!(!capture_busy(&flags));
    }
}
