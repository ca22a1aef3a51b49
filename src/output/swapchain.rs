//! Per-surface ring of frame slots and their GPU resources.

use super::{
    negotiated_slot_count, PresentationSurface, DESIRED_FRAME_SLOTS, SURFACE_MAX_IMAGES,
    SURFACE_MIN_IMAGES,
};
use crate::frame::HardwareBuffer;
use crate::gpu::GpuContext;
use crate::render::ShaderVars;
use crate::sync::WaitScope;
use anyhow::Result;
use std::sync::Arc;
use tracing::debug;

/// Round a tightly-packed RGBA row up to the copy alignment wgpu requires
/// for texture-to-buffer transfers.
pub fn padded_bytes_per_row(width: u32) -> u32 {
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    let bytes = width * 4;
    (bytes + align - 1) & !(align - 1)
}

/// Rotation bookkeeping for a slot ring: which slot the next frame lands in.
///
/// Kept free of GPU state so the rotation protocol is testable on its own.
#[derive(Debug, Clone)]
pub struct SlotRotor {
    len: usize,
    index: usize,
}

impl SlotRotor {
    pub fn new(len: usize) -> Self {
        assert!(len > 0);
        Self { len, index: 0 }
    }

    /// Advance to the next slot and return its index.
    pub fn advance(&mut self) -> usize {
        self.index = (self.index + 1) % self.len;
        self.index
    }

    pub fn current(&self) -> usize {
        self.index
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

/// All GPU resources owned by one swapchain position.
///
/// `pending` is the slot's presentation fence: it must complete before any
/// of the slot's resources are written again, and before the slot's held
/// camera buffer may be released.
pub struct FrameSlot {
    pub color: wgpu::Texture,
    pub color_view: wgpu::TextureView,
    pub previous: wgpu::Texture,
    pub previous_view: wgpu::TextureView,
    pub capture: wgpu::Texture,
    pub capture_view: wgpu::TextureView,
    pub readback: wgpu::Buffer,
    pub shader_vars: wgpu::Buffer,
    pub pending: Option<wgpu::SubmissionIndex>,
    pub held_buffer: Option<Arc<HardwareBuffer>>,
}

impl FrameSlot {
    fn new(ctx: &GpuContext, index: usize, extent: (u32, u32), capture_extent: (u32, u32)) -> Self {
        let (width, height) = extent;
        let (capture_w, capture_h) = capture_extent;

        let color = ctx.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(&format!("Slot {index} Color")),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });

        // Holds the N-1 frame for temporal effects
        let previous = ctx.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(&format!("Slot {index} Previous")),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });

        // Downscale target the capture pass renders into before readback
        let capture = ctx.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(&format!("Slot {index} Capture Copy")),
            size: wgpu::Extent3d {
                width: capture_w,
                height: capture_h,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });

        let readback = ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(&format!("Slot {index} Readback")),
            size: (padded_bytes_per_row(capture_w) * capture_h) as wgpu::BufferAddress,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let shader_vars = ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(&format!("Slot {index} Shader Vars")),
            size: std::mem::size_of::<ShaderVars>() as wgpu::BufferAddress,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        Self {
            color_view: color.create_view(&wgpu::TextureViewDescriptor::default()),
            color,
            previous_view: previous.create_view(&wgpu::TextureViewDescriptor::default()),
            previous,
            capture_view: capture.create_view(&wgpu::TextureViewDescriptor::default()),
            capture,
            readback,
            shader_vars,
            pending: None,
            held_buffer: None,
        }
    }
}

/// A [`PresentationSurface`] plus its ring of [`FrameSlot`]s.
pub struct SurfaceSwapchain {
    pub surface: PresentationSurface,
    slots: Vec<FrameSlot>,
    rotor: SlotRotor,
    presented_frames: u64,
    /// Aspect-ratio correction factors for upright and rotated sampling,
    /// fixed at creation from the source and surface geometry.
    pub distortion_normal: f32,
    pub distortion_rotated: f32,
    extent: (u32, u32),
    capture_extent: (u32, u32),
}

impl SurfaceSwapchain {
    pub fn new(
        ctx: &GpuContext,
        surface: PresentationSurface,
        image_extent: (u32, u32),
        capture_extent: (u32, u32),
    ) -> Self {
        let extent = surface.size();
        let slot_count = negotiated_slot_count(
            SURFACE_MIN_IMAGES,
            SURFACE_MAX_IMAGES,
            DESIRED_FRAME_SLOTS,
        ) as usize;
        debug!("swapchain ring: {slot_count} slots at {}x{}", extent.0, extent.1);

        let slots = (0..slot_count)
            .map(|i| FrameSlot::new(ctx, i, extent, capture_extent))
            .collect();

        let (iw, ih) = (image_extent.0 as f32, image_extent.1 as f32);
        let (ww, wh) = (extent.0 as f32, extent.1 as f32);

        Self {
            surface,
            slots,
            rotor: SlotRotor::new(slot_count),
            presented_frames: 0,
            distortion_normal: (iw * wh) / (ih * ww),
            distortion_rotated: (ih * wh) / (iw * ww),
            extent,
            capture_extent,
        }
    }

    /// Advance to the next slot and block until the display has finished
    /// with it, so the CPU never records into an image the GPU still owns.
    pub fn acquire_next(&mut self, device: &wgpu::Device) -> Result<usize> {
        let index = self.rotor.advance();
        if let Some(pending) = self.slots[index].pending.take() {
            WaitScope::new(device).submission(pending)?;
        }
        Ok(index)
    }

    /// Wait out every in-flight slot and release any camera buffers still
    /// referenced, without acquiring a new presentable image. Used while
    /// drawing is disabled so the upstream buffer pool is never starved.
    pub fn drain(&mut self, device: &wgpu::Device) -> Result<()> {
        let wait = WaitScope::new(device);
        for slot in &mut self.slots {
            if let Some(pending) = slot.pending.take() {
                wait.submission(pending)?;
            }
            slot.held_buffer = None;
        }
        Ok(())
    }

    /// True when no slot is in flight and no camera buffer is held.
    pub fn is_drained(&self) -> bool {
        self.slots
            .iter()
            .all(|slot| slot.pending.is_none() && slot.held_buffer.is_none())
    }

    pub fn current_index(&self) -> usize {
        self.rotor.current()
    }

    pub fn current_slot(&self) -> &FrameSlot {
        &self.slots[self.rotor.current()]
    }

    pub fn current_slot_mut(&mut self) -> &mut FrameSlot {
        let index = self.rotor.current();
        &mut self.slots[index]
    }

    pub fn slot(&self, index: usize) -> &FrameSlot {
        &self.slots[index]
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn note_presented(&mut self) {
        self.presented_frames += 1;
    }

    pub fn presented_frames(&self) -> u64 {
        self.presented_frames
    }

    pub fn extent(&self) -> (u32, u32) {
        self.extent
    }

    pub fn capture_extent(&self) -> (u32, u32) {
        self.capture_extent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotor_cycles_through_every_slot() {
        let mut rotor = SlotRotor::new(3);
        let visited: Vec<usize> = (0..6).map(|_| rotor.advance()).collect();
        assert_eq!(visited, vec![1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn rotors_in_lockstep_stay_aligned_across_surfaces() {
        // All active surfaces advance once per frame; after K frames each
        // surface has landed on the same sequence of slot indices.
        let mut rotors = vec![SlotRotor::new(6), SlotRotor::new(6), SlotRotor::new(6)];
        for _ in 0..20 {
            let indices: Vec<usize> = rotors.iter_mut().map(|r| r.advance()).collect();
            assert!(indices.windows(2).all(|pair| pair[0] == pair[1]));
        }
    }

    #[test]
    fn padded_rows_are_copy_aligned() {
        assert_eq!(padded_bytes_per_row(64), 256);
        assert_eq!(padded_bytes_per_row(500), 2048);
        assert_eq!(padded_bytes_per_row(128), 512);
        for width in [1, 3, 500, 640, 1280] {
            assert_eq!(padded_bytes_per_row(width) % wgpu::COPY_BYTES_PER_ROW_ALIGNMENT, 0);
            assert!(padded_bytes_per_row(width) >= width * 4);
        }
    }
}
