//! Presentation outputs: platform surfaces and their swapchains.

pub mod swapchain;

use crate::gpu::GpuContext;
use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};
use winit::dpi::PhysicalSize;
use winit::window::Window;

/// Presentable image slots we ask for per surface, capped by what the
/// surface reports it can handle.
pub const DESIRED_FRAME_SLOTS: u32 = 6;

/// wgpu does not surface driver image-count limits; these bounds match what
/// the swapchain layer guarantees everywhere the engine runs.
pub const SURFACE_MIN_IMAGES: u32 = 2;
pub const SURFACE_MAX_IMAGES: u32 = 8;

/// Pick the in-flight slot count for a surface: the reported minimum unless
/// the desired count fits between the limits.
pub fn negotiated_slot_count(min_images: u32, max_images: u32, desired: u32) -> u32 {
    if desired <= max_images && desired > min_images {
        desired
    } else {
        min_images
    }
}

/// One platform output target bound to a configured GPU surface.
pub struct PresentationSurface {
    surface: wgpu::Surface<'static>,
    config: wgpu::SurfaceConfiguration,
    window: Arc<Window>,
}

impl PresentationSurface {
    /// Bind a window to a GPU surface and negotiate its format. Prefers an
    /// sRGB format when the surface offers one.
    pub fn new(ctx: &GpuContext, window: Arc<Window>) -> Result<Self> {
        let surface = ctx.instance.create_surface(window.clone())?;
        let caps = surface.get_capabilities(&ctx.adapter);
        let format = caps
            .formats
            .iter()
            .find(|f| f.is_srgb())
            .copied()
            .unwrap_or(caps.formats[0]);

        let size = window.inner_size();
        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: wgpu::PresentMode::AutoVsync,
            alpha_mode: caps.alpha_modes[0],
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&ctx.device, &config);
        info!(
            "presentation surface ready: {}x{} {:?}",
            config.width, config.height, config.format
        );

        Ok(Self {
            surface,
            config,
            window,
        })
    }

    pub fn format(&self) -> wgpu::TextureFormat {
        self.config.format
    }

    pub fn size(&self) -> (u32, u32) {
        (self.config.width, self.config.height)
    }

    pub fn window(&self) -> &Window {
        &self.window
    }

    /// Request the next presentable surface texture.
    pub fn acquire(&self) -> Result<wgpu::SurfaceTexture, wgpu::SurfaceError> {
        self.surface.get_current_texture()
    }

    /// Re-apply the current configuration, typically after the surface
    /// reported itself lost or outdated.
    pub fn reconfigure(&self, device: &wgpu::Device) {
        warn!("reconfiguring presentation surface");
        self.surface.configure(device, &self.config);
    }

    /// Track a window resize. Slot textures keep their original extent; the
    /// final blit pass scales into whatever the surface currently is.
    pub fn resize(&mut self, device: &wgpu::Device, new_size: PhysicalSize<u32>) {
        if new_size.width > 0 && new_size.height > 0 {
            self.config.width = new_size.width;
            self.config.height = new_size.height;
            self.surface.configure(device, &self.config);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiation_targets_desired_count_when_it_fits() {
        assert_eq!(negotiated_slot_count(2, 8, DESIRED_FRAME_SLOTS), 6);
    }

    #[test]
    fn negotiation_falls_back_to_minimum_when_capped() {
        // Desired exceeds the maximum
        assert_eq!(negotiated_slot_count(2, 4, 6), 2);
        // Minimum already at or above desired
        assert_eq!(negotiated_slot_count(6, 8, 6), 6);
        assert_eq!(negotiated_slot_count(7, 8, 6), 7);
    }
}
