//! Import of externally-owned frame buffers into GPU textures.

use super::GpuContext;
use crate::frame::HardwareFrame;
use anyhow::{ensure, Context, Result};
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// One camera frame imported for GPU sampling: a dedicated texture bound to
/// exactly one hardware buffer, its view, and its sampler.
///
/// Lifetime is scoped to a single frame unless the image is held in an
/// [`ImportCache`], in which case it lives until the cache is cleared.
pub struct ImportedImage {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    sampler: wgpu::Sampler,
    converted: bool,
    width: u32,
    height: u32,
}

impl ImportedImage {
    /// Import one hardware buffer.
    ///
    /// Precondition: the buffer holds exactly one image layer. If its native
    /// format requires color-space conversion, the conversion runs here and
    /// `use_conversion` must be set; the resulting sampler configuration is
    /// then fixed for the pipeline's lifetime. If a producer fence
    /// accompanies the frame it is waited on before the buffer is read.
    ///
    /// Failure is fatal only to this frame: the caller drops the frame and
    /// continues with the next callback.
    pub fn import(ctx: &GpuContext, frame: &HardwareFrame, use_conversion: bool) -> Result<Self> {
        let buffer = &frame.buffer;
        ensure!(
            buffer.is_single_layer(),
            "buffer {} does not describe a single image layer",
            buffer.id
        );

        if let Some(fence) = &frame.fence {
            fence.wait();
        }

        let converted = buffer.format.needs_conversion();
        let pixels: Cow<'_, [u8]> = if converted {
            ensure!(
                use_conversion,
                "buffer {} is {:?} but format conversion was not requested",
                buffer.id,
                buffer.format
            );
            Cow::Owned(
                buffer
                    .to_rgba()
                    .with_context(|| format!("converting buffer {}", buffer.id))?,
            )
        } else {
            Cow::Borrowed(&buffer.data[..])
        };

        let texture = ctx.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Imported Frame"),
            size: wgpu::Extent3d {
                width: buffer.width,
                height: buffer.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });

        ctx.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &pixels,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(buffer.width * 4),
                rows_per_image: Some(buffer.height),
            },
            wgpu::Extent3d {
                width: buffer.width,
                height: buffer.height,
                depth_or_array_layers: 1,
            },
        );

        let sampler = ctx.device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Imported Frame Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Nearest,
            min_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());

        Ok(Self {
            texture,
            view,
            sampler,
            converted,
            width: buffer.width,
            height: buffer.height,
        })
    }

    pub fn view(&self) -> &wgpu::TextureView {
        &self.view
    }

    pub fn sampler(&self) -> &wgpu::Sampler {
        &self.sampler
    }

    pub fn texture(&self) -> &wgpu::Texture {
        &self.texture
    }

    /// Whether the import performed a color-space conversion. The render
    /// pipeline's sampler configuration depends on this and must be rebuilt
    /// if it changes between frames.
    pub fn has_conversion(&self) -> bool {
        self.converted
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// Identity-keyed cache of imported buffers.
///
/// Import is expensive (conversion plus a full texture upload), and the
/// upstream source cycles through a small fixed pool of physical buffers,
/// so the cost is paid once per pool buffer. Only valid when buffers come
/// from a bounded, stable pool: an unbounded id space would grow the cache
/// without limit.
pub struct ImportCache {
    entries: HashMap<u64, Arc<ImportedImage>>,
}

impl ImportCache {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Return the imported representation of the frame's buffer, importing
    /// on first sight. The upload is refreshed on every call because the
    /// pool recycles buffer contents frame to frame; only the GPU objects
    /// are reused.
    pub fn resolve(
        &mut self,
        ctx: &GpuContext,
        frame: &HardwareFrame,
        use_conversion: bool,
    ) -> Result<Arc<ImportedImage>> {
        if let Some(existing) = self.entries.get(&frame.buffer.id) {
            if existing.size() == (frame.buffer.width, frame.buffer.height) {
                let image = existing.clone();
                Self::refresh(ctx, frame, &image)?;
                return Ok(image);
            }
            debug!("buffer {} changed dimensions, re-importing", frame.buffer.id);
        }

        let image = Arc::new(ImportedImage::import(ctx, frame, use_conversion)?);
        self.entries.insert(frame.buffer.id, image.clone());
        debug!(
            "imported buffer {} ({} cached)",
            frame.buffer.id,
            self.entries.len()
        );
        Ok(image)
    }

    fn refresh(ctx: &GpuContext, frame: &HardwareFrame, image: &ImportedImage) -> Result<()> {
        if let Some(fence) = &frame.fence {
            fence.wait();
        }
        let pixels: Cow<'_, [u8]> = if image.converted {
            Cow::Owned(frame.buffer.to_rgba()?)
        } else {
            Cow::Borrowed(&frame.buffer.data[..])
        };
        ctx.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &image.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &pixels,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(image.width * 4),
                rows_per_image: Some(image.height),
            },
            wgpu::Extent3d {
                width: image.width,
                height: image.height,
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every cached import. Callers must ensure the GPU is idle first.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl Default for ImportCache {
    fn default() -> Self {
        Self::new()
    }
}
