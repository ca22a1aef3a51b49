//! Frame buffer types shared between the frame source and the GPU importer.

use crate::sync::FrameFence;
use anyhow::{anyhow, Result};
use bytemuck::{Pod, Zeroable};
use std::sync::Arc;

/// Pixel formats a hardware buffer may arrive in.
///
/// Camera pipelines normally hand out semi-planar or packed YUV; RGBA only
/// appears from synthetic sources and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// RGBA with 8 bits per channel
    Rgba,
    /// NV12 semi-planar format (Y plane + interleaved UV)
    Nv12,
    /// YUV 4:2:2 packed format (Y0 U0 Y1 V0)
    Yuyv,
}

impl PixelFormat {
    /// Total byte length of a buffer of this format at the given dimensions.
    pub fn buffer_len(&self, width: u32, height: u32) -> usize {
        let (w, h) = (width as usize, height as usize);
        match self {
            PixelFormat::Rgba => w * h * 4,
            PixelFormat::Yuyv => w * h * 2,
            PixelFormat::Nv12 => {
                let y = w * h;
                let uv_stride = w + (w % 2);
                let uv = uv_stride * h.div_ceil(2);
                y + uv
            }
        }
    }

    /// Whether sampling this format requires a color-space conversion first.
    pub fn needs_conversion(&self) -> bool {
        !matches!(self, PixelFormat::Rgba)
    }
}

/// One externally-owned pixel buffer.
///
/// The frame source owns a small fixed pool of these and recycles them; `id`
/// is the source-assigned stable identity of the physical buffer, so it is a
/// safe cache key across frames (unlike a memory address).
#[derive(Debug)]
pub struct HardwareBuffer {
    pub id: u64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Vec<u8>,
}

impl HardwareBuffer {
    pub fn new(id: u64, width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            id,
            width,
            height,
            format,
            data: vec![0; format.buffer_len(width, height)],
        }
    }

    /// True when the byte length describes exactly one image layer of the
    /// declared format.
    pub fn is_single_layer(&self) -> bool {
        self.data.len() == self.format.buffer_len(self.width, self.height)
    }

    /// Convert the buffer contents to tightly packed RGBA bytes.
    ///
    /// RGBA buffers are returned as a plain copy; YUV formats run through
    /// ezk-image.
    pub fn to_rgba(&self) -> Result<Vec<u8>> {
        if self.format == PixelFormat::Rgba {
            return Ok(self.data.clone());
        }

        let width = self.width as usize;
        let height = self.height as usize;
        let mut rgba = vec![0u8; width * height * 4];

        let mut dst = ezk_image::Image::from_buffer(
            ezk_image::PixelFormat::RGBA,
            &mut rgba[..],
            None,
            width,
            height,
            rgb_color_info(),
        )
        .map_err(|e| anyhow!("wrapping RGBA destination failed: {e:?}"))?;

        let src_format = match self.format {
            PixelFormat::Nv12 => ezk_image::PixelFormat::NV12,
            PixelFormat::Yuyv => ezk_image::PixelFormat::YUYV,
            PixelFormat::Rgba => unreachable!(),
        };
        let src = ezk_image::Image::from_buffer(
            src_format,
            &self.data[..],
            None,
            width,
            height,
            yuv_color_info(),
        )
        .map_err(|e| anyhow!("wrapping {:?} source failed: {e:?}", self.format))?;

        ezk_image::convert(&src, &mut dst)
            .map_err(|e| anyhow!("{:?} -> RGBA conversion failed: {e:?}", self.format))?;

        Ok(rgba)
    }
}

fn rgb_color_info() -> ezk_image::ColorInfo {
    ezk_image::ColorInfo::RGB(ezk_image::RgbColorInfo {
        transfer: ezk_image::ColorTransfer::Linear,
        primaries: ezk_image::ColorPrimaries::BT709,
    })
}

fn yuv_color_info() -> ezk_image::ColorInfo {
    ezk_image::ColorInfo::YUV(ezk_image::YuvColorInfo {
        transfer: ezk_image::ColorTransfer::Linear,
        primaries: ezk_image::ColorPrimaries::BT709,
        space: ezk_image::ColorSpace::BT709,
        full_range: false,
    })
}

/// One delivered camera frame: the shared buffer plus an optional producer
/// fence that must be signaled before the buffer contents may be read.
#[derive(Debug, Clone)]
pub struct HardwareFrame {
    pub buffer: Arc<HardwareBuffer>,
    pub fence: Option<FrameFence>,
}

impl HardwareFrame {
    pub fn new(buffer: Arc<HardwareBuffer>) -> Self {
        Self {
            buffer,
            fence: None,
        }
    }

    pub fn with_fence(buffer: Arc<HardwareBuffer>, fence: FrameFence) -> Self {
        Self {
            buffer,
            fence: Some(fence),
        }
    }
}

/// Vertex for rendering a full-surface quad.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct QuadVertex {
    pub position: [f32; 2],
    pub tex_coords: [f32; 2],
}

impl QuadVertex {
    /// Vertices for a full-surface quad.
    pub const VERTICES: &'static [QuadVertex] = &[
        QuadVertex { position: [-1.0, -1.0], tex_coords: [0.0, 1.0] },
        QuadVertex { position: [1.0, -1.0], tex_coords: [1.0, 1.0] },
        QuadVertex { position: [1.0, 1.0], tex_coords: [1.0, 0.0] },
        QuadVertex { position: [-1.0, 1.0], tex_coords: [0.0, 0.0] },
    ];

    /// Indices for the quad (two triangles).
    pub const INDICES: &'static [u16] = &[0, 1, 2, 2, 3, 0];

    /// Returns the vertex buffer layout.
    pub fn layout() -> wgpu::VertexBufferLayout<'static> {
        wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<QuadVertex>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &[
                wgpu::VertexAttribute {
                    offset: 0,
                    shader_location: 0,
                    format: wgpu::VertexFormat::Float32x2,
                },
                wgpu::VertexAttribute {
                    offset: std::mem::size_of::<[f32; 2]>() as wgpu::BufferAddress,
                    shader_location: 1,
                    format: wgpu::VertexFormat::Float32x2,
                },
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_len_matches_format_layout() {
        assert_eq!(PixelFormat::Rgba.buffer_len(4, 2), 32);
        assert_eq!(PixelFormat::Yuyv.buffer_len(4, 2), 16);
        // NV12: 4x2 Y plane + 4x1 interleaved UV
        assert_eq!(PixelFormat::Nv12.buffer_len(4, 2), 12);
        // Odd width pads the UV stride
        assert_eq!(PixelFormat::Nv12.buffer_len(3, 3), 9 + 4 * 2);
    }

    #[test]
    fn single_layer_check_rejects_truncated_buffers() {
        let mut buffer = HardwareBuffer::new(1, 4, 4, PixelFormat::Rgba);
        assert!(buffer.is_single_layer());
        buffer.data.truncate(10);
        assert!(!buffer.is_single_layer());
    }

    #[test]
    fn rgba_to_rgba_is_a_copy() {
        let mut buffer = HardwareBuffer::new(7, 2, 2, PixelFormat::Rgba);
        buffer.data.copy_from_slice(&[
            255, 0, 0, 255, 0, 255, 0, 255, 0, 0, 255, 255, 255, 255, 255, 255,
        ]);
        let rgba = buffer.to_rgba().unwrap();
        assert_eq!(rgba, buffer.data);
    }

    #[test]
    fn yuyv_converts_to_rgba_length() {
        let buffer = HardwareBuffer::new(2, 4, 4, PixelFormat::Yuyv);
        let rgba = buffer.to_rgba().unwrap();
        assert_eq!(rgba.len(), 4 * 4 * 4);
    }
}
