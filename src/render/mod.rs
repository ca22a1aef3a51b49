//! Frame renderer: shared pipeline state and the per-frame multi-surface
//! submission protocol.

use crate::capture::CaptureBlock;
use crate::engine::FilterParams;
use crate::frame::{HardwareBuffer, QuadVertex};
use crate::gpu::import::ImportedImage;
use crate::gpu::GpuContext;
use crate::output::swapchain::{padded_bytes_per_row, SurfaceSwapchain};
use crate::sync::WaitScope;
use anyhow::{anyhow, Result};
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};
use wgpu::util::DeviceExt;

/// Number of toggleable effects carried in the filter configuration.
pub const NUM_EFFECTS: usize = 6;

/// Effect index whose enablement requires the previous rendered frame.
pub const TEMPORAL_EFFECT: usize = 5;

/// The per-frame counter wraps here so periodic shader functions never see
/// values large enough to drift.
pub const FRAME_COUNTER_WRAP: i32 = 3600 * 15;

/// Effect-stack shader: samples the imported camera frame (and the previous
/// frame for temporal effects) into a slot's color image.
const EFFECT_SHADER: &str = r#"
struct VertexInput {
    @location(0) position: vec2<f32>,
    @location(1) tex_coords: vec2<f32>,
}

struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) tex_coords: vec2<f32>,
}

struct ShaderVars {
    panel_id: i32,
    image_width: i32,
    image_height: i32,
    window_width: i32,
    window_height: i32,
    rotation: i32,
    effect_value1: i32,
    effect_value2: i32,
    effect_value3: i32,
    effect_value4: i32,
    effect_value5: i32,
    effect_value6: i32,
    time_value: i32,
    distortion_normal: f32,
    distortion_rotated: f32,
    effect_mask: u32,
}

@group(0) @binding(0) var t_camera: texture_2d<f32>;
@group(0) @binding(1) var s_camera: sampler;
@group(0) @binding(2) var t_previous: texture_2d<f32>;
@group(0) @binding(3) var s_previous: sampler;
@group(0) @binding(4) var<uniform> vars: ShaderVars;

const EFFECT_MONO: u32 = 1u;
const EFFECT_INVERT: u32 = 2u;
const EFFECT_POSTERIZE: u32 = 4u;
const EFFECT_WAVE: u32 = 8u;
const EFFECT_MIRROR: u32 = 16u;
const EFFECT_TRAILS: u32 = 32u;

@vertex
fn vs_main(in: VertexInput) -> VertexOutput {
    var out: VertexOutput;
    out.clip_position = vec4<f32>(in.position, 0.0, 1.0);
    out.tex_coords = in.tex_coords;
    return out;
}

fn rotate_uv(uv: vec2<f32>) -> vec2<f32> {
    if (vars.rotation == 90) {
        return vec2<f32>(uv.y, 1.0 - uv.x);
    } else if (vars.rotation == 180) {
        return vec2<f32>(1.0 - uv.x, 1.0 - uv.y);
    } else if (vars.rotation == 270) {
        return vec2<f32>(1.0 - uv.y, uv.x);
    }
    return uv;
}

@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    var uv = in.tex_coords;

    if ((vars.effect_mask & EFFECT_MIRROR) != 0u) {
        // funhouse fold around the vertical center line
        uv.x = abs(uv.x * 2.0 - 1.0);
    }
    if ((vars.effect_mask & EFFECT_WAVE) != 0u) {
        let strength = f32(vars.effect_value4) / 1000.0;
        uv.x = uv.x + sin(uv.y * 24.0 + f32(vars.time_value) * 0.15) * strength;
    }

    uv = rotate_uv(uv);

    var correction = vars.distortion_normal;
    if (vars.rotation == 90 || vars.rotation == 270) {
        correction = vars.distortion_rotated;
    }
    uv = vec2<f32>(0.5, 0.5) + (uv - vec2<f32>(0.5, 0.5)) * vec2<f32>(1.0, correction);
    uv = clamp(uv, vec2<f32>(0.0, 0.0), vec2<f32>(1.0, 1.0));

    var color = textureSample(t_camera, s_camera, uv);
    let previous = textureSample(t_previous, s_previous, in.tex_coords);

    if ((vars.effect_mask & EFFECT_MONO) != 0u) {
        let luma = dot(color.rgb, vec3<f32>(0.299, 0.587, 0.114));
        color = vec4<f32>(vec3<f32>(luma, luma, luma), color.a);
    }
    if ((vars.effect_mask & EFFECT_INVERT) != 0u) {
        color = vec4<f32>(vec3<f32>(1.0, 1.0, 1.0) - color.rgb, color.a);
    }
    if ((vars.effect_mask & EFFECT_POSTERIZE) != 0u) {
        let levels = max(2.0, f32(vars.effect_value3) / 10.0);
        color = vec4<f32>(floor(color.rgb * levels) / levels, color.a);
    }
    if ((vars.effect_mask & EFFECT_TRAILS) != 0u) {
        let persistence = clamp(f32(vars.effect_value6) / 100.0, 0.0, 0.95);
        color = vec4<f32>(mix(color.rgb, previous.rgb, persistence), color.a);
    }

    return color;
}
"#;

/// Plain textured-quad shader used for the present blit and the capture
/// downscale pass.
const BLIT_SHADER: &str = r#"
struct VertexInput {
    @location(0) position: vec2<f32>,
    @location(1) tex_coords: vec2<f32>,
}

struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) tex_coords: vec2<f32>,
}

@vertex
fn vs_main(in: VertexInput) -> VertexOutput {
    var out: VertexOutput;
    out.clip_position = vec4<f32>(in.position, 0.0, 1.0);
    out.tex_coords = in.tex_coords;
    return out;
}

@group(0) @binding(0) var t_texture: texture_2d<f32>;
@group(0) @binding(1) var s_sampler: sampler;

@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    return textureSample(t_texture, s_sampler, in.tex_coords);
}
"#;

/// Per-frame shader parameters, one uniform buffer per frame slot.
#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ShaderVars {
    pub panel_id: i32,
    pub image_width: i32,
    pub image_height: i32,
    pub window_width: i32,
    pub window_height: i32,
    pub rotation: i32,
    pub effect_values: [i32; NUM_EFFECTS],
    pub time_value: i32,
    pub distortion_normal: f32,
    pub distortion_rotated: f32,
    pub effect_mask: u32,
}

/// Outcome of one `render` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderState {
    NotSet,
    FrameSubmitted,
    QueueNotEmpty,
    QueueEmpty,
}

/// Build the enabled-effects bitmask, most significant effect first, so
/// that bit `i` of the result corresponds to effect `i`.
pub fn effect_bitmask(toggles: &[bool; NUM_EFFECTS]) -> u32 {
    let mut mask = 0u32;
    for i in 0..NUM_EFFECTS {
        mask <<= 1;
        if toggles[NUM_EFFECTS - 1 - i] {
            mask |= 1;
        }
    }
    mask
}

/// The shared pipeline objects rebuilt whenever sampler requirements change.
struct EffectPipeline {
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline: wgpu::RenderPipeline,
    conversion_sampler: bool,
}

/// Orchestrates all active surface swapchains and owns the shared render
/// state: quad geometry, the effect pipeline, and the blit pipelines.
pub struct FrameRenderer {
    ctx: Arc<GpuContext>,
    swapchains: Vec<SurfaceSwapchain>,
    vertex_buffer: wgpu::Buffer,
    index_buffer: wgpu::Buffer,
    effect_module: wgpu::ShaderModule,
    blit_bind_group_layout: wgpu::BindGroupLayout,
    /// One present-blit pipeline per surface: surface formats can differ.
    blit_pipelines: Vec<wgpu::RenderPipeline>,
    capture_pipeline: wgpu::RenderPipeline,
    rgb_sampler: wgpu::Sampler,
    pipeline: Option<EffectPipeline>,
    image_extent: (u32, u32),
    time_value: i32,
    /// Slot index on the first surface holding frame N-1, the designated
    /// source for the previous-frame copy.
    prev_frame_slot: usize,
}

impl FrameRenderer {
    pub fn new(
        ctx: Arc<GpuContext>,
        swapchains: Vec<SurfaceSwapchain>,
        image_extent: (u32, u32),
    ) -> Result<Self> {
        let device = &ctx.device;

        let vertex_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Quad Vertex Buffer"),
            contents: bytemuck::cast_slice(QuadVertex::VERTICES),
            usage: wgpu::BufferUsages::VERTEX,
        });
        let index_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Quad Index Buffer"),
            contents: bytemuck::cast_slice(QuadVertex::INDICES),
            usage: wgpu::BufferUsages::INDEX,
        });

        let effect_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Effect Shader"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(EFFECT_SHADER)),
        });
        let blit_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Blit Shader"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(BLIT_SHADER)),
        });

        let blit_bind_group_layout =
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("Blit Bind Group Layout"),
                entries: &[
                    wgpu::BindGroupLayoutEntry {
                        binding: 0,
                        visibility: wgpu::ShaderStages::FRAGMENT,
                        ty: wgpu::BindingType::Texture {
                            sample_type: wgpu::TextureSampleType::Float { filterable: true },
                            view_dimension: wgpu::TextureViewDimension::D2,
                            multisampled: false,
                        },
                        count: None,
                    },
                    wgpu::BindGroupLayoutEntry {
                        binding: 1,
                        visibility: wgpu::ShaderStages::FRAGMENT,
                        ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                        count: None,
                    },
                ],
            });

        let blit_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Blit Pipeline Layout"),
            bind_group_layouts: &[&blit_bind_group_layout],
            immediate_size: 0,
        });

        let blit_pipelines = swapchains
            .iter()
            .map(|sc| {
                Self::build_blit_pipeline(device, &blit_layout, &blit_module, sc.surface.format())
            })
            .collect();
        let capture_pipeline = Self::build_blit_pipeline(
            device,
            &blit_layout,
            &blit_module,
            wgpu::TextureFormat::Rgba8Unorm,
        );

        // Sampler for the previous-frame image
        let rgb_sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Previous Frame Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Nearest,
            min_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        Ok(Self {
            ctx,
            swapchains,
            vertex_buffer,
            index_buffer,
            effect_module,
            blit_bind_group_layout,
            blit_pipelines,
            capture_pipeline,
            rgb_sampler,
            pipeline: None,
            image_extent,
            time_value: 0,
            prev_frame_slot: 0,
        })
    }

    fn build_blit_pipeline(
        device: &wgpu::Device,
        layout: &wgpu::PipelineLayout,
        module: &wgpu::ShaderModule,
        format: wgpu::TextureFormat,
    ) -> wgpu::RenderPipeline {
        device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Blit Pipeline"),
            layout: Some(layout),
            vertex: wgpu::VertexState {
                module,
                entry_point: Some("vs_main"),
                buffers: &[QuadVertex::layout()],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                strip_index_format: None,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: None,
                polygon_mode: wgpu::PolygonMode::Fill,
                unclipped_depth: false,
                conservative: false,
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview_mask: None,
            cache: None,
        })
    }

    /// Whether the pipeline must be (re)built for a source with the given
    /// conversion requirement.
    pub fn needs_pipeline(&self, conversion_sampler: bool) -> bool {
        match &self.pipeline {
            None => true,
            Some(pipeline) => pipeline.conversion_sampler != conversion_sampler,
        }
    }

    /// Number of live shared pipeline/layout sets; always zero or one.
    pub fn live_pipeline_sets(&self) -> usize {
        usize::from(self.pipeline.is_some())
    }

    /// Build the shared effect pipeline. Idempotent by recreation: any
    /// previously built pipeline and layouts are destroyed first, because
    /// the first imported frame fixes the sampler configuration and every
    /// later frame must match it.
    pub fn init_pipeline(&mut self, conversion_sampler: bool) {
        self.pipeline = None;
        let device = &self.ctx.device;

        let bind_group_layout =
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("Effect Bind Group Layout"),
                entries: &[
                    wgpu::BindGroupLayoutEntry {
                        binding: 0,
                        visibility: wgpu::ShaderStages::FRAGMENT,
                        ty: wgpu::BindingType::Texture {
                            sample_type: wgpu::TextureSampleType::Float { filterable: true },
                            view_dimension: wgpu::TextureViewDimension::D2,
                            multisampled: false,
                        },
                        count: None,
                    },
                    wgpu::BindGroupLayoutEntry {
                        binding: 1,
                        visibility: wgpu::ShaderStages::FRAGMENT,
                        ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                        count: None,
                    },
                    wgpu::BindGroupLayoutEntry {
                        binding: 2,
                        visibility: wgpu::ShaderStages::FRAGMENT,
                        ty: wgpu::BindingType::Texture {
                            sample_type: wgpu::TextureSampleType::Float { filterable: true },
                            view_dimension: wgpu::TextureViewDimension::D2,
                            multisampled: false,
                        },
                        count: None,
                    },
                    wgpu::BindGroupLayoutEntry {
                        binding: 3,
                        visibility: wgpu::ShaderStages::FRAGMENT,
                        ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                        count: None,
                    },
                    wgpu::BindGroupLayoutEntry {
                        binding: 4,
                        visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
                        ty: wgpu::BindingType::Buffer {
                            ty: wgpu::BufferBindingType::Uniform,
                            has_dynamic_offset: false,
                            min_binding_size: None,
                        },
                        count: None,
                    },
                ],
            });

        let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Effect Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            immediate_size: 0,
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Effect Pipeline"),
            layout: Some(&layout),
            vertex: wgpu::VertexState {
                module: &self.effect_module,
                entry_point: Some("vs_main"),
                buffers: &[QuadVertex::layout()],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &self.effect_module,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format: wgpu::TextureFormat::Rgba8Unorm,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                strip_index_format: None,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: None,
                polygon_mode: wgpu::PolygonMode::Fill,
                unclipped_depth: false,
                conservative: false,
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview_mask: None,
            cache: None,
        });

        debug!("effect pipeline built (conversion sampler: {conversion_sampler})");
        self.pipeline = Some(EffectPipeline {
            bind_group_layout,
            pipeline,
            conversion_sampler,
        });
    }

    fn blit_bind_group(&self, view: &wgpu::TextureView) -> wgpu::BindGroup {
        self.ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Blit Bind Group"),
            layout: &self.blit_bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&self.rgb_sampler),
                },
            ],
        })
    }

    fn build_shader_vars(&self, surface_i: usize, params: &FilterParams) -> ShaderVars {
        let sc = &self.swapchains[surface_i];
        let (win_w, win_h) = sc.extent();
        ShaderVars {
            panel_id: surface_i as i32,
            image_width: self.image_extent.0 as i32,
            image_height: self.image_extent.1 as i32,
            window_width: win_w as i32,
            window_height: win_h as i32,
            rotation: params.rotation,
            effect_values: params.values,
            time_value: self.time_value,
            distortion_normal: sc.distortion_normal,
            distortion_rotated: sc.distortion_rotated,
            effect_mask: effect_bitmask(&params.toggles),
        }
    }

    /// Render one frame to every active surface.
    ///
    /// With drawing disabled this instead drains every swapchain and
    /// releases held camera buffers. Otherwise, in fixed surface order:
    /// acquire the next slot, record the optional capture and
    /// previous-frame copies (first surface only), record and submit the
    /// effect and present passes, and hold the camera buffer in the slot
    /// until its submission completes on a later acquire. All surfaces are
    /// presented together at the end so multi-display output stays
    /// frame-aligned.
    ///
    /// Returns the render state and a best-effort submission latency in
    /// milliseconds (advisory only).
    pub fn render(
        &mut self,
        source: &ImportedImage,
        buffer: &Arc<HardwareBuffer>,
        params: &FilterParams,
        draw_to_screen: bool,
        mut capture_target: Option<&mut CaptureBlock>,
    ) -> Result<(RenderState, f64)> {
        let device = &self.ctx.device;

        if !draw_to_screen {
            let mut all_drained = true;
            for sc in &mut self.swapchains {
                if let Err(e) = sc.drain(device) {
                    warn!("swapchain drain failed: {e:#}");
                    all_drained = false;
                }
            }
            let state = if all_drained && self.swapchains.iter().all(|sc| sc.is_drained()) {
                RenderState::QueueEmpty
            } else {
                RenderState::QueueNotEmpty
            };
            return Ok((state, 0.0));
        }

        if self.pipeline.is_none() {
            return Err(anyhow!("render called before pipeline initialization"));
        }

        let started = Instant::now();
        let mut state = RenderState::NotSet;

        // Shaders only need an increasing value, not wall-clock time
        self.time_value += 1;
        if self.time_value >= FRAME_COUNTER_WRAP {
            self.time_value = 0;
        }

        // Grab the next slot on every surface before recording anything, so
        // all surfaces move through their rings in lockstep.
        for i in 0..self.swapchains.len() {
            self.swapchains[i].acquire_next(device)?;
        }

        let temporal = params.toggles[TEMPORAL_EFFECT];
        let prev_index = self.prev_frame_slot;
        let num_surfaces = self.swapchains.len();
        let mut presents: Vec<(usize, wgpu::SurfaceTexture)> = Vec::with_capacity(num_surfaces);
        let mut capture_submission: Option<wgpu::SubmissionIndex> = None;

        for surface_i in 0..num_surfaces {
            let vars = self.build_shader_vars(surface_i, params);
            let do_capture = surface_i == 0 && capture_target.is_some();

            let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Frame Encoder"),
            });

            {
                let sc = &self.swapchains[surface_i];
                let slot = sc.current_slot();
                self.ctx
                    .queue
                    .write_buffer(&slot.shader_vars, 0, bytemuck::cast_slice(&[vars]));

                if do_capture {
                    // The slot still holds its last presented content; that
                    // is what lands in the capture block.
                    let bind = self.blit_bind_group(&slot.color_view);
                    {
                        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                            label: Some("Capture Pass"),
                            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                                view: &slot.capture_view,
                                resolve_target: None,
                                ops: wgpu::Operations {
                                    load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                                    store: wgpu::StoreOp::Store,
                                },
                                depth_slice: None,
                            })],
                            depth_stencil_attachment: None,
                            timestamp_writes: None,
                            occlusion_query_set: None,
                            multiview_mask: None,
                        });
                        pass.set_pipeline(&self.capture_pipeline);
                        pass.set_bind_group(0, &bind, &[]);
                        pass.set_vertex_buffer(0, self.vertex_buffer.slice(..));
                        pass.set_index_buffer(self.index_buffer.slice(..), wgpu::IndexFormat::Uint16);
                        pass.draw_indexed(0..QuadVertex::INDICES.len() as u32, 0, 0..1);
                    }
                    let (cap_w, cap_h) = sc.capture_extent();
                    encoder.copy_texture_to_buffer(
                        wgpu::TexelCopyTextureInfo {
                            texture: &slot.capture,
                            mip_level: 0,
                            origin: wgpu::Origin3d::ZERO,
                            aspect: wgpu::TextureAspect::All,
                        },
                        wgpu::TexelCopyBufferInfo {
                            buffer: &slot.readback,
                            layout: wgpu::TexelCopyBufferLayout {
                                offset: 0,
                                bytes_per_row: Some(padded_bytes_per_row(cap_w)),
                                rows_per_image: Some(cap_h),
                            },
                        },
                        wgpu::Extent3d {
                            width: cap_w,
                            height: cap_h,
                            depth_or_array_layers: 1,
                        },
                    );
                }

                // Retain frame N-1 for temporal effects. Only the first
                // surface feeds this, so multi-display output cannot pick
                // up out-of-order frames from a sibling surface.
                if surface_i == 0 && temporal {
                    let prev_slot = sc.slot(prev_index);
                    let (win_w, win_h) = sc.extent();
                    encoder.copy_texture_to_texture(
                        prev_slot.color.as_image_copy(),
                        slot.previous.as_image_copy(),
                        wgpu::Extent3d {
                            width: win_w,
                            height: win_h,
                            depth_or_array_layers: 1,
                        },
                    );
                }

                let pipeline = self.pipeline.as_ref().expect("checked above");
                let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("Effect Bind Group"),
                    layout: &pipeline.bind_group_layout,
                    entries: &[
                        wgpu::BindGroupEntry {
                            binding: 0,
                            resource: wgpu::BindingResource::TextureView(source.view()),
                        },
                        wgpu::BindGroupEntry {
                            binding: 1,
                            resource: wgpu::BindingResource::Sampler(source.sampler()),
                        },
                        wgpu::BindGroupEntry {
                            binding: 2,
                            resource: wgpu::BindingResource::TextureView(&slot.previous_view),
                        },
                        wgpu::BindGroupEntry {
                            binding: 3,
                            resource: wgpu::BindingResource::Sampler(&self.rgb_sampler),
                        },
                        wgpu::BindGroupEntry {
                            binding: 4,
                            resource: slot.shader_vars.as_entire_binding(),
                        },
                    ],
                });

                {
                    let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                        label: Some("Effect Pass"),
                        color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                            view: &slot.color_view,
                            resolve_target: None,
                            ops: wgpu::Operations {
                                load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                                store: wgpu::StoreOp::Store,
                            },
                            depth_slice: None,
                        })],
                        depth_stencil_attachment: None,
                        timestamp_writes: None,
                        occlusion_query_set: None,
                        multiview_mask: None,
                    });
                    pass.set_pipeline(&pipeline.pipeline);
                    pass.set_bind_group(0, &bind_group, &[]);
                    pass.set_vertex_buffer(0, self.vertex_buffer.slice(..));
                    pass.set_index_buffer(self.index_buffer.slice(..), wgpu::IndexFormat::Uint16);
                    pass.draw_indexed(0..QuadVertex::INDICES.len() as u32, 0, 0..1);
                }
            }

            // Blit the finished slot into a presentable surface image. A
            // resized or lost surface drops this surface's frame and keeps
            // the engine going.
            match self.swapchains[surface_i].surface.acquire() {
                Ok(surface_texture) => {
                    let view = surface_texture
                        .texture
                        .create_view(&wgpu::TextureViewDescriptor::default());
                    let slot_view_bind = {
                        let slot = self.swapchains[surface_i].current_slot();
                        self.blit_bind_group(&slot.color_view)
                    };
                    {
                        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                            label: Some("Present Pass"),
                            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                                view: &view,
                                resolve_target: None,
                                ops: wgpu::Operations {
                                    load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                                    store: wgpu::StoreOp::Store,
                                },
                                depth_slice: None,
                            })],
                            depth_stencil_attachment: None,
                            timestamp_writes: None,
                            occlusion_query_set: None,
                            multiview_mask: None,
                        });
                        pass.set_pipeline(&self.blit_pipelines[surface_i]);
                        pass.set_bind_group(0, &slot_view_bind, &[]);
                        pass.set_vertex_buffer(0, self.vertex_buffer.slice(..));
                        pass.set_index_buffer(self.index_buffer.slice(..), wgpu::IndexFormat::Uint16);
                        pass.draw_indexed(0..QuadVertex::INDICES.len() as u32, 0, 0..1);
                    }
                    presents.push((surface_i, surface_texture));
                }
                Err(e) => {
                    warn!("surface {surface_i} not presentable this frame: {e:?}");
                    self.swapchains[surface_i].surface.reconfigure(device);
                }
            }

            let submission = self.ctx.queue.submit(std::iter::once(encoder.finish()));
            if do_capture {
                capture_submission = Some(submission.clone());
            }

            let slot = self.swapchains[surface_i].current_slot_mut();
            slot.pending = Some(submission);
            // Every surface samples the same camera buffer this frame; each
            // slot holds its own handle, and the buffer itself is freed
            // only when the last surface lets go of it.
            slot.held_buffer = Some(buffer.clone());
            state = RenderState::FrameSubmitted;
        }

        self.prev_frame_slot = self.swapchains[0].current_index();

        if let (Some(block), Some(submission)) = (capture_target.as_deref_mut(), capture_submission)
        {
            self.read_capture(submission, block)?;
        }

        for (surface_i, surface_texture) in presents {
            surface_texture.present();
            self.swapchains[surface_i].note_presented();
        }

        Ok((state, started.elapsed().as_secs_f64() * 1000.0))
    }

    /// Wait out the capture submission, then copy the readback buffer into
    /// the capture block, dropping the per-row copy padding.
    fn read_capture(
        &self,
        submission: wgpu::SubmissionIndex,
        block: &mut CaptureBlock,
    ) -> Result<()> {
        let sc = &self.swapchains[0];
        let slot = sc.current_slot();
        let (cap_w, cap_h) = sc.capture_extent();
        let wait = WaitScope::new(&self.ctx.device);
        wait.submission(submission)?;

        let slice = slot.readback.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        wait.queue_idle()?;
        receiver.recv()??;

        {
            let data = slice.get_mapped_range();
            block.reset(cap_w, cap_h);
            let padded = padded_bytes_per_row(cap_w) as usize;
            let row = (cap_w * 4) as usize;
            for y in 0..cap_h as usize {
                block.data[y * row..(y + 1) * row]
                    .copy_from_slice(&data[y * padded..y * padded + row]);
            }
        }
        slot.readback.unmap();
        Ok(())
    }

    pub fn swapchains(&self) -> &[SurfaceSwapchain] {
        &self.swapchains
    }

    pub fn swapchains_mut(&mut self) -> &mut [SurfaceSwapchain] {
        &mut self.swapchains
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmask_bit_i_tracks_effect_i() {
        let mut toggles = [false; NUM_EFFECTS];
        assert_eq!(effect_bitmask(&toggles), 0);

        for i in 0..NUM_EFFECTS {
            toggles = [false; NUM_EFFECTS];
            toggles[i] = true;
            assert_eq!(effect_bitmask(&toggles), 1 << i, "effect {i}");
        }
    }

    #[test]
    fn bitmask_combines_all_enabled_effects() {
        let mut toggles = [false; NUM_EFFECTS];
        toggles[0] = true;
        toggles[2] = true;
        toggles[5] = true;
        assert_eq!(effect_bitmask(&toggles), 0b100101);
        assert_eq!(effect_bitmask(&[true; NUM_EFFECTS]), 0b111111);
    }

    #[test]
    fn frame_counter_wraps_before_periodic_drift() {
        let mut time = FRAME_COUNTER_WRAP - 1;
        time += 1;
        if time >= FRAME_COUNTER_WRAP {
            time = 0;
        }
        assert_eq!(time, 0);
    }

    #[test]
    fn shader_vars_layout_is_uniform_compatible() {
        // The WGSL mirror declares sixteen 4-byte scalars
        assert_eq!(std::mem::size_of::<ShaderVars>(), 64);
    }
}
