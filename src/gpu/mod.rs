//! Shared GPU context for wgpu resources.

pub mod import;

use anyhow::{anyhow, Result};
use std::sync::Arc;
use winit::window::Window;

/// Shared GPU resources used by every engine component.
pub struct GpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub instance: wgpu::Instance,
    pub adapter: wgpu::Adapter,
}

impl GpuContext {
    /// Initialize a GPU context, optionally compatible with the given
    /// window's surface. With no window the adapter is chosen for offscreen
    /// use; surfaces created later from the same instance still work on
    /// every backend the engine targets.
    ///
    /// A missing adapter or device is a fatal initialization failure and is
    /// surfaced to the caller instead of degrading.
    pub fn new(window: Option<&Arc<Window>>) -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let surface = match window {
            Some(window) => Some(instance.create_surface(window.clone())?),
            None => None,
        };

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: surface.as_ref(),
            force_fallback_adapter: false,
        }))
        .map_err(|e| anyhow!("no suitable GPU adapter: {e:?}"))?;

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("Kaleido Device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                memory_hints: wgpu::MemoryHints::Performance,
                ..Default::default()
            },
        ))?;

        Ok(Self {
            device,
            queue,
            instance,
            adapter,
        })
    }
}
