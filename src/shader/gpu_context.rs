//! Headless GPU context for offscreen transition rendering.

use crate::error::{Result, SetupStage, TransitionError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Format of every render target and input texture.
pub const TEXTURE_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

struct SurfaceInner {
    device: wgpu::Device,
    queue: wgpu::Queue,
    // Kept alive for the device's lifetime.
    _adapter: wgpu::Adapter,
    _instance: wgpu::Instance,
    _surface: wgpu::Texture,
}

/// Offscreen GPU context owned by one filter instance.
///
/// Every render call must go through [`RenderSurface::make_current`] first.
/// The surface is a 1x1 texture; drawing targets a separately allocated
/// texture sized to the output.
pub struct RenderSurface {
    inner: Option<SurfaceInner>,
    lost: Arc<AtomicBool>,
}

impl RenderSurface {
    /// Acquires an adapter, opens a device and creates the offscreen surface.
    pub fn new() -> Result<Self> {
        info!("Initializing headless GPU context...");
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .map_err(|e| TransitionError::Context {
            stage: SetupStage::Adapter,
            reason: format!("{:?}", e),
        })?;
        debug!("Using GPU adapter {:?}", adapter.get_info().name);

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("Transition Device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::downlevel_defaults().using_resolution(adapter.limits()),
            memory_hints: wgpu::MemoryHints::Performance,
            ..Default::default()
        }))
        .map_err(|e| TransitionError::Context {
            stage: SetupStage::Device,
            reason: e.to_string(),
        })?;

        let lost = Arc::new(AtomicBool::new(false));
        let lost_flag = lost.clone();
        device.set_device_lost_callback(move |reason, message| {
            warn!("GPU device lost ({:?}): {}", reason, message);
            lost_flag.store(true, Ordering::SeqCst);
        });

        let features = adapter.get_texture_format_features(TEXTURE_FORMAT);
        if !features
            .allowed_usages
            .contains(wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC)
        {
            return Err(TransitionError::Context {
                stage: SetupStage::Surface,
                reason: format!("{:?} is not renderable on this adapter", TEXTURE_FORMAT),
            });
        }
        let surface = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Offscreen Surface"),
            size: wgpu::Extent3d {
                width: 1,
                height: 1,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: TEXTURE_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            view_formats: &[],
        });

        let render_surface = Self {
            inner: Some(SurfaceInner {
                device,
                queue,
                _adapter: adapter,
                _instance: instance,
                _surface: surface,
            }),
            lost,
        };
        render_surface
            .make_current()
            .map_err(|e| TransitionError::Context {
                stage: SetupStage::MakeCurrent,
                reason: e.to_string(),
            })?;

        info!("GPU context initialized successfully");
        Ok(render_surface)
    }

    /// Asserts this context is usable for the next GPU commands. Idempotent.
    pub fn make_current(&self) -> Result<()> {
        if self.inner.is_none() {
            return Err(TransitionError::Closed);
        }
        if self.lost.load(Ordering::SeqCst) {
            return Err(TransitionError::Render("GPU device was lost".into()));
        }
        Ok(())
    }

    /// Device and queue of a live context.
    pub fn device_and_queue(&self) -> Result<(&wgpu::Device, &wgpu::Queue)> {
        self.make_current()?;
        let inner = self.inner.as_ref().ok_or(TransitionError::Closed)?;
        Ok((&inner.device, &inner.queue))
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }

    /// Releases the device and surface. Safe to call more than once.
    pub fn close(&mut self) {
        if let Some(inner) = self.inner.take() {
            debug!("Releasing GPU context");
            inner.device.destroy();
        }
    }
}

/// Runs `f` with validation and out-of-memory errors captured instead of
/// reaching the device's uncaptured error handler.
pub(crate) fn with_error_scope<T>(
    device: &wgpu::Device,
    f: impl FnOnce() -> T,
) -> (T, Option<wgpu::Error>) {
    let out_of_memory = device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
    let validation = device.push_error_scope(wgpu::ErrorFilter::Validation);
    let value = f();
    let validation_error = pollster::block_on(validation.pop());
    let memory_error = pollster::block_on(out_of_memory.pop());
    (value, validation_error.or(memory_error))
}

impl Drop for RenderSurface {
    fn drop(&mut self) {
        self.close();
    }
}
