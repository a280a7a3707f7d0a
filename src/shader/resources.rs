//! Textures, geometry and pipeline state for one transition instance.

use super::gpu_context::{with_error_scope, TEXTURE_FORMAT};
use super::program::{LinkedProgram, ENTRY_POINT, RESOURCE_GROUP};
use crate::error::{Result, SetupStage, TransitionError};
use crate::frame::{QuadVertex, StreamInfo};
use tracing::{debug, info};
use wgpu::util::DeviceExt;

/// Uniforms passed to the fragment stage. Layout matches `TransitionParams`.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct TransitionUniforms {
    pub progress: f32,
    pub ratio: f32,
    pub from_ratio: f32,
    pub to_ratio: f32,
}

/// Bytes per row of the readback buffer, padded to the copy alignment.
pub fn padded_bytes_per_row(width: u32) -> u32 {
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    (width * 4).div_ceil(align) * align
}

// The template declares every resource in group 0.
const _: () = assert!(RESOURCE_GROUP == 0);

/// Rejects frame sizes the device cannot hold as a texture or readback buffer.
pub fn check_limits(limits: &wgpu::Limits, width: u32, height: u32) -> Result<()> {
    let max = limits.max_texture_dimension_2d;
    if width > max || height > max {
        return Err(TransitionError::Context {
            stage: SetupStage::Surface,
            reason: format!("{}x{} exceeds the device texture limit of {}", width, height, max),
        });
    }
    let readback = padded_bytes_per_row(width) as u64 * height as u64;
    if readback > limits.max_buffer_size {
        return Err(TransitionError::Context {
            stage: SetupStage::Surface,
            reason: format!(
                "{} byte readback buffer exceeds the device limit of {}",
                readback, limits.max_buffer_size
            ),
        });
    }
    Ok(())
}

/// GPU objects allocated once per stream. Released on drop.
pub struct RenderResources {
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) pipeline: wgpu::RenderPipeline,
    pub(crate) vertex_buffer: wgpu::Buffer,
    pub(crate) uniform_buffer: wgpu::Buffer,
    pub(crate) uniforms: TransitionUniforms,
    pub(crate) from_texture: wgpu::Texture,
    pub(crate) to_texture: wgpu::Texture,
    pub(crate) target: wgpu::Texture,
    pub(crate) readback_buffer: wgpu::Buffer,
    pub(crate) bind_group: wgpu::BindGroup,
}

impl RenderResources {
    /// Allocates the quad, input textures, render target and pipeline for the streams.
    ///
    /// GPU validation failures are returned instead of reaching the device's
    /// uncaptured error handler.
    pub fn new(
        device: &wgpu::Device,
        program: &LinkedProgram,
        from: &StreamInfo,
        to: &StreamInfo,
    ) -> Result<Self> {
        check_limits(&device.limits(), from.width, from.height)?;
        let (resources, error) = with_error_scope(device, || Self::allocate(device, program, from, to));
        match error {
            Some(e) => Err(TransitionError::Context {
                stage: SetupStage::Surface,
                reason: format!("GPU rejected transition resources: {}", e),
            }),
            None => Ok(resources),
        }
    }

    fn allocate(
        device: &wgpu::Device,
        program: &LinkedProgram,
        from: &StreamInfo,
        to: &StreamInfo,
    ) -> Self {
        let (width, height) = (from.width, from.height);
        info!("Creating GPU resources ({}x{})", width, height);
        let interface = program.interface();
        let (vertex_module, fragment_module) = program.create_modules(device);

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Transition Bind Group Layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: interface.params_binding,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                texture_entry(interface.from_binding),
                texture_entry(interface.to_binding),
                wgpu::BindGroupLayoutEntry {
                    binding: interface.sampler_binding,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Transition Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            immediate_size: 0,
        });

        let attributes = [QuadVertex::position_attribute(interface.position_location)];
        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Transition Pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &vertex_module,
                entry_point: Some(ENTRY_POINT),
                buffers: &[QuadVertex::layout(&attributes)],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &fragment_module,
                entry_point: Some(ENTRY_POINT),
                targets: &[Some(wgpu::ColorTargetState {
                    format: TEXTURE_FORMAT,
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

        let vertex_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Quad Vertex Buffer"),
            contents: bytemuck::cast_slice(QuadVertex::VERTICES),
            usage: wgpu::BufferUsages::VERTEX,
        });

        let uniforms = TransitionUniforms {
            progress: 0.0,
            ratio: from.aspect_ratio(),
            from_ratio: from.aspect_ratio(),
            to_ratio: to.aspect_ratio(),
        };
        let uniform_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Uniform Buffer"),
            contents: bytemuck::cast_slice(&[uniforms]),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Transition Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        let from_texture = input_texture(device, "From Texture", width, height);
        let to_texture = input_texture(device, "To Texture", width, height);

        let target = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Transition Target"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: TEXTURE_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });

        let readback_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Readback Buffer"),
            size: padded_bytes_per_row(width) as wgpu::BufferAddress * height as wgpu::BufferAddress,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let from_view = from_texture.create_view(&wgpu::TextureViewDescriptor::default());
        let to_view = to_texture.create_view(&wgpu::TextureViewDescriptor::default());
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Transition Bind Group"),
            layout: &bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: interface.params_binding,
                    resource: uniform_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: interface.from_binding,
                    resource: wgpu::BindingResource::TextureView(&from_view),
                },
                wgpu::BindGroupEntry {
                    binding: interface.to_binding,
                    resource: wgpu::BindingResource::TextureView(&to_view),
                },
                wgpu::BindGroupEntry {
                    binding: interface.sampler_binding,
                    resource: wgpu::BindingResource::Sampler(&sampler),
                },
            ],
        });
        debug!("Textures 'from' and 'to' bound at {} and {}", interface.from_binding, interface.to_binding);

        Self {
            width,
            height,
            pipeline,
            vertex_buffer,
            uniform_buffer,
            uniforms,
            from_texture,
            to_texture,
            target,
            readback_buffer,
            bind_group,
        }
    }

    pub fn uniforms(&self) -> TransitionUniforms {
        self.uniforms
    }
}

fn texture_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable: true },
            view_dimension: wgpu::TextureViewDimension::D2,
            multisampled: false,
        },
        count: None,
    }
}

fn input_texture(device: &wgpu::Device, label: &str, width: u32, height: u32) -> wgpu::Texture {
    device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size: wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: TEXTURE_FORMAT,
        usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        view_formats: &[],
    })
}
