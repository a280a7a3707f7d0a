//! wgpu-based transition compositor.

use super::gpu_context::{with_error_scope, RenderSurface};
use super::program::{LinkedProgram, RESOURCE_GROUP};
use super::resources::{padded_bytes_per_row, RenderResources};
use super::TransitionRenderer;
use crate::error::{Result, TransitionError};
use crate::frame::{Frame, PixelFormat, QuadVertex, StreamInfo};
use std::time::Instant;
use tracing::{debug, info};

/// Row alignment of frames produced by the compositor.
pub const OUTPUT_ROW_ALIGNMENT: usize = 32;

/// Composites frame pairs on the GPU and reads the result back.
pub struct WgpuCompositor {
    // Dropped before the surface that owns the device.
    resources: Option<RenderResources>,
    surface: RenderSurface,
    from_info: StreamInfo,
    to_info: StreamInfo,
    staging: Vec<u8>,
    frame_count: u64,
}

impl WgpuCompositor {
    /// Allocates render resources for the given stream geometry on `surface`.
    pub fn new(
        surface: RenderSurface,
        program: &LinkedProgram,
        from_info: StreamInfo,
        to_info: StreamInfo,
    ) -> Result<Self> {
        let (device, _) = surface.device_and_queue()?;
        let resources = RenderResources::new(device, program, &from_info, &to_info)?;
        Ok(Self {
            resources: Some(resources),
            surface,
            from_info,
            to_info,
            staging: Vec::new(),
            frame_count: 0,
        })
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frame_count
    }

    /// Releases render resources and the GPU context. Safe to call more than once.
    pub fn close(&mut self) {
        if self.resources.take().is_some() {
            info!("Released transition resources after {} frames", self.frame_count);
        }
        self.surface.close();
    }

    fn upload(
        queue: &wgpu::Queue,
        texture: &wgpu::Texture,
        frame: &Frame,
        staging: &mut Vec<u8>,
    ) {
        // Rows are repacked using the frame's own stride, so padded buffers upload correctly.
        frame.write_rgba_rows(staging);
        queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            staging,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(frame.width * 4),
                rows_per_image: Some(frame.height),
            },
            wgpu::Extent3d {
                width: frame.width,
                height: frame.height,
                depth_or_array_layers: 1,
            },
        );
    }

    /// Uploads both frames, draws the quad and queues the copy into the readback buffer.
    fn encode(
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        resources: &mut RenderResources,
        from: &Frame,
        to: &Frame,
        staging: &mut Vec<u8>,
        progress: f32,
    ) -> wgpu::SubmissionIndex {
        resources.uniforms.progress = progress.clamp(0.0, 1.0);
        queue.write_buffer(
            &resources.uniform_buffer,
            0,
            bytemuck::cast_slice(&[resources.uniforms]),
        );

        let upload_start = Instant::now();
        Self::upload(queue, &resources.from_texture, from, staging);
        Self::upload(queue, &resources.to_texture, to, staging);
        debug!("  [Perf] Texture Upload: {:?}", upload_start.elapsed());

        let (width, height) = (resources.width, resources.height);
        let padded_row = padded_bytes_per_row(width);
        let target_view = resources
            .target
            .create_view(&wgpu::TextureViewDescriptor::default());
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Transition Encoder"),
        });
        {
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Transition Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &target_view,
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
            render_pass.set_pipeline(&resources.pipeline);
            render_pass.set_bind_group(RESOURCE_GROUP, &resources.bind_group, &[]);
            render_pass.set_vertex_buffer(0, resources.vertex_buffer.slice(..));
            render_pass.draw(0..QuadVertex::VERTICES.len() as u32, 0..1);
        }

        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &resources.target,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &resources.readback_buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        queue.submit(std::iter::once(encoder.finish()))
    }
}

impl TransitionRenderer for WgpuCompositor {
    fn render(&mut self, from: Frame, to: &Frame, progress: f32) -> Result<Frame> {
        let start = Instant::now();
        self.surface.make_current()?;
        let (device, queue) = self.surface.device_and_queue()?;
        let resources = self.resources.as_mut().ok_or(TransitionError::Closed)?;

        self.from_info.check_frame(&from)?;
        self.to_info.check_frame(to)?;
        if !progress.is_finite() {
            return Err(TransitionError::Render(format!("progress {} is not finite", progress)));
        }

        let (width, height) = (resources.width, resources.height);
        let padded_row = padded_bytes_per_row(width);
        let staging = &mut self.staging;
        let (submission_index, error) = with_error_scope(device, || {
            Self::encode(device, queue, resources, &from, to, staging, progress)
        });
        if let Some(e) = error {
            return Err(TransitionError::Render(format!("GPU rejected transition pass: {}", e)));
        }

        let readback_start = Instant::now();
        let buffer_slice = resources.readback_buffer.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        device
            .poll(wgpu::PollType::Wait {
                submission_index: Some(submission_index),
                timeout: None,
            })
            .map_err(|e| TransitionError::Render(format!("GPU poll failed: {:?}", e)))?;
        receiver
            .recv()
            .map_err(|_| TransitionError::Render("readback callback was dropped".into()))?
            .map_err(|e| TransitionError::Render(format!("readback map failed: {:?}", e)))?;

        let mut output = Frame::with_alignment(width, height, PixelFormat::Rgb24, OUTPUT_ROW_ALIGNMENT);
        {
            let data = buffer_slice.get_mapped_range();
            output.read_rgba_rows(&data, padded_row as usize);
        }
        resources.readback_buffer.unmap();
        debug!("  [Perf] GPU Readback: {:?}", readback_start.elapsed());

        output.copy_props_from(&from);
        drop(from);

        self.frame_count += 1;
        debug!("  [Perf] TOTAL FRAME: {:?} (progress {:.3})", start.elapsed(), progress);
        Ok(output)
    }
}

impl Drop for WgpuCompositor {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::TimeBase;
    use crate::shader::gpu_context::tests::surface_or_skip;
    use crate::shader::program::build_program;
    use crate::shader::source::{ProgramSource, SnippetOrigin};

    const W: u32 = 16;
    const H: u32 = 8;

    fn info() -> StreamInfo {
        StreamInfo::new(W, H, PixelFormat::Rgb24, TimeBase::MILLISECONDS)
    }

    fn compositor_with(snippet: Option<&str>) -> Option<WgpuCompositor> {
        let surface = surface_or_skip()?;
        let source = match snippet {
            Some(snippet) => ProgramSource::compose(snippet, SnippetOrigin::BuiltIn).unwrap(),
            None => ProgramSource::resolve(None).unwrap(),
        };
        let program = build_program(&source).unwrap();
        Some(WgpuCompositor::new(surface, &program, info(), info()).unwrap())
    }

    /// Rows fade from red at the top to blue at the bottom; columns vary green.
    fn pattern() -> Frame {
        let mut frame = Frame::new(W, H, PixelFormat::Rgb24);
        for y in 0..H {
            let row = frame.row_mut(y);
            for x in 0..W as usize {
                row[x * 3] = 255 - (y * 30) as u8;
                row[x * 3 + 1] = (x * 15) as u8;
                row[x * 3 + 2] = (y * 30) as u8;
            }
        }
        frame
    }

    fn assert_all_pixels(frame: &Frame, expected: [u8; 3], tolerance: u8) {
        for y in 0..frame.height {
            for px in frame.row(y).chunks_exact(3) {
                for c in 0..3 {
                    assert!(
                        px[c].abs_diff(expected[c]) <= tolerance,
                        "pixel {:?} differs from {:?}",
                        px,
                        expected
                    );
                }
            }
        }
    }

    #[test]
    fn progress_zero_shows_from_frame() {
        let Some(mut compositor) = compositor_with(None) else {
            return;
        };
        let from = Frame::solid_rgb(W, H, [200, 40, 10]);
        let to = Frame::solid_rgb(W, H, [5, 90, 250]);
        let out = compositor.render(from, &to, 0.0).unwrap();
        assert_all_pixels(&out, [200, 40, 10], 0);
    }

    #[test]
    fn progress_one_shows_to_frame() {
        let Some(mut compositor) = compositor_with(None) else {
            return;
        };
        let from = Frame::solid_rgb(W, H, [200, 40, 10]);
        let to = Frame::solid_rgb(W, H, [5, 90, 250]);
        let out = compositor.render(from, &to, 1.0).unwrap();
        assert_all_pixels(&out, [5, 90, 250], 0);
    }

    #[test]
    fn half_progress_between_black_and_white_is_gray() {
        let Some(mut compositor) = compositor_with(None) else {
            return;
        };
        let black = Frame::solid_rgb(W, H, [0, 0, 0]);
        let white = Frame::solid_rgb(W, H, [255, 255, 255]);
        let out = compositor.render(black, &white, 0.5).unwrap();
        assert_all_pixels(&out, [128, 128, 128], 1);
    }

    #[test]
    fn image_orientation_is_preserved() {
        let Some(mut compositor) = compositor_with(None) else {
            return;
        };
        let from = pattern();
        let expected = from.clone();
        let to = Frame::solid_rgb(W, H, [0, 0, 0]);
        let out = compositor.render(from, &to, 0.0).unwrap();
        assert!(out.same_pixels(&expected));
    }

    #[test]
    fn padded_rows_render_like_tight_rows() {
        let Some(mut compositor) = compositor_with(None) else {
            return;
        };
        let tight = pattern();
        let mut padded = Frame::with_alignment(W, H, PixelFormat::Rgb24, 64);
        padded.data.fill(0xFF);
        for y in 0..H {
            padded.row_mut(y).copy_from_slice(tight.row(y));
        }
        assert!(padded.stride > W as usize * 3);

        let to = Frame::solid_rgb(W, H, [0, 255, 0]);
        let from_tight = compositor.render(tight, &to, 0.3).unwrap();
        let from_padded = compositor.render(padded, &to, 0.3).unwrap();
        assert!(from_tight.same_pixels(&from_padded));
    }

    #[test]
    fn output_carries_from_properties() {
        let Some(mut compositor) = compositor_with(None) else {
            return;
        };
        let mut from = Frame::solid_rgb(W, H, [1, 2, 3]).with_pts(4200);
        from.duration = Some(40);
        from.metadata.insert("rotate".into(), "90".into());
        let to = Frame::solid_rgb(W, H, [4, 5, 6]).with_pts(17);
        let out = compositor.render(from, &to, 0.5).unwrap();
        assert_eq!(out.pts, Some(4200));
        assert_eq!(out.duration, Some(40));
        assert_eq!(out.metadata.get("rotate").map(String::as_str), Some("90"));
        assert_eq!(out.stride % OUTPUT_ROW_ALIGNMENT, 0);
        assert_eq!(compositor.frames_rendered(), 1);
    }

    #[test]
    fn custom_transition_runs() {
        let snippet = "uniform float threshold; // = 0.5\n\
            vec4 transition(vec2 uv) { return progress < threshold ? getFromColor(uv) : getToColor(uv); }";
        let Some(mut compositor) = compositor_with(Some(snippet)) else {
            return;
        };
        let from = Frame::solid_rgb(W, H, [255, 0, 0]);
        let to = Frame::solid_rgb(W, H, [0, 0, 255]);
        let early = compositor.render(from.clone(), &to, 0.25).unwrap();
        let late = compositor.render(from, &to, 0.75).unwrap();
        assert_all_pixels(&early, [255, 0, 0], 0);
        assert_all_pixels(&late, [0, 0, 255], 0);
    }

    #[test]
    fn oversized_streams_fail_setup_without_panicking() {
        let Some(surface) = surface_or_skip() else {
            return;
        };
        let program = build_program(&ProgramSource::resolve(None).unwrap()).unwrap();
        let wide = StreamInfo::new(100_000, 8, PixelFormat::Rgb24, TimeBase::MILLISECONDS);
        let err = WgpuCompositor::new(surface, &program, wide, wide).err().unwrap();
        assert!(matches!(
            err,
            TransitionError::Context {
                stage: crate::error::SetupStage::Surface,
                ..
            }
        ));
    }

    #[test]
    fn rejects_frames_of_other_size() {
        let Some(mut compositor) = compositor_with(None) else {
            return;
        };
        let from = Frame::solid_rgb(W * 2, H, [0, 0, 0]);
        let to = Frame::solid_rgb(W, H, [0, 0, 0]);
        assert!(matches!(
            compositor.render(from, &to, 0.5),
            Err(TransitionError::FrameMismatch(_))
        ));
    }

    #[test]
    fn render_after_close_fails() {
        let Some(mut compositor) = compositor_with(None) else {
            return;
        };
        compositor.close();
        compositor.close();
        let frame = Frame::solid_rgb(W, H, [0, 0, 0]);
        assert!(matches!(
            compositor.render(frame.clone(), &frame, 0.5),
            Err(TransitionError::Closed)
        ));
    }
}
