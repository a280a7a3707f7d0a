//! GPU transition pipeline.

pub mod gpu_context;
pub mod program;
pub mod resources;
pub mod source;
mod wgpu_pipeline;

pub use gpu_context::RenderSurface;
pub use program::{build_program, LinkedProgram, ProgramInterface};
pub use source::{ProgramSource, SnippetOrigin, DEFAULT_TRANSITION};
pub use wgpu_pipeline::WgpuCompositor;

use crate::error::Result;
use crate::frame::Frame;

/// Renders one transition step from a pair of frames.
pub trait TransitionRenderer {
    /// Composites `from` and `to` at `progress` in `[0, 1]`.
    ///
    /// The output carries `from`'s timestamp and metadata. `from` is consumed;
    /// `to` stays with the caller.
    fn render(&mut self, from: Frame, to: &Frame, progress: f32) -> Result<Frame>;
}
