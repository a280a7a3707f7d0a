//! Error types for transition setup and rendering.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Shader stage a compiler diagnostic belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

impl fmt::Display for ShaderStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShaderStage::Vertex => f.write_str("vertex"),
            ShaderStage::Fragment => f.write_str("fragment"),
        }
    }
}

/// Stage of headless GPU context acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupStage {
    /// Finding a GPU adapter (the display/driver handle).
    Adapter,
    /// Opening a logical device and queue on the adapter.
    Device,
    /// Creating the 1x1 offscreen render surface.
    Surface,
    /// Binding the context for use by this instance.
    MakeCurrent,
}

impl fmt::Display for SetupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SetupStage::Adapter => "adapter acquisition",
            SetupStage::Device => "device creation",
            SetupStage::Surface => "surface creation",
            SetupStage::MakeCurrent => "make current",
        };
        f.write_str(name)
    }
}

/// Errors from configuring or running a transition.
#[derive(Error, Debug)]
pub enum TransitionError {
    /// An option is outside its valid range.
    #[error("invalid option '{option}': {reason}")]
    InvalidConfig { option: &'static str, reason: String },

    /// The two input streams cannot be composited together.
    #[error("input streams do not match: {0}")]
    StreamMismatch(String),

    /// A frame does not match the geometry the filter was configured with.
    #[error("frame does not match configured stream: {0}")]
    FrameMismatch(String),

    /// The external transition source could not be read.
    #[error("failed to read transition source {path:?}: {source}")]
    SourceRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The transition snippet is structurally unusable.
    #[error("invalid transition source: {0}")]
    InvalidSource(String),

    /// A shader stage failed to compile.
    #[error("{stage} shader compilation failed:\n{log}")]
    Compile { stage: ShaderStage, log: String },

    /// Vertex and fragment stages could not be linked.
    #[error("program linking failed:\n{log}")]
    Link { log: String },

    /// The GPU context could not be established.
    #[error("GPU context setup failed during {stage}: {reason}")]
    Context { stage: SetupStage, reason: String },

    /// A single render request failed.
    #[error("render failed: {0}")]
    Render(String),

    /// The filter was used after teardown.
    #[error("transition filter is closed")]
    Closed,
}

impl TransitionError {
    /// Whether this error aborts stream setup rather than a single frame.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            TransitionError::Render(_) | TransitionError::FrameMismatch(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TransitionError>;
