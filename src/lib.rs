//! gltransition: GPU shader transitions between two video streams
//!
//! Pairs frames from a primary and a secondary stream by timestamp and
//! composites them with a gl-transitions style fragment shader over a
//! configurable window.

pub mod config;
pub mod error;
pub mod filter;
pub mod frame;
pub mod shader;
pub mod sync;

pub use config::TransitionConfig;
pub use error::{Result, TransitionError};
pub use filter::TransitionFilter;
pub use frame::{Frame, PixelFormat, StreamInfo, TimeBase};
pub use sync::{FrameEvents, StreamId};
