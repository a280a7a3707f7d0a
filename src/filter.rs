//! Setup entry point for a host pipeline.

use crate::config::TransitionConfig;
use crate::error::{Result, TransitionError};
use crate::frame::{Frame, PixelFormat, StreamInfo};
use crate::shader::{build_program, ProgramSource, RenderSurface, WgpuCompositor};
use crate::sync::{FrameEvents, FrameSynchronizer, StreamId};
use tracing::info;

/// A configured transition between two streams.
///
/// Built once by [`TransitionFilter::configure`]; frames then flow through
/// the [`FrameEvents`] methods until [`FrameEvents::teardown`].
pub struct TransitionFilter {
    config: TransitionConfig,
    sync: FrameSynchronizer<WgpuCompositor>,
}

impl TransitionFilter {
    /// Validates both streams, builds the shader program and allocates GPU resources.
    ///
    /// Fails before touching the GPU when the streams disagree or the
    /// transition source cannot be read or compiled.
    pub fn configure(
        config: TransitionConfig,
        primary: StreamInfo,
        secondary: StreamInfo,
    ) -> Result<Self> {
        check_streams(&primary, &secondary)?;

        let source = ProgramSource::resolve(config.source())?;
        let program = build_program(&source)?;

        let surface = RenderSurface::new()?;
        let compositor = WgpuCompositor::new(surface, &program, primary, secondary)?;
        info!(
            "Transition configured: {}x{}, duration {}s, offset {}s",
            primary.width,
            primary.height,
            config.duration(),
            config.offset()
        );

        let sync = FrameSynchronizer::new(&config, primary, secondary, compositor);
        Ok(Self { config, sync })
    }

    pub fn config(&self) -> &TransitionConfig {
        &self.config
    }

    pub fn first_pts(&self) -> Option<i64> {
        self.sync.first_pts()
    }

    /// Frames composited on the GPU so far.
    pub fn frames_rendered(&self) -> u64 {
        self.sync.renderer().map_or(0, WgpuCompositor::frames_rendered)
    }
}

/// Both inputs must be RGB24 with identical dimensions and usable time bases.
pub fn check_streams(primary: &StreamInfo, secondary: &StreamInfo) -> Result<()> {
    for (name, info) in [("primary", primary), ("secondary", secondary)] {
        if info.format != PixelFormat::Rgb24 {
            return Err(TransitionError::StreamMismatch(format!(
                "{} stream is {:?}, only Rgb24 is supported",
                name, info.format
            )));
        }
        if info.width == 0 || info.height == 0 {
            return Err(TransitionError::StreamMismatch(format!(
                "{} stream has empty dimensions {}x{}",
                name, info.width, info.height
            )));
        }
        if !info.time_base.is_valid() {
            return Err(TransitionError::StreamMismatch(format!(
                "{} stream has invalid time base {}/{}",
                name, info.time_base.num, info.time_base.den
            )));
        }
    }
    if (primary.width, primary.height) != (secondary.width, secondary.height) {
        return Err(TransitionError::StreamMismatch(format!(
            "primary is {}x{}, secondary is {}x{}",
            primary.width, primary.height, secondary.width, secondary.height
        )));
    }
    Ok(())
}

impl FrameEvents for TransitionFilter {
    fn on_primary_frame(&mut self, frame: Frame) -> Result<()> {
        self.sync.on_primary_frame(frame)
    }

    fn on_secondary_frame(&mut self, frame: Frame) -> Result<()> {
        self.sync.on_secondary_frame(frame)
    }

    fn end_of_stream(&mut self, stream: StreamId) -> Result<()> {
        self.sync.end_of_stream(stream)
    }

    fn flush(&mut self) -> Result<()> {
        self.sync.flush()
    }

    fn poll_output(&mut self) -> Option<Result<Frame>> {
        self.sync.poll_output()
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.sync.set_enabled(enabled);
    }

    fn is_finished(&self) -> bool {
        self.sync.is_finished()
    }

    fn teardown(&mut self) {
        self.sync.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::TimeBase;
    use std::io::Write;

    fn rgb(width: u32, height: u32) -> StreamInfo {
        StreamInfo::new(width, height, PixelFormat::Rgb24, TimeBase::MILLISECONDS)
    }

    fn configure_or_skip(config: TransitionConfig, info: StreamInfo) -> Option<TransitionFilter> {
        match TransitionFilter::configure(config, info, info) {
            Ok(filter) => Some(filter),
            Err(TransitionError::Context { stage, reason }) => {
                eprintln!("skipping GPU test: {} failed: {}", stage, reason);
                None
            }
            Err(e) => panic!("unexpected setup error: {e}"),
        }
    }

    #[test]
    fn size_mismatch_fails_setup() {
        let err = TransitionFilter::configure(TransitionConfig::default(), rgb(64, 48), rgb(64, 32))
            .err()
            .unwrap();
        assert!(matches!(err, TransitionError::StreamMismatch(_)));
    }

    #[test]
    fn format_mismatch_fails_setup() {
        let rgba = StreamInfo::new(64, 48, PixelFormat::Rgba, TimeBase::MILLISECONDS);
        let err = TransitionFilter::configure(TransitionConfig::default(), rgb(64, 48), rgba)
            .err()
            .unwrap();
        assert!(matches!(err, TransitionError::StreamMismatch(_)));
    }

    #[test]
    fn invalid_time_base_fails_setup() {
        let bad = StreamInfo::new(64, 48, PixelFormat::Rgb24, TimeBase::new(1, 0));
        assert!(check_streams(&bad, &rgb(64, 48)).is_err());
    }

    #[test]
    fn oversized_streams_fail_setup() {
        match TransitionFilter::configure(TransitionConfig::default(), rgb(100_000, 8), rgb(100_000, 8)) {
            Err(TransitionError::Context { .. }) => {}
            Err(other) => panic!("expected a setup error, got {other}"),
            Ok(_) => panic!("oversized streams were accepted"),
        }
    }

    #[test]
    fn unreadable_source_fails_before_gpu_setup() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.glsl");
        let config = TransitionConfig::new(1.0, 0.0, Some(missing.clone())).unwrap();
        let err = TransitionFilter::configure(config, rgb(8, 8), rgb(8, 8)).err().unwrap();
        match err {
            TransitionError::SourceRead { path, .. } => assert_eq!(path, missing),
            other => panic!("expected SourceRead, got {other}"),
        }
    }

    #[test]
    fn broken_snippet_fails_compilation() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "vec4 transition(vec2 uv) {{ return mix(getFromColor(uv), getToColor(uv), undefined_value); }}"
        )
        .unwrap();
        let config = TransitionConfig::new(1.0, 0.0, Some(file.path().to_path_buf())).unwrap();
        let err = TransitionFilter::configure(config, rgb(8, 8), rgb(8, 8)).err().unwrap();
        assert!(matches!(err, TransitionError::Compile { .. }));
    }

    #[test]
    fn runs_a_transition_end_to_end() {
        let config = TransitionConfig::new(0.1, 0.0, None).unwrap();
        let Some(mut filter) = configure_or_skip(config, rgb(16, 8)) else {
            return;
        };
        for pts in [0, 40, 80, 120] {
            let mut to = Frame::solid_rgb(16, 8, [255, 255, 255]);
            to.pts = Some(pts);
            filter.on_secondary_frame(to).unwrap();
        }
        filter.end_of_stream(StreamId::Secondary).unwrap();
        for pts in [0, 40, 80, 120] {
            let from = Frame::solid_rgb(16, 8, [0, 0, 0]).with_pts(pts);
            filter.on_primary_frame(from).unwrap();
        }
        filter.end_of_stream(StreamId::Primary).unwrap();
        filter.flush().unwrap();

        let outputs: Vec<Frame> = std::iter::from_fn(|| filter.poll_output())
            .map(|o| o.unwrap())
            .collect();
        assert_eq!(outputs.len(), 4);
        assert_eq!(filter.first_pts(), Some(0));
        assert_eq!(filter.frames_rendered(), 4);
        assert_eq!(outputs[0].row(0)[0], 0);
        assert!(outputs[1].row(0)[0].abs_diff(102) <= 1);
        assert_eq!(outputs[3].row(0)[0], 255);
        assert_eq!(outputs[2].pts, Some(80));

        filter.teardown();
        filter.teardown();
        assert!(matches!(
            filter.on_primary_frame(Frame::solid_rgb(16, 8, [0, 0, 0])),
            Err(TransitionError::Closed)
        ));
    }
}
