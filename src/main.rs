//! gltransition: render a shader transition between two still images.

use anyhow::{bail, Context, Result};
use clap::Parser;
use gltransition::{
    Frame, FrameEvents, PixelFormat, StreamId, StreamInfo, TimeBase, TransitionConfig,
    TransitionFilter,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, error, info};

/// Renders a GPU transition from one image to another as a PNG sequence.
#[derive(Parser, Debug)]
#[command(name = "gltransition")]
#[command(about = "Render a gl-transitions style shader between two images")]
struct Args {
    /// Image shown at the start of the transition
    #[arg(long)]
    from: PathBuf,

    /// Image shown at the end of the transition
    #[arg(long)]
    to: PathBuf,

    /// Directory receiving frame_NNNNN.png files
    #[arg(long)]
    out_dir: PathBuf,

    /// Transition length in seconds
    #[arg(long)]
    duration: Option<f64>,

    /// Delay before the transition starts, in seconds
    #[arg(long)]
    offset: Option<f64>,

    /// Path to a GLSL transition snippet
    #[arg(long)]
    source: Option<PathBuf>,

    /// YAML file with duration, offset and source
    #[arg(long)]
    config: Option<PathBuf>,

    /// Keep compositing with the last "to" frame after its stream ends
    #[arg(long)]
    repeat_last: bool,

    /// Stop writing frames once the "to" stream is exhausted
    #[arg(long)]
    shortest: bool,

    /// Frames per second of the synthetic streams
    #[arg(long, default_value = "25")]
    fps: u32,

    /// Number of frames to render. Defaults to the whole transition.
    #[arg(long)]
    frames: Option<u32>,
}

fn load_frame(path: &Path) -> Result<Frame> {
    let image = image::open(path)
        .with_context(|| format!("failed to open image {:?}", path))?
        .to_rgb8();
    let (width, height) = image.dimensions();
    let frame = Frame::from_data(
        width,
        height,
        PixelFormat::Rgb24,
        width as usize * 3,
        image.into_raw(),
    )?;
    Ok(frame)
}

fn save_frame(frame: &Frame, path: &Path) -> Result<()> {
    let mut packed = Vec::with_capacity(frame.width as usize * frame.height as usize * 3);
    for y in 0..frame.height {
        packed.extend_from_slice(frame.row(y));
    }
    let image = image::RgbImage::from_raw(frame.width, frame.height, packed)
        .context("output frame does not match its dimensions")?;
    image
        .save(path)
        .with_context(|| format!("failed to write {:?}", path))?;
    Ok(())
}

fn load_config(args: &Args) -> Result<TransitionConfig> {
    let base = match &args.config {
        Some(path) => TransitionConfig::from_yaml_file(path)?,
        None => TransitionConfig::default(),
    };
    let config = base.with_overrides(args.duration, args.offset, args.source.clone())?;
    let repeat_last = config.repeat_last() || args.repeat_last;
    let shortest = config.shortest() || args.shortest;
    Ok(config.with_end_behavior(repeat_last, shortest))
}

/// Frames needed to reach the end of the transition, inclusive.
fn default_frame_count(config: &TransitionConfig, fps: u32) -> u32 {
    ((config.offset() + config.duration()) * fps as f64).ceil() as u32 + 1
}

struct FrameWriter {
    out_dir: PathBuf,
    written: u32,
    failed: u32,
}

impl FrameWriter {
    fn drain(&mut self, filter: &mut TransitionFilter) -> Result<()> {
        while let Some(output) = filter.poll_output() {
            match output {
                Ok(frame) => {
                    let path = self.out_dir.join(format!("frame_{:05}.png", self.written));
                    save_frame(&frame, &path)?;
                    debug!("Wrote {:?} (pts {:?})", path, frame.pts);
                    self.written += 1;
                }
                Err(e) => {
                    error!("Frame {} failed: {}", self.written + self.failed, e);
                    self.failed += 1;
                }
            }
        }
        Ok(())
    }
}

fn run(args: Args) -> Result<()> {
    if args.fps == 0 {
        bail!("--fps must be greater than zero");
    }
    let config = load_config(&args)?;
    let from = load_frame(&args.from)?;
    let to = load_frame(&args.to)?;
    if (from.width, from.height) != (to.width, to.height) {
        bail!(
            "images differ in size: {}x{} vs {}x{}",
            from.width,
            from.height,
            to.width,
            to.height
        );
    }

    let time_base = TimeBase::new(1, args.fps as i32);
    let info = StreamInfo::new(from.width, from.height, PixelFormat::Rgb24, time_base);
    let frames = args
        .frames
        .unwrap_or_else(|| default_frame_count(&config, args.fps));

    fs::create_dir_all(&args.out_dir)
        .with_context(|| format!("failed to create {:?}", args.out_dir))?;

    let mut filter = TransitionFilter::configure(config, info, info)?;
    let mut writer = FrameWriter {
        out_dir: args.out_dir.clone(),
        written: 0,
        failed: 0,
    };

    info!("Rendering {} frames at {} fps", frames, args.fps);
    let start = Instant::now();
    for index in 0..frames {
        let frame_start = Instant::now();
        let pts = index as i64;
        let mut secondary = to.clone().with_pts(pts);
        secondary.duration = Some(1);
        filter.on_secondary_frame(secondary)?;
        filter.on_primary_frame(from.clone().with_pts(pts))?;
        writer.drain(&mut filter)?;
        debug!("[Perf] Frame {} queued in {:.2?}", index, frame_start.elapsed());
        if filter.is_finished() {
            info!("Transition output ended after {} frames", index + 1);
            break;
        }
    }
    filter.end_of_stream(StreamId::Secondary)?;
    filter.end_of_stream(StreamId::Primary)?;
    filter.flush()?;
    writer.drain(&mut filter)?;
    let rendered = filter.frames_rendered();
    filter.teardown();

    info!(
        "Wrote {} frames ({} composited, {} failed) to {:?} in {:.2?}",
        writer.written,
        rendered,
        writer.failed,
        args.out_dir,
        start.elapsed()
    );
    if writer.failed > 0 {
        bail!("{} frames failed to render", writer.failed);
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    info!("Starting gltransition...");
    run(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_frame_count_covers_offset_and_duration() {
        let config = TransitionConfig::new(1.0, 0.5, None).unwrap();
        assert_eq!(default_frame_count(&config, 10), 16);
        assert_eq!(default_frame_count(&TransitionConfig::default(), 25), 26);
    }

    #[test]
    fn cli_overrides_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transition.yaml");
        fs::write(&path, "duration: 3.0\noffset: 1.0\n").unwrap();
        let args = Args::parse_from([
            "gltransition",
            "--from",
            "a.png",
            "--to",
            "b.png",
            "--out-dir",
            "out",
            "--config",
            path.to_str().unwrap(),
            "--duration",
            "2.0",
            "--shortest",
        ]);
        let config = load_config(&args).unwrap();
        assert_eq!(config.duration(), 2.0);
        assert_eq!(config.offset(), 1.0);
        assert!(config.shortest());
        assert!(!config.repeat_last());
    }

    #[test]
    fn image_round_trips_through_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.png");
        let mut frame = Frame::with_alignment(3, 2, PixelFormat::Rgb24, 32);
        frame.row_mut(1).copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8, 9]);
        save_frame(&frame, &path).unwrap();
        let loaded = load_frame(&path).unwrap();
        assert!(loaded.same_pixels(&frame));
    }
}
