//! Pairing of the primary ("from") and secondary ("to") streams.
//!
//! A secondary frame covers primary times from its own timestamp up to the
//! next secondary timestamp. After the secondary stream ends, its last frame
//! covers one frame duration (or the last observed frame interval), or every
//! later primary frame when `repeat_last` is set. Primary frames outside any
//! coverage pass through unchanged, or end the output when `shortest` is set.
//! Covered frames are composited at a progress derived from the primary
//! timestamp.

use crate::config::TransitionConfig;
use crate::error::{Result, TransitionError};
use crate::frame::{Frame, StreamInfo, TimeBase};
use crate::shader::TransitionRenderer;
use std::collections::VecDeque;
use tracing::{debug, info, warn};

/// Identifies one of the two inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamId {
    Primary,
    Secondary,
}

/// Host-facing event interface of a transition instance.
pub trait FrameEvents {
    /// Accepts the next frame of the primary stream.
    fn on_primary_frame(&mut self, frame: Frame) -> Result<()>;

    /// Accepts the next frame of the secondary stream.
    fn on_secondary_frame(&mut self, frame: Frame) -> Result<()>;

    /// Marks a stream as finished.
    fn end_of_stream(&mut self, stream: StreamId) -> Result<()>;

    /// Decides every buffered primary frame with the information available now.
    fn flush(&mut self) -> Result<()>;

    /// Next output in primary arrival order. Per-frame failures appear as `Err`.
    fn poll_output(&mut self) -> Option<Result<Frame>>;

    /// Enables or disables compositing for primary frames arriving from now on.
    /// Disabled frames pass through unchanged.
    fn set_enabled(&mut self, enabled: bool);

    /// True once no new output will be queued. Queued outputs can still be polled.
    fn is_finished(&self) -> bool;

    /// Releases GPU resources. Later events fail with [`TransitionError::Closed`].
    fn teardown(&mut self);
}

/// Undecided primary frames at which a backlog warning is logged.
pub const PENDING_WARN_FRAMES: usize = 256;

/// Anchors elapsed time to the first timestamped primary frame.
#[derive(Debug, Clone, Copy)]
pub struct TransitionClock {
    first_pts: Option<i64>,
    time_base: TimeBase,
}

impl TransitionClock {
    pub fn new(time_base: TimeBase) -> Self {
        Self {
            first_pts: None,
            time_base,
        }
    }

    /// Records `pts` as the anchor if none is set yet. Returns true when it did.
    pub fn observe(&mut self, pts: Option<i64>) -> bool {
        match (self.first_pts, pts) {
            (None, Some(pts)) => {
                self.first_pts = Some(pts);
                true
            }
            _ => false,
        }
    }

    pub fn first_pts(&self) -> Option<i64> {
        self.first_pts
    }

    /// Seconds between the anchor and `pts`.
    pub fn elapsed(&self, pts: i64) -> Option<f64> {
        self.first_pts
            .map(|first| self.time_base.span_seconds(first, pts))
    }
}

/// Maps elapsed seconds to transition progress in `[0, 1]`.
pub fn transition_progress(elapsed: f64, offset: f64, duration: f64) -> f64 {
    let ts = elapsed - offset;
    (ts / duration).clamp(0.0, 1.0)
}

enum Pairing {
    PassThrough,
    Composite,
    /// Past the end of an ended secondary stream.
    Exhausted,
    Wait,
}

struct PendingFrame {
    frame: Frame,
    pts: Option<i64>,
    enabled: bool,
}

/// Aligns the two streams and drives a [`TransitionRenderer`].
pub struct FrameSynchronizer<R: TransitionRenderer> {
    duration: f64,
    offset: f64,
    repeat_last: bool,
    shortest: bool,
    enabled: bool,
    primary: StreamInfo,
    secondary: StreamInfo,
    clock: TransitionClock,
    pending: VecDeque<PendingFrame>,
    secondary_frames: VecDeque<Frame>,
    last_primary_pts: Option<i64>,
    last_decided_pts: Option<i64>,
    last_secondary_pts: Option<i64>,
    last_secondary_interval: Option<i64>,
    primary_ended: bool,
    secondary_ended: bool,
    exhausted: bool,
    backlog_warned: bool,
    renderer: Option<R>,
    outputs: VecDeque<Result<Frame>>,
}

impl<R: TransitionRenderer> FrameSynchronizer<R> {
    pub fn new(
        config: &TransitionConfig,
        primary: StreamInfo,
        secondary: StreamInfo,
        renderer: R,
    ) -> Self {
        Self {
            duration: config.duration(),
            offset: config.offset(),
            repeat_last: config.repeat_last(),
            shortest: config.shortest(),
            enabled: true,
            primary,
            secondary,
            clock: TransitionClock::new(primary.time_base),
            pending: VecDeque::new(),
            secondary_frames: VecDeque::new(),
            last_primary_pts: None,
            last_decided_pts: None,
            last_secondary_pts: None,
            last_secondary_interval: None,
            primary_ended: false,
            secondary_ended: false,
            exhausted: false,
            backlog_warned: false,
            renderer: Some(renderer),
            outputs: VecDeque::new(),
        }
    }

    pub fn first_pts(&self) -> Option<i64> {
        self.clock.first_pts()
    }

    /// Primary frames waiting for the secondary stream.
    pub fn pending_frames(&self) -> usize {
        self.pending.len()
    }

    /// Secondary frames held for pairing.
    pub fn retained_secondary_frames(&self) -> usize {
        self.secondary_frames.len()
    }

    /// True while at least [`PENDING_WARN_FRAMES`] primary frames are undecided.
    pub fn is_backlogged(&self) -> bool {
        self.pending.len() >= PENDING_WARN_FRAMES
    }

    pub fn is_closed(&self) -> bool {
        self.renderer.is_none()
    }

    pub fn renderer(&self) -> Option<&R> {
        self.renderer.as_ref()
    }

    /// Progress for a primary frame at `pts`; zero until the clock is anchored.
    pub fn progress_at(&self, pts: Option<i64>) -> f64 {
        pts.and_then(|pts| self.clock.elapsed(pts))
            .map(|elapsed| transition_progress(elapsed, self.offset, self.duration))
            .unwrap_or(0.0)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.renderer.is_none() {
            return Err(TransitionError::Closed);
        }
        Ok(())
    }

    fn primary_seconds(&self, pts: i64) -> f64 {
        self.primary.time_base.to_seconds(pts)
    }

    fn secondary_seconds(&self, pts: i64) -> f64 {
        self.secondary.time_base.to_seconds(pts)
    }

    /// Drops secondary frames older than the latest one at or before `t`.
    fn prune_secondary(&mut self, t: f64) {
        while self.secondary_frames.len() >= 2 {
            let next_pts = self.secondary_frames[1].pts.unwrap_or(i64::MAX);
            if self.secondary_seconds(next_pts) > t {
                break;
            }
            self.secondary_frames.pop_front();
        }
    }

    /// No primary frame can ask for a pairing anymore.
    fn primary_done(&self) -> bool {
        (self.primary_ended || self.exhausted) && self.pending.is_empty()
    }

    fn decide(&mut self, pts: Option<i64>, force: bool) -> Pairing {
        let Some(pts) = pts else {
            return Pairing::PassThrough;
        };
        let t = self.primary_seconds(pts);
        self.prune_secondary(t);

        let ended = self.secondary_ended || force;
        let Some(current) = self.secondary_frames.front() else {
            return if self.secondary_ended {
                Pairing::Exhausted
            } else if force {
                Pairing::PassThrough
            } else {
                Pairing::Wait
            };
        };
        let current_pts = current.pts.unwrap_or(i64::MIN);
        let start = self.secondary_seconds(current_pts);
        if t < start {
            return Pairing::PassThrough;
        }
        if self.secondary_frames.len() >= 2 {
            return Pairing::Composite;
        }
        if !ended {
            return Pairing::Wait;
        }
        if self.repeat_last {
            return Pairing::Composite;
        }
        let coverage = current
            .duration
            .or(self.last_secondary_interval)
            .map(|ticks| self.secondary.time_base.to_seconds(ticks))
            .unwrap_or(0.0);
        if t == start || t < start + coverage {
            Pairing::Composite
        } else if self.secondary_ended {
            Pairing::Exhausted
        } else {
            Pairing::PassThrough
        }
    }

    fn drain(&mut self, force: bool) {
        while let Some(front) = self.pending.front() {
            let pts = front.pts;
            let pairing = if self.exhausted {
                Pairing::Exhausted
            } else {
                self.decide(pts, force)
            };
            if matches!(pairing, Pairing::Wait) {
                break;
            }
            let Some(PendingFrame { frame, pts, enabled }) = self.pending.pop_front() else {
                break;
            };
            if pts.is_some() {
                self.last_decided_pts = pts;
            }
            match pairing {
                Pairing::Composite if enabled => {
                    let progress = self.progress_at(pts);
                    let result = match (self.renderer.as_mut(), self.secondary_frames.front()) {
                        (Some(renderer), Some(to)) => renderer.render(frame, to, progress as f32),
                        (None, _) => Err(TransitionError::Closed),
                        (_, None) => Err(TransitionError::Render("no secondary frame to pair".into())),
                    };
                    if let Err(e) = &result {
                        warn!("Transition render failed for pts {:?}: {}", pts, e);
                    }
                    self.outputs.push_back(result);
                }
                Pairing::Exhausted if self.shortest => {
                    if !self.exhausted {
                        info!("Secondary stream exhausted at primary pts {:?}, ending output", pts);
                        self.exhausted = true;
                    }
                    debug!("Dropping primary frame {:?} after end of output", frame.pts);
                }
                _ => {
                    debug!("Passing through primary frame {:?}", frame.pts);
                    self.outputs.push_back(Ok(frame));
                }
            }
        }
        self.trim_secondary();
    }

    /// Releases secondary frames no undecided or future primary frame can pair with.
    fn trim_secondary(&mut self) {
        if self.primary_done() {
            self.secondary_frames.clear();
            return;
        }
        if let Some(pts) = self.last_decided_pts {
            let t = self.primary_seconds(pts);
            self.prune_secondary(t);
        }
    }

    fn track_backlog(&mut self) {
        if self.is_backlogged() {
            if !self.backlog_warned {
                warn!(
                    "{} primary frames are waiting for the secondary stream",
                    self.pending.len()
                );
                self.backlog_warned = true;
            }
        } else {
            self.backlog_warned = false;
        }
    }
}

impl<R: TransitionRenderer> FrameEvents for FrameSynchronizer<R> {
    fn on_primary_frame(&mut self, frame: Frame) -> Result<()> {
        self.ensure_open()?;
        self.primary.check_frame(&frame)?;
        if self.primary_ended {
            return Err(TransitionError::FrameMismatch(
                "primary frame after end of stream".into(),
            ));
        }
        if self.clock.observe(frame.pts) {
            info!("Transition anchored at primary pts {:?}", frame.pts);
        }
        if self.exhausted {
            debug!("Dropping primary frame {:?} after end of output", frame.pts);
            return Ok(());
        }
        let pts = frame.pts.or(self.last_primary_pts);
        if frame.pts.is_some() {
            self.last_primary_pts = frame.pts;
        }
        self.pending.push_back(PendingFrame {
            frame,
            pts,
            enabled: self.enabled,
        });
        self.drain(false);
        self.track_backlog();
        Ok(())
    }

    fn on_secondary_frame(&mut self, frame: Frame) -> Result<()> {
        self.ensure_open()?;
        self.secondary.check_frame(&frame)?;
        if self.secondary_ended {
            return Err(TransitionError::FrameMismatch(
                "secondary frame after end of stream".into(),
            ));
        }
        let Some(pts) = frame.pts else {
            warn!("Dropping secondary frame without timestamp");
            return Ok(());
        };
        if let Some(last) = self.last_secondary_pts {
            if pts <= last {
                warn!("Dropping out-of-order secondary frame {} (last {})", pts, last);
                return Ok(());
            }
            self.last_secondary_interval = pts.checked_sub(last);
        }
        self.last_secondary_pts = Some(pts);
        if self.primary_done() {
            debug!("Dropping secondary frame {} after primary stream ended", pts);
            return Ok(());
        }
        self.secondary_frames.push_back(frame);
        self.drain(false);
        Ok(())
    }

    fn end_of_stream(&mut self, stream: StreamId) -> Result<()> {
        self.ensure_open()?;
        debug!("End of {:?} stream", stream);
        match stream {
            StreamId::Primary => {
                self.primary_ended = true;
                self.trim_secondary();
            }
            StreamId::Secondary => {
                self.secondary_ended = true;
                self.drain(false);
            }
        }
        self.track_backlog();
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.drain(true);
        self.track_backlog();
        Ok(())
    }

    fn poll_output(&mut self) -> Option<Result<Frame>> {
        self.outputs.pop_front()
    }

    fn set_enabled(&mut self, enabled: bool) {
        if self.enabled != enabled {
            debug!("Transition {}", if enabled { "enabled" } else { "disabled" });
            self.enabled = enabled;
        }
    }

    fn is_finished(&self) -> bool {
        self.renderer.is_none() || self.primary_done()
    }

    fn teardown(&mut self) {
        if !self.pending.is_empty() {
            warn!("Discarding {} undecided primary frames at teardown", self.pending.len());
            self.pending.clear();
        }
        self.secondary_frames.clear();
        if let Some(renderer) = self.renderer.take() {
            drop(renderer);
            info!("Transition stream torn down");
        }
    }
}
