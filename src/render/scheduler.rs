//! Time-sliced progressive frame scheduler.
//!
//! A frame is a list of bricks drawn in order. Each call to
//! [`ProgressiveScheduler::advance`] runs one slice: it draws bricks until the
//! list is exhausted or the slice budget is spent, then returns. Progress is
//! plain data ([`FrameProgress`]) so a frame can be inspected or resumed.
//!
//! ```text
//! Idle --begin_frame--> Rendering --advance...--> FrameComplete
//!   ^                       |
//!   +-------abort-----------+
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::clock::Clock;
use crate::cache::{BrickCache, TextureBackend, TextureHandle};
use crate::config::StreamingConfig;
use crate::dataset::BrickSource;
use crate::util::{Error, Result};
use crate::uvf::BrickIndex;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameState {
    Idle,
    Rendering,
    FrameComplete,
}

/// One brick draw handed to a [`RenderSink`].
#[derive(Debug)]
pub struct BrickDraw<'a> {
    /// Position in the frame's brick list.
    pub position: usize,
    pub requested: &'a BrickIndex,
    /// Brick whose texture is bound; coarser than `requested` when substituted.
    pub drawn: &'a BrickIndex,
    pub handle: TextureHandle,
}

impl BrickDraw<'_> {
    #[inline]
    pub fn is_substitute(&self) -> bool {
        self.requested != self.drawn
    }
}

/// Draw side of the scheduler.
pub trait RenderSink<T> {
    /// Full-screen bounding box pass before the first brick of a frame.
    fn pre_render_bounding_boxes(&mut self, _frame: u64) {}

    fn draw_brick(&mut self, draw: &BrickDraw<'_>, texture: &T) -> Result<()>;

    /// Bounding box pass after the last brick of a frame.
    fn post_render_bounding_boxes(&mut self, _frame: u64) {}
}

/// Serialisable frame progress.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameProgress {
    pub frame: u64,
    /// Next brick to draw.
    pub brick_index: usize,
    pub brick_count: usize,
    pub slices: u64,
    /// Time spent in slices of this frame.
    pub elapsed_budget_ms: u64,
    pub drawn: u64,
    pub substituted: u64,
    pub skipped: u64,
}

/// Outcome of one [`ProgressiveScheduler::advance`] call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SliceReport {
    pub frame: u64,
    pub state: FrameState,
    pub drawn: u64,
    pub substituted: u64,
    pub skipped: u64,
    /// The slice ended early because the cache had no room.
    pub stalled: bool,
    pub elapsed: Duration,
}

enum Outcome {
    Drawn { substituted: bool },
    Skipped,
    Stalled,
}

/// Resumable per-frame state machine.
#[derive(Debug)]
pub struct ProgressiveScheduler {
    time_slice: Duration,
    allow_coarser: bool,
    state: FrameState,
    frame: u64,
    bricks: Vec<BrickIndex>,
    next: usize,
    slices: u64,
    elapsed: Duration,
    drawn: u64,
    substituted: u64,
    skipped: u64,
}

impl ProgressiveScheduler {
    pub fn new(time_slice: Duration, allow_coarser: bool) -> Self {
        Self {
            time_slice,
            allow_coarser,
            state: FrameState::Idle,
            frame: 0,
            bricks: Vec::new(),
            next: 0,
            slices: 0,
            elapsed: Duration::ZERO,
            drawn: 0,
            substituted: 0,
            skipped: 0,
        }
    }

    pub fn from_config(config: &StreamingConfig) -> Self {
        Self::new(Duration::from_millis(config.time_slice_ms), config.allow_coarser_fallback)
    }

    #[inline]
    pub fn state(&self) -> FrameState {
        self.state
    }

    #[inline]
    pub fn time_slice(&self) -> Duration {
        self.time_slice
    }

    pub fn set_time_slice(&mut self, time_slice: Duration) {
        self.time_slice = time_slice;
    }

    /// True while the current frame still needs slices.
    #[inline]
    pub fn needs_redraw(&self) -> bool {
        self.state == FrameState::Rendering
    }

    /// Start a new frame over `bricks`, discarding any frame in progress.
    pub fn begin_frame(&mut self, bricks: Vec<BrickIndex>) -> u64 {
        if self.state == FrameState::Rendering {
            tracing::debug!(frame = self.frame, at = self.next, "replacing unfinished frame");
        }
        self.reset();
        self.frame += 1;
        self.bricks = bricks;
        self.state = FrameState::Rendering;
        tracing::debug!(frame = self.frame, bricks = self.bricks.len(), "frame started");
        self.frame
    }

    /// Drop the current frame and its partial progress. Returns whether a
    /// frame was in progress.
    pub fn abort(&mut self) -> bool {
        let was_rendering = self.state == FrameState::Rendering;
        if was_rendering {
            tracing::debug!(frame = self.frame, at = self.next, "frame aborted");
        }
        self.reset();
        self.state = FrameState::Idle;
        was_rendering
    }

    fn reset(&mut self) {
        self.bricks.clear();
        self.next = 0;
        self.slices = 0;
        self.elapsed = Duration::ZERO;
        self.drawn = 0;
        self.substituted = 0;
        self.skipped = 0;
    }

    pub fn progress(&self) -> FrameProgress {
        FrameProgress {
            frame: self.frame,
            brick_index: self.next,
            brick_count: self.bricks.len(),
            slices: self.slices,
            elapsed_budget_ms: self.elapsed.as_millis() as u64,
            drawn: self.drawn,
            substituted: self.substituted,
            skipped: self.skipped,
        }
    }

    /// Continue a frame from saved progress over the same brick list.
    pub fn resume(&mut self, bricks: Vec<BrickIndex>, progress: &FrameProgress) -> Result<()> {
        if progress.brick_count != bricks.len() || progress.brick_index > bricks.len() {
            return Err(Error::validation(format!(
                "progress at brick {} of {} does not match a list of {} bricks",
                progress.brick_index,
                progress.brick_count,
                bricks.len()
            )));
        }
        self.bricks = bricks;
        self.frame = progress.frame;
        self.next = progress.brick_index;
        self.slices = progress.slices;
        self.elapsed = Duration::from_millis(progress.elapsed_budget_ms);
        self.drawn = progress.drawn;
        self.substituted = progress.substituted;
        self.skipped = progress.skipped;
        self.state = FrameState::Rendering;
        Ok(())
    }

    /// Run one slice of the current frame.
    ///
    /// At least one brick is attempted per slice. When the cache cannot fit a
    /// brick, coarser LODs are tried if enabled; if none fit, the slice ends
    /// and the brick is retried on the next slice. A brick that would not fit
    /// even into an otherwise empty cache, or that fails to load or draw, is
    /// skipped.
    pub fn advance<B, S, C>(
        &mut self,
        cache: &mut BrickCache<B>,
        source: &dyn BrickSource,
        sink: &mut S,
        clock: &C,
    ) -> SliceReport
    where
        B: TextureBackend,
        S: RenderSink<B::Texture> + ?Sized,
        C: Clock + ?Sized,
    {
        let start = clock.elapsed();
        let mut report = SliceReport {
            frame: self.frame,
            state: self.state,
            drawn: 0,
            substituted: 0,
            skipped: 0,
            stalled: false,
            elapsed: Duration::ZERO,
        };
        if self.state != FrameState::Rendering {
            return report;
        }

        let _span = tracing::debug_span!("slice", frame = self.frame, slice = self.slices).entered();
        if self.slices == 0 {
            sink.pre_render_bounding_boxes(self.frame);
        }

        while self.next < self.bricks.len() {
            match self.draw_one(cache, source, sink) {
                Outcome::Drawn { substituted } => {
                    report.drawn += 1;
                    if substituted {
                        report.substituted += 1;
                    }
                    self.next += 1;
                }
                Outcome::Skipped => {
                    report.skipped += 1;
                    self.next += 1;
                }
                Outcome::Stalled => {
                    report.stalled = true;
                    break;
                }
            }
            if clock.elapsed().saturating_sub(start) >= self.time_slice {
                break;
            }
        }

        if self.next >= self.bricks.len() {
            sink.post_render_bounding_boxes(self.frame);
            self.state = FrameState::FrameComplete;
        }

        report.elapsed = clock.elapsed().saturating_sub(start);
        self.slices += 1;
        self.elapsed += report.elapsed;
        self.drawn += report.drawn;
        self.substituted += report.substituted;
        self.skipped += report.skipped;
        report.state = self.state;

        tracing::debug!(
            drawn = report.drawn,
            skipped = report.skipped,
            stalled = report.stalled,
            next = self.next,
            of = self.bricks.len(),
            "slice done"
        );
        if self.state == FrameState::FrameComplete {
            tracing::debug!(frame = self.frame, slices = self.slices, "frame complete");
        }
        report
    }

    fn draw_one<B, S>(&self, cache: &mut BrickCache<B>, source: &dyn BrickSource, sink: &mut S) -> Outcome
    where
        B: TextureBackend,
        S: RenderSink<B::Texture> + ?Sized,
    {
        let requested = &self.bricks[self.next];
        let mut candidate = requested.clone();
        loop {
            match cache.acquire(source, &candidate.lod, &candidate.brick) {
                Ok(handle) => {
                    let draw = BrickDraw { position: self.next, requested, drawn: &candidate, handle };
                    let drawn = match cache.texture(handle) {
                        Some(texture) => sink.draw_brick(&draw, texture),
                        None => Err(Error::InvalidHandle(handle.value())),
                    };
                    if let Err(e) = cache.release(handle) {
                        tracing::warn!(%handle, error = %e, "release failed");
                    }
                    return match drawn {
                        Ok(()) => Outcome::Drawn { substituted: draw.is_substitute() },
                        Err(e) => {
                            tracing::warn!(position = self.next, error = %e, "draw failed, skipping brick");
                            Outcome::Skipped
                        }
                    };
                }
                Err(e) if e.is_recoverable() => {
                    if self.allow_coarser {
                        if let Some(coarser) = source.coarser_brick(&candidate.lod, &candidate.brick) {
                            tracing::trace!(from = ?candidate.lod.as_slice(), to = ?coarser.lod.as_slice(), "trying coarser LOD");
                            candidate = coarser;
                            continue;
                        }
                    }
                    if cache.referenced_bytes() == 0 {
                        tracing::warn!(position = self.next, error = %e, "brick exceeds cache budget, skipping");
                        return Outcome::Skipped;
                    }
                    return Outcome::Stalled;
                }
                Err(e) => {
                    tracing::warn!(position = self.next, error = %e, "brick unavailable, skipping");
                    return Outcome::Skipped;
                }
            }
        }
    }
}
