//! Progressive rendering: slice scheduling over the brick cache.

mod clock;
mod scheduler;

pub use clock::{Clock, ManualClock, SystemClock};
pub use scheduler::{
    BrickDraw, FrameProgress, FrameState, ProgressiveScheduler, RenderSink, SliceReport,
};
