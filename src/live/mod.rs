//! Live loops tying capture, rectification and depth together.
//!
//! Each loop reads copies from a running [`StereoCameraSession`], renders
//! views into a [`FrameSink`] and runs until the shared quit flag is raised
//! or an optional frame limit is reached. Iterations without a fresh
//! grabbed frame are skipped; per-frame failures are logged and absorbed.
//!
//! [`StereoCameraSession`]: crate::capture::StereoCameraSession

mod calibrate;
mod controls;
mod loops;
mod sink;

use crate::calibration::CalibrationError;
use crate::capture::{FrameError, SessionError};
use crate::depth::{DepthError, ParameterError};
use crate::metrics::{MetricsRegistry, MetricsSnapshot};
use crate::rectify::RectifyError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

pub use calibrate::{calibrate, export_preview, PREVIEW_LEFT, PREVIEW_RIGHT};
pub use controls::{ControlEvent, ControlPanel, FileControlPanel};
pub use loops::{capture_pictures, run_depth, run_preview, run_tuning, CaptureTiming, LoopSummary};
pub use sink::{hstack, FrameSink, SnapshotSink};

/// Errors that abort a live operation.
#[derive(Debug, Error)]
pub enum LiveError {
    #[error("capture session error: {0}")]
    Session(#[from] SessionError),

    #[error(transparent)]
    Calibration(#[from] CalibrationError),

    #[error("rectification error: {0}")]
    Rectify(#[from] RectifyError),

    #[error("depth error: {0}")]
    Depth(#[from] DepthError),

    #[error("parameter error: {0}")]
    Parameter(#[from] ParameterError),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

/// How long a loop sleeps when no fresh frame is available.
const IDLE_DELAY: Duration = Duration::from_millis(5);

/// Longest single sleep while waiting, so the quit flag stays responsive.
const WAIT_STEP: Duration = Duration::from_millis(50);

/// Stop conditions and optional metrics shared by the live loops.
#[derive(Clone)]
pub struct LoopControl {
    quit: Arc<AtomicBool>,
    limit: Option<u64>,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl LoopControl {
    /// Runs until `quit` is raised.
    pub fn new(quit: Arc<AtomicBool>) -> Self {
        Self {
            quit,
            limit: None,
            metrics: None,
        }
    }

    /// Also stops after `frames` processed frames.
    pub fn with_limit(mut self, frames: u64) -> Self {
        self.limit = Some(frames);
        self
    }

    /// Publishes a snapshot to `registry` after each frame.
    pub fn with_metrics(mut self, registry: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(registry);
        self
    }

    /// Returns true once the quit flag is set.
    pub fn quit_requested(&self) -> bool {
        self.quit.load(Ordering::SeqCst)
    }

    fn finished(&self, frames: u64) -> bool {
        self.quit_requested() || self.limit.is_some_and(|limit| frames >= limit)
    }

    /// Sleeps for `duration`, returning `false` early if quit is raised.
    fn wait(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.quit_requested() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(WAIT_STEP));
        }
    }

    fn publish(&self, snapshot: MetricsSnapshot) {
        if let Some(registry) = &self.metrics {
            registry.update(&snapshot);
        }
    }
}

impl std::fmt::Debug for LoopControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopControl")
            .field("quit", &self.quit_requested())
            .field("limit", &self.limit)
            .field("metrics", &self.metrics.is_some())
            .finish()
    }
}
