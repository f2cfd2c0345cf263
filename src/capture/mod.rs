//! Stereo camera input and frame handling.
//!
//! A [`StereoCameraSession`] owns a [`VideoSource`] and runs one capture
//! thread that keeps the [`FrameBuffer`] filled with the latest frame.
//! Consumers read copies and split them into [`StereoPair`]s.

mod buffer;
mod config;
mod frame;
mod session;
mod source;

pub use buffer::{Capture, FrameBuffer};
pub use config::{
    CalibrationConfig, CaptureConfig, ConfigError, DepthConfig, FileConfig, OutputConfig,
};
pub use frame::{Frame, FrameError, StereoPair};
pub use session::{CaptureCounters, SessionError, StartOutcome, StereoCameraSession};
#[cfg(feature = "camera")]
pub use source::NokhwaSource;
pub use source::{MockStereoSource, SourceError, VideoSource};
