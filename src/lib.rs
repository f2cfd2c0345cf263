//! Stereo Depth Library
//!
//! Live depth maps from a side-by-side stereo camera: background frame
//! capture, chessboard calibration, rectification and block-matching
//! disparity with false-color rendering.
//!
//! # Architecture
//!
//! ```text
//! capture ──► rectify ──► depth ──► live (sinks, controls)
//!                ▲
//!           calibration
//! ```
//!
//! - [`capture`] owns the device on a dedicated thread and hands out
//!   copies of the latest combined frame.
//! - [`calibration`] turns photo pairs into a persisted calibration.
//! - [`rectify`] applies that calibration to live pairs.
//! - [`depth`] derives matcher parameters from operator controls and
//!   computes disparity maps.
//! - [`live`] wires the above into the preview, capture, depth and tuning
//!   loops.
//!
//! # Example
//!
//! ```no_run
//! use stereo_depth::{
//!     calibration::CalibrationStore,
//!     capture::{CaptureConfig, MockStereoSource, StereoCameraSession},
//!     depth::{DepthMapEngine, MatcherParameters},
//!     rectify::RectificationAdapter,
//! };
//!
//! let config = CaptureConfig::default();
//! let mut session = StereoCameraSession::open(MockStereoSource::new(), config).unwrap();
//! session.start().unwrap();
//!
//! let adapter = RectificationAdapter::load(CalibrationStore::new("calibration_result")).unwrap();
//! let mut engine = DepthMapEngine::new();
//!
//! let capture = session.read();
//! if capture.grabbed {
//!     let pair = capture.frame.split_side_by_side().unwrap();
//!     let rectified = adapter.rectify(&pair).unwrap();
//!     let output = engine.compute(&rectified, &MatcherParameters::default()).unwrap();
//!     println!("{} valid pixels", output.disparity.valid_count());
//! }
//! session.release();
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod calibration;
pub mod capture;
pub mod depth;
pub mod live;
pub mod metrics;
pub mod rectify;

// Re-export commonly used types at crate root
pub use calibration::{CalibrationResult, CalibrationStore};
pub use capture::{
    CaptureConfig, FileConfig, Frame, MockStereoSource, StereoCameraSession, StereoPair,
};
pub use depth::{DepthMapEngine, MatcherParameters, ParameterId, ParameterStore};
pub use rectify::RectificationAdapter;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
