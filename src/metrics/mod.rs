//! Prometheus metrics for the capture and depth pipeline.
//!
//! The live loops push a [`MetricsSnapshot`] into a shared
//! [`MetricsRegistry`]; with the `metrics` feature the registry is served
//! over HTTP.
//!
//! # Metrics Exposed
//!
//! ## Capture
//! - `stereo_depth_capture_frames_total` - Frames published by the capture thread
//! - `stereo_depth_capture_read_failures_total` - Failed device reads
//!
//! ## Depth
//! - `stereo_depth_depth_frames_total` - Depth maps computed
//! - `stereo_depth_depth_compute_seconds` - Matcher time of the latest map
//! - `stereo_depth_valid_disparity_ratio` - Valid pixel fraction of the latest map
//! - `stereo_depth_parameter_refresh_total` - Parameter re-derivations
//!
//! ## Calibration
//! - `stereo_depth_calibration_generation` - Calibration reloads since start
//!
//! # Example
//!
//! ```no_run
//! use stereo_depth::metrics::{MetricsRegistry, MetricsSnapshot};
//!
//! let registry = MetricsRegistry::new().expect("Failed to create registry");
//! registry.update(&MetricsSnapshot {
//!     depth_frames: 12,
//!     ..MetricsSnapshot::default()
//! });
//! ```

mod collector;
#[cfg(feature = "metrics")]
mod server;

pub use collector::{MetricsError, MetricsRegistry, MetricsSnapshot};
#[cfg(feature = "metrics")]
pub use server::{MetricsServer, MetricsServerConfig, ServerError};
