//! Metrics collection and registry.

use crate::capture::CaptureCounters;
use crate::depth::DepthOutput;
use prometheus::{Encoder, Gauge, IntCounter, IntGauge, Registry, TextEncoder};
use thiserror::Error;

/// Errors that can occur during metrics operations.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
}

/// A snapshot of pipeline state for metrics update.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    /// Frames published by the capture thread.
    pub frames_published: u64,
    /// Failed device reads.
    pub read_failures: u64,
    /// Depth maps computed.
    pub depth_frames: u64,
    /// Matcher time of the latest depth map, in seconds.
    pub depth_compute_seconds: Option<f64>,
    /// Fraction of valid pixels in the latest depth map.
    pub valid_disparity_ratio: Option<f64>,
    /// Calibration reload generation.
    pub calibration_generation: u64,
    /// Parameter re-derivations performed.
    pub parameter_refreshes: u64,
}

impl MetricsSnapshot {
    /// Fills the capture fields from session counters.
    pub fn with_capture(mut self, counters: &CaptureCounters) -> Self {
        self.frames_published = counters.frames_published;
        self.read_failures = counters.read_failures;
        self
    }

    /// Fills the per-frame depth fields from the latest output.
    pub fn with_depth(mut self, output: &DepthOutput) -> Self {
        let pixels = output.disparity.width() as f64 * output.disparity.height() as f64;
        self.depth_compute_seconds = Some(output.elapsed.as_secs_f64());
        if pixels > 0.0 {
            self.valid_disparity_ratio = Some(output.disparity.valid_count() as f64 / pixels);
        }
        self
    }
}

/// Prometheus metrics registry for the stereo pipeline.
pub struct MetricsRegistry {
    registry: Registry,

    // Capture metrics
    frames_total: IntCounter,
    read_failures_total: IntCounter,

    // Depth metrics
    depth_frames_total: IntCounter,
    depth_compute_seconds: Gauge,
    valid_disparity_ratio: Gauge,
    parameter_refresh_total: IntCounter,

    // Calibration metrics
    calibration_generation: IntGauge,
}

impl MetricsRegistry {
    /// Creates a new registry with all pipeline metrics registered.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let frames_total = IntCounter::new(
            "stereo_depth_capture_frames_total",
            "Frames published by the capture thread",
        )?;
        let read_failures_total = IntCounter::new(
            "stereo_depth_capture_read_failures_total",
            "Failed device reads",
        )?;

        let depth_frames_total = IntCounter::new(
            "stereo_depth_depth_frames_total",
            "Depth maps computed",
        )?;
        let depth_compute_seconds = Gauge::new(
            "stereo_depth_depth_compute_seconds",
            "Matcher time of the latest depth map",
        )?;
        let valid_disparity_ratio = Gauge::new(
            "stereo_depth_valid_disparity_ratio",
            "Fraction of pixels with a valid disparity in the latest depth map",
        )?;
        let parameter_refresh_total = IntCounter::new(
            "stereo_depth_parameter_refresh_total",
            "Matcher parameter re-derivations",
        )?;

        let calibration_generation = IntGauge::new(
            "stereo_depth_calibration_generation",
            "Number of calibration reloads since start",
        )?;

        registry.register(Box::new(frames_total.clone()))?;
        registry.register(Box::new(read_failures_total.clone()))?;
        registry.register(Box::new(depth_frames_total.clone()))?;
        registry.register(Box::new(depth_compute_seconds.clone()))?;
        registry.register(Box::new(valid_disparity_ratio.clone()))?;
        registry.register(Box::new(parameter_refresh_total.clone()))?;
        registry.register(Box::new(calibration_generation.clone()))?;

        Ok(Self {
            registry,
            frames_total,
            read_failures_total,
            depth_frames_total,
            depth_compute_seconds,
            valid_disparity_ratio,
            parameter_refresh_total,
            calibration_generation,
        })
    }

    /// Updates all metrics from a snapshot.
    ///
    /// Counters only move forward: a snapshot with a lower total than
    /// already recorded leaves the counter unchanged.
    pub fn update(&self, snapshot: &MetricsSnapshot) {
        advance(&self.frames_total, snapshot.frames_published);
        advance(&self.read_failures_total, snapshot.read_failures);
        advance(&self.depth_frames_total, snapshot.depth_frames);
        advance(&self.parameter_refresh_total, snapshot.parameter_refreshes);

        if let Some(seconds) = snapshot.depth_compute_seconds {
            self.depth_compute_seconds.set(seconds);
        }
        if let Some(ratio) = snapshot.valid_disparity_ratio {
            self.valid_disparity_ratio.set(ratio);
        }
        self.calibration_generation
            .set(snapshot.calibration_generation as i64);
    }

    /// Returns the underlying Prometheus registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

fn advance(counter: &IntCounter, total: u64) {
    let current = counter.get();
    if total > current {
        counter.inc_by(total - current);
    }
}
