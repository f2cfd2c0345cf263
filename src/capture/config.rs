//! Capture and application configuration.
//!
//! The stereo rig delivers both lenses as one side-by-side frame, so
//! `width` is the combined width and each lens sees `width / 2`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration for the stereo video source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Video device index.
    pub source_id: u32,
    /// Combined (left + right) frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Requested frames per second.
    pub fps: u32,
    /// Synchronous reads attempted at open before giving up.
    pub warmup_attempts: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            source_id: 0,
            width: 1280,
            height: 480,
            fps: 30,
            warmup_attempts: 5,
        }
    }
}

impl CaptureConfig {
    /// Creates a new configuration with the specified dimensions.
    pub fn with_dimensions(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ..Default::default()
        }
    }

    /// Width of a single lens image.
    pub fn eye_width(&self) -> u32 {
        self.width / 2
    }

    /// Validates the configuration parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.width == 0 || self.height == 0 || self.width % 2 != 0 {
            return Err(ConfigError::InvalidDimensions);
        }
        if self.fps == 0 || self.fps > 120 {
            return Err(ConfigError::InvalidFrameRate);
        }
        if self.warmup_attempts == 0 {
            return Err(ConfigError::InvalidWarmup);
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid frame dimensions (combined width must be even and non-zero)")]
    InvalidDimensions,
    #[error("invalid frame rate (must be 1-120 fps)")]
    InvalidFrameRate,
    #[error("warm-up attempts must be at least 1")]
    InvalidWarmup,
    #[error("invalid checkerboard geometry")]
    InvalidBoard,
    #[error("failed to read config file: {0}")]
    FileReadError(String),
    #[error("failed to parse config file: {0}")]
    ParseError(String),
}

/// Full configuration file format.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FileConfig {
    /// Camera settings.
    #[serde(default)]
    pub capture: CaptureConfig,
    /// Photo capture and calibration settings.
    #[serde(default)]
    pub calibration: CalibrationConfig,
    /// Depth and tuning settings.
    #[serde(default)]
    pub depth: DepthConfig,
    /// Snapshot, timing and metrics settings.
    #[serde(default)]
    pub output: OutputConfig,
}

/// Checkerboard target and calibration folders.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Folder holding `left_image_NN.png` / `right_image_NN.png` pairs.
    pub photos_dir: PathBuf,
    /// Number of pairs to capture and to look for.
    pub photos_count: u32,
    /// Inner corner count along a board row.
    pub rows: u32,
    /// Inner corner count along a board column.
    pub columns: u32,
    /// Board square edge length (any unit, used for translation scale).
    pub square_size: f64,
    /// Folder the calibration result is written to and read from.
    pub result_dir: PathBuf,
    /// Write a rectified copy of the last valid pair after calibrating.
    pub export_preview: bool,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            photos_dir: PathBuf::from("images"),
            photos_count: 30,
            rows: 7,
            columns: 10,
            square_size: 2.0,
            result_dir: PathBuf::from("calibration_result"),
            export_preview: true,
        }
    }
}

impl CalibrationConfig {
    /// Checks every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rows < 2 || self.columns < 2 || !(self.square_size > 0.0) {
            return Err(ConfigError::InvalidBoard);
        }
        Ok(())
    }
}

/// Depth tuning files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DepthConfig {
    /// Where "save settings" writes and "load settings" reads.
    pub settings_path: PathBuf,
    /// Control file polled by the tuning loop.
    pub controls_path: PathBuf,
    /// Load saved settings before the live depth loop starts.
    pub load_settings_on_start: bool,
}

impl Default for DepthConfig {
    fn default() -> Self {
        Self {
            settings_path: PathBuf::from("depth_settings.toml"),
            controls_path: PathBuf::from("depth_controls.toml"),
            load_settings_on_start: false,
        }
    }
}

/// Output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Folder the snapshot sink writes the latest views into.
    pub snapshot_dir: PathBuf,
    /// Minimum interval between snapshot writes.
    pub snapshot_interval_ms: u64,
    /// Seconds to wait before the first picture is taken.
    pub countdown_secs: u64,
    /// Seconds between pictures.
    pub delay_secs: u64,
    /// Metrics server port (0 to disable).
    pub metrics_port: u16,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            snapshot_dir: PathBuf::from("snapshots"),
            snapshot_interval_ms: 500,
            countdown_secs: 3,
            delay_secs: 2,
            metrics_port: 9090,
        }
    }
}

impl FileConfig {
    /// Loads configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::FileReadError(e.to_string()))?;
        let config: FileConfig =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.capture.validate()?;
        config.calibration.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        let config = CaptureConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.eye_width(), 640);
        assert!(CalibrationConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_dimensions_invalid() {
        let mut config = CaptureConfig::default();
        config.width = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidDimensions)
        ));
    }

    #[test]
    fn test_odd_combined_width_invalid() {
        let config = CaptureConfig::with_dimensions(641, 480);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidDimensions)
        ));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.toml");
        std::fs::write(
            &path,
            "[capture]\nsource_id = 2\n\n[calibration]\nphotos_count = 12\n",
        )
        .unwrap();

        let config = FileConfig::from_file(&path).unwrap();
        assert_eq!(config.capture.source_id, 2);
        assert_eq!(config.capture.width, 1280);
        assert_eq!(config.calibration.photos_count, 12);
        assert_eq!(config.calibration.rows, 7);
        assert_eq!(config.output.metrics_port, 9090);
    }

    #[test]
    fn test_unparsable_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "[capture\nwidth = ").unwrap();
        assert!(matches!(
            FileConfig::from_file(&path),
            Err(ConfigError::ParseError(_))
        ));
    }
}
