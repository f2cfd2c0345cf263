//! Stereo calibration: photo sets, the calibration run and the
//! persisted result.
//!
//! Corner detection and the stereo solve sit behind [`CornerDetector`]
//! and [`CalibrationSolver`]; [`OpenCvCalibrator`] implements both when
//! the `opencv` feature is enabled.

mod backend;
mod photos;
mod result;
mod runner;

use std::path::PathBuf;
use thiserror::Error;

pub use backend::OpenCvCalibrator;
pub use photos::PhotoSet;
pub use result::{
    CalibrationResult, CalibrationStore, CameraModel, Matrix3, IDENTITY, RESULT_FILE,
};
pub use runner::{
    run_calibration, BoardSpec, CalibrationReport, CalibrationSolver, CornerDetector,
    PairSample, Side, SkipReason, SkippedPair,
};

/// Calibration errors.
#[derive(Debug, Error)]
pub enum CalibrationError {
    /// No usable calibration record in the result folder.
    #[error("no usable calibration at {}: {reason}", path.display())]
    CalibrationMissing { path: PathBuf, reason: String },

    #[error("chessboard not detected: {0}")]
    ChessboardNotDetected(String),

    #[error("calibration failed: {0}")]
    CalibrationFailed(String),

    #[error("calibration backend error: {0}")]
    Solver(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("failed to serialize calibration: {0}")]
    Serialize(#[from] toml::ser::Error),
}
