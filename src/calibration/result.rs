//! Persisted stereo calibration.

use super::CalibrationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// File name of the calibration record inside the result folder.
pub const RESULT_FILE: &str = "stereo_calibration.toml";

/// Row-major 3x3 matrix.
pub type Matrix3 = [[f64; 3]; 3];

/// Identity rotation.
pub const IDENTITY: Matrix3 = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];

/// Intrinsics and rectification of one lens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraModel {
    /// Pinhole camera matrix `[[fx, s, cx], [0, fy, cy], [0, 0, 1]]`.
    pub camera_matrix: Matrix3,
    /// Distortion coefficients `k1, k2, p1, p2, k3`.
    pub distortion: [f64; 5],
    /// Rotation into the common rectified frame.
    pub rectification: Matrix3,
    /// Projection in the rectified frame (3x4).
    pub projection: [[f64; 4]; 3],
}

impl CameraModel {
    /// A distortion-free lens that is already rectified.
    pub fn ideal(focal: f64, cx: f64, cy: f64) -> Self {
        Self {
            camera_matrix: [[focal, 0.0, cx], [0.0, focal, cy], [0.0, 0.0, 1.0]],
            distortion: [0.0; 5],
            rectification: IDENTITY,
            projection: [
                [focal, 0.0, cx, 0.0],
                [0.0, focal, cy, 0.0],
                [0.0, 0.0, 1.0, 0.0],
            ],
        }
    }

    fn is_finite(&self) -> bool {
        self.camera_matrix.iter().flatten().all(|v| v.is_finite())
            && self.distortion.iter().all(|v| v.is_finite())
            && self.rectification.iter().flatten().all(|v| v.is_finite())
            && self.projection.iter().flatten().all(|v| v.is_finite())
    }
}

/// Output of a stereo calibration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationResult {
    /// Width of one lens image.
    pub image_width: u32,
    /// Height of one lens image.
    pub image_height: u32,
    /// RMS reprojection error reported by the solver, in pixels.
    pub rms_error: f64,
    /// Number of photo pairs the solve used.
    pub pair_count: usize,
    /// When the solve finished.
    pub created_at: DateTime<Utc>,
    /// Rotation from the left to the right camera.
    pub rotation: Matrix3,
    /// Translation from the left to the right camera, in board units.
    pub translation: [f64; 3],
    /// Left camera model.
    pub left: CameraModel,
    /// Right camera model.
    pub right: CameraModel,
}

impl CalibrationResult {
    /// A pass-through calibration: both lenses ideal and row-aligned.
    pub fn identity(image_width: u32, image_height: u32) -> Self {
        let focal = image_width.max(image_height) as f64;
        let (cx, cy) = (image_width as f64 / 2.0, image_height as f64 / 2.0);
        Self {
            image_width,
            image_height,
            rms_error: 0.0,
            pair_count: 0,
            created_at: Utc::now(),
            rotation: IDENTITY,
            translation: [0.0; 3],
            left: CameraModel::ideal(focal, cx, cy),
            right: CameraModel::ideal(focal, cx, cy),
        }
    }

    fn validate(&self) -> Result<(), String> {
        if self.image_width == 0 || self.image_height == 0 {
            return Err("image size is zero".to_string());
        }
        if !self.left.is_finite() || !self.right.is_finite() {
            return Err("camera model contains non-finite values".to_string());
        }
        Ok(())
    }
}

/// Folder holding a calibration result. The same folder is used for
/// writing after calibration and for reading by the rectifier.
#[derive(Debug, Clone)]
pub struct CalibrationStore {
    dir: PathBuf,
}

impl CalibrationStore {
    /// Creates a store rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Returns the store folder.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the path of the persisted result.
    pub fn result_path(&self) -> PathBuf {
        self.dir.join(RESULT_FILE)
    }

    /// Returns true if a result file is present.
    pub fn exists(&self) -> bool {
        self.result_path().is_file()
    }

    /// Writes the result atomically: a reader sees either the previous
    /// file or the complete new one.
    pub fn save(&self, result: &CalibrationResult) -> Result<PathBuf, CalibrationError> {
        let text = toml::to_string_pretty(result)?;
        std::fs::create_dir_all(&self.dir)?;

        let path = self.result_path();
        let tmp = self.dir.join(format!(".{RESULT_FILE}.tmp"));
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, &path)?;

        tracing::info!(path = %path.display(), pairs = result.pair_count, "Calibration saved");
        Ok(path)
    }

    /// Reads the result, failing with `CalibrationMissing` if there is no
    /// usable record.
    pub fn load(&self) -> Result<CalibrationResult, CalibrationError> {
        let path = self.result_path();
        let missing = |reason: String| CalibrationError::CalibrationMissing {
            path: path.clone(),
            reason,
        };

        let text = std::fs::read_to_string(&path).map_err(|e| missing(e.to_string()))?;
        let result: CalibrationResult =
            toml::from_str(&text).map_err(|e| missing(e.to_string()))?;
        result.validate().map_err(missing)?;

        tracing::debug!(path = %path.display(), "Calibration loaded");
        Ok(result)
    }
}
