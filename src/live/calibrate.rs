//! Calibration run followed by a rectified preview of the last pair.

use super::LiveError;
use crate::calibration::{
    run_calibration, BoardSpec, CalibrationReport, CalibrationSolver, CalibrationStore,
    CornerDetector, PhotoSet,
};
use crate::capture::{CalibrationConfig, StereoPair};
use crate::rectify::RectificationAdapter;
use std::path::PathBuf;

/// File names of the rectified preview written next to the result.
pub const PREVIEW_LEFT: &str = "calibrated_left_image.png";
/// See [`PREVIEW_LEFT`].
pub const PREVIEW_RIGHT: &str = "calibrated_right_image.png";

/// Rectifies `pair` with the calibration in `store` and writes both
/// halves into the store folder.
pub fn export_preview(
    store: &CalibrationStore,
    pair: &StereoPair,
) -> Result<(PathBuf, PathBuf), LiveError> {
    let adapter = RectificationAdapter::load(store.clone())?;
    let rectified = adapter.rectify(pair)?;

    let left = store.dir().join(PREVIEW_LEFT);
    let right = store.dir().join(PREVIEW_RIGHT);
    rectified.left().to_rgb_image().save(&left)?;
    rectified.right().to_rgb_image().save(&right)?;
    tracing::info!(left = %left.display(), right = %right.display(), "Rectified preview written");
    Ok((left, right))
}

/// Calibrates from the configured photo folder and, if enabled, writes
/// the rectified preview of the last used pair.
pub fn calibrate<D, S>(
    config: &CalibrationConfig,
    detector: &D,
    solver: &S,
) -> Result<CalibrationReport, LiveError>
where
    D: CornerDetector + ?Sized,
    S: CalibrationSolver + ?Sized,
{
    let photos = PhotoSet::new(&config.photos_dir, config.photos_count);
    let store = CalibrationStore::new(&config.result_dir);
    let board = BoardSpec::from_config(config);

    let report = run_calibration(&photos, &board, detector, solver, &store)?;
    tracing::info!(
        used = report.used.len(),
        skipped = report.skipped.len(),
        rms_error = report.result.rms_error,
        "Calibration complete"
    );

    if config.export_preview {
        if let Err(e) = export_preview(&store, &report.last_pair) {
            tracing::warn!(error = %e, "Rectified preview not written");
        }
    }
    Ok(report)
}
