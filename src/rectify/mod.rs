//! Rectification of stereo pairs using a persisted calibration.
//!
//! The calibration is read once into a [`RectificationAdapter`], which
//! precomputes per-camera remap tables. A new calibration only takes
//! effect after an explicit [`RectificationAdapter::reload`].

mod remap;

use crate::calibration::{CalibrationError, CalibrationResult, CalibrationStore};
use crate::capture::{FrameError, StereoPair};
use thiserror::Error;

pub use remap::RemapTable;

/// Rectification errors.
#[derive(Debug, Error)]
pub enum RectifyError {
    #[error("pair is {actual_width}x{actual_height}, calibration expects {expected_width}x{expected_height}")]
    SizeMismatch {
        expected_width: u32,
        expected_height: u32,
        actual_width: u32,
        actual_height: u32,
    },

    #[error("calibration error: {0}")]
    Calibration(#[from] CalibrationError),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
}

/// A loaded calibration and the remap tables derived from it.
#[derive(Debug, Clone)]
pub struct CalibrationHandle {
    result: CalibrationResult,
    left: RemapTable,
    right: RemapTable,
}

impl CalibrationHandle {
    /// Precomputes remap tables for both cameras.
    pub fn new(result: CalibrationResult) -> Result<Self, CalibrationError> {
        let (w, h) = (result.image_width, result.image_height);
        let singular = || CalibrationError::CalibrationFailed(
            "rectified projection is singular".to_string(),
        );
        let left = RemapTable::build(&result.left, w, h).ok_or_else(singular)?;
        let right = RemapTable::build(&result.right, w, h).ok_or_else(singular)?;
        Ok(Self {
            result,
            left,
            right,
        })
    }

    /// Returns the calibration the maps were built from.
    pub fn result(&self) -> &CalibrationResult {
        &self.result
    }
}

/// Applies the stereo calibration to incoming pairs.
#[derive(Debug)]
pub struct RectificationAdapter {
    store: Option<CalibrationStore>,
    handle: CalibrationHandle,
    generation: u64,
}

impl RectificationAdapter {
    /// Loads the calibration from `store`.
    ///
    /// Fails with `CalibrationMissing` if the store has no usable record.
    pub fn load(store: CalibrationStore) -> Result<Self, CalibrationError> {
        let handle = CalibrationHandle::new(store.load()?)?;
        tracing::info!(
            path = %store.result_path().display(),
            width = handle.result.image_width,
            height = handle.result.image_height,
            "Calibration loaded"
        );
        Ok(Self {
            store: Some(store),
            handle,
            generation: 0,
        })
    }

    /// Wraps an in-memory calibration. [`reload`](Self::reload) is a
    /// no-op for adapters built this way.
    pub fn from_result(result: CalibrationResult) -> Result<Self, CalibrationError> {
        Ok(Self {
            store: None,
            handle: CalibrationHandle::new(result)?,
            generation: 0,
        })
    }

    /// Re-reads the calibration store. On failure the current calibration
    /// stays in effect.
    pub fn reload(&mut self) -> Result<(), CalibrationError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        self.handle = CalibrationHandle::new(store.load()?)?;
        self.generation += 1;
        tracing::info!(generation = self.generation, "Calibration reloaded");
        Ok(())
    }

    /// Incremented by every successful reload.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns the active calibration.
    pub fn calibration(&self) -> &CalibrationResult {
        &self.handle.result
    }

    /// Rectifies both frames of `pair`.
    pub fn rectify(&self, pair: &StereoPair) -> Result<StereoPair, RectifyError> {
        let result = &self.handle.result;
        if (pair.width(), pair.height()) != (result.image_width, result.image_height) {
            return Err(RectifyError::SizeMismatch {
                expected_width: result.image_width,
                expected_height: result.image_height,
                actual_width: pair.width(),
                actual_height: pair.height(),
            });
        }
        let left = self.handle.left.apply(pair.left())?;
        let right = self.handle.right.apply(pair.right())?;
        Ok(StereoPair::new(left, right)?)
    }
}
