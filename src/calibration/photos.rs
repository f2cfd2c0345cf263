//! Calibration photo folder layout.

use super::CalibrationError;
use crate::capture::StereoPair;
use image::RgbImage;
use std::path::{Path, PathBuf};

/// A folder of numbered photo pairs, `left_image_NN.png` and
/// `right_image_NN.png` with `NN` zero-padded to two digits.
#[derive(Debug, Clone)]
pub struct PhotoSet {
    dir: PathBuf,
    count: u32,
}

impl PhotoSet {
    /// Describes `count` pairs stored in `dir`.
    pub fn new(dir: impl Into<PathBuf>, count: u32) -> Self {
        Self {
            dir: dir.into(),
            count,
        }
    }

    /// Returns the photo folder.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of pair slots, indexed `0..count`.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Returns the path of the left image of pair `index`.
    pub fn left_path(&self, index: u32) -> PathBuf {
        self.dir.join(format!("left_image_{index:02}.png"))
    }

    /// Returns the path of the right image of pair `index`.
    pub fn right_path(&self, index: u32) -> PathBuf {
        self.dir.join(format!("right_image_{index:02}.png"))
    }

    /// Writes one pair, creating the folder if absent.
    pub fn write_pair(&self, index: u32, pair: &StereoPair) -> Result<(), CalibrationError> {
        std::fs::create_dir_all(&self.dir)?;
        pair.left().to_rgb_image().save(self.left_path(index))?;
        pair.right().to_rgb_image().save(self.right_path(index))?;
        Ok(())
    }

    /// Reads one pair. Fails with `Io` if either file is absent.
    pub fn read_pair(&self, index: u32) -> Result<(RgbImage, RgbImage), CalibrationError> {
        let (left, right) = (self.left_path(index), self.right_path(index));
        for path in [&left, &right] {
            if !path.is_file() {
                return Err(CalibrationError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("{} not found", path.display()),
                )));
            }
        }
        Ok((image::open(left)?.to_rgb8(), image::open(right)?.to_rgb8()))
    }
}
