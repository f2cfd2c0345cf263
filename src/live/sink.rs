//! Destinations for rendered views.

use super::LiveError;
use image::{ImageFormat, RgbImage};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Receives named views from the live loops.
pub trait FrameSink {
    /// Presents `image` under the view name `view`.
    fn show(&mut self, view: &str, image: &RgbImage) -> Result<(), LiveError>;
}

/// Writes the latest image of each view to `<dir>/<view>.png`, at most
/// once per interval per view.
#[derive(Debug)]
pub struct SnapshotSink {
    dir: PathBuf,
    interval: Duration,
    last_written: HashMap<String, Instant>,
    written: u64,
}

impl SnapshotSink {
    /// Creates the sink, creating `dir` if absent.
    pub fn new(dir: impl Into<PathBuf>, interval: Duration) -> Result<Self, LiveError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            interval,
            last_written: HashMap::new(),
            written: 0,
        })
    }

    /// Returns the snapshot folder.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Total files written.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Returns the snapshot path of `view`.
    pub fn path_for(&self, view: &str) -> PathBuf {
        self.dir.join(format!("{view}.png"))
    }
}

impl FrameSink for SnapshotSink {
    fn show(&mut self, view: &str, image: &RgbImage) -> Result<(), LiveError> {
        let now = Instant::now();
        if let Some(last) = self.last_written.get(view) {
            if now.duration_since(*last) < self.interval {
                return Ok(());
            }
        }

        // Write beside the target and rename so viewers never see a
        // partial PNG.
        let path = self.path_for(view);
        let tmp = self.dir.join(format!(".{view}.png.tmp"));
        image.save_with_format(&tmp, ImageFormat::Png)?;
        std::fs::rename(&tmp, &path)?;

        self.last_written.insert(view.to_string(), now);
        self.written += 1;
        tracing::trace!(view, path = %path.display(), "Snapshot written");
        Ok(())
    }
}

/// Places two equally tall images side by side.
pub fn hstack(left: &RgbImage, right: &RgbImage) -> RgbImage {
    let height = left.height().max(right.height());
    let mut out = RgbImage::new(left.width() + right.width(), height);
    image::imageops::replace(&mut out, left, 0, 0);
    image::imageops::replace(&mut out, right, left.width() as i64, 0);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_snapshot_sink_rate_limits_per_view() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = SnapshotSink::new(dir.path().join("snaps"), Duration::from_secs(60)).unwrap();
        let image = RgbImage::from_pixel(4, 4, Rgb([9, 9, 9]));

        sink.show("depth", &image).unwrap();
        sink.show("depth", &image).unwrap();
        sink.show("frame", &image).unwrap();

        assert_eq!(sink.written(), 2);
        let read = image::open(sink.path_for("depth")).unwrap().to_rgb8();
        assert_eq!(read, image);
    }

    #[test]
    fn test_zero_interval_writes_every_time() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = SnapshotSink::new(dir.path(), Duration::ZERO).unwrap();
        let image = RgbImage::new(2, 2);
        for _ in 0..3 {
            sink.show("preview", &image).unwrap();
        }
        assert_eq!(sink.written(), 3);
    }

    #[test]
    fn test_hstack() {
        let a = RgbImage::from_pixel(2, 3, Rgb([1, 1, 1]));
        let b = RgbImage::from_pixel(3, 3, Rgb([2, 2, 2]));
        let out = hstack(&a, &b);
        assert_eq!(out.dimensions(), (5, 3));
        assert_eq!(*out.get_pixel(1, 2), Rgb([1, 1, 1]));
        assert_eq!(*out.get_pixel(2, 0), Rgb([2, 2, 2]));
    }
}
