//! Runs a stereo calibration over a photo set.

use super::photos::PhotoSet;
use super::result::{CalibrationResult, CalibrationStore};
use super::CalibrationError;
use crate::capture::{CalibrationConfig, Frame, StereoPair};
use image::{GrayImage, RgbImage};
use std::fmt;
use std::path::PathBuf;

/// Chessboard geometry: inner-corner counts and square edge length.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoardSpec {
    /// Inner corners per column.
    pub rows: u32,
    /// Inner corners per row.
    pub columns: u32,
    /// Edge length of one square, in board units.
    pub square_size: f64,
}

impl BoardSpec {
    /// Reads the board geometry from the calibration settings.
    pub fn from_config(config: &CalibrationConfig) -> Self {
        Self {
            rows: config.rows,
            columns: config.columns,
            square_size: config.square_size,
        }
    }

    /// Returns the number of inner corners.
    pub fn corner_count(&self) -> usize {
        self.rows as usize * self.columns as usize
    }

    /// Board corner positions in board units, row-major, on the z = 0 plane.
    pub fn object_points(&self) -> Vec<[f32; 3]> {
        (0..self.rows)
            .flat_map(|r| {
                (0..self.columns).map(move |c| {
                    [
                        (c as f64 * self.square_size) as f32,
                        (r as f64 * self.square_size) as f32,
                        0.0,
                    ]
                })
            })
            .collect()
    }
}

/// Finds chessboard inner corners in a grayscale image.
pub trait CornerDetector {
    /// Returns the corners in row-major order, or
    /// `ChessboardNotDetected` if the full board is not visible.
    fn find_corners(
        &self,
        image: &GrayImage,
        board: &BoardSpec,
    ) -> Result<Vec<[f32; 2]>, CalibrationError>;
}

/// Solves the stereo calibration from registered corner samples.
pub trait CalibrationSolver {
    /// Solves both cameras and their relative pose from the samples.
    fn solve(
        &self,
        board: &BoardSpec,
        image_size: (u32, u32),
        samples: &[PairSample],
    ) -> Result<CalibrationResult, CalibrationError>;
}

/// Corners detected in both images of one photo pair.
#[derive(Debug, Clone, PartialEq)]
pub struct PairSample {
    /// Photo pair index.
    pub index: u32,
    /// Corners found in the left image.
    pub left: Vec<[f32; 2]>,
    /// Corners found in the right image.
    pub right: Vec<[f32; 2]>,
}

/// Which half of a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Left lens.
    Left,
    /// Right lens.
    Right,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Side::Left => "left",
            Side::Right => "right",
        })
    }
}

/// Why a photo pair did not contribute to the solve.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    /// One of the two images does not exist.
    MissingFile(PathBuf),
    /// The image could not be decoded or examined.
    Unreadable(String),
    /// No full board was found on this side.
    ChessboardNotDetected(Side),
    /// Image size differs from the first usable pair.
    SizeMismatch {
        expected: (u32, u32),
        actual: (u32, u32),
    },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::MissingFile(path) => write!(f, "{} not found", path.display()),
            SkipReason::Unreadable(e) => write!(f, "unreadable image: {e}"),
            SkipReason::ChessboardNotDetected(side) => {
                write!(f, "chessboard not detected in {side} image")
            }
            SkipReason::SizeMismatch { expected, actual } => write!(
                f,
                "image is {}x{}, expected {}x{}",
                actual.0, actual.1, expected.0, expected.1
            ),
        }
    }
}

/// A pair left out of the solve.
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedPair {
    /// Photo pair index.
    pub index: u32,
    /// Why it was left out.
    pub reason: SkipReason,
}

/// Outcome of a successful calibration run.
#[derive(Debug, Clone)]
pub struct CalibrationReport {
    /// Pair indices that contributed samples.
    pub used: Vec<u32>,
    /// Pairs left out, in index order.
    pub skipped: Vec<SkippedPair>,
    /// The persisted calibration.
    pub result: CalibrationResult,
    /// Where the result was persisted.
    pub result_path: PathBuf,
    /// The last pair that contributed, for a visual rectification check.
    pub last_pair: StereoPair,
}

/// Registers every usable pair of `photos`, runs one solve and persists
/// the result.
///
/// Missing, unreadable or undetected pairs are skipped and reported. If
/// no pair is usable the run fails with `CalibrationFailed` and nothing is
/// written. A `Solver` error from the detector means the backend itself is
/// unusable and aborts the run unchanged.
pub fn run_calibration<D, S>(
    photos: &PhotoSet,
    board: &BoardSpec,
    detector: &D,
    solver: &S,
    store: &CalibrationStore,
) -> Result<CalibrationReport, CalibrationError>
where
    D: CornerDetector + ?Sized,
    S: CalibrationSolver + ?Sized,
{
    if !photos.dir().is_dir() {
        return Err(CalibrationError::CalibrationFailed(format!(
            "photo folder {} does not exist",
            photos.dir().display()
        )));
    }

    let mut samples = Vec::new();
    let mut skipped = Vec::new();
    let mut image_size = None;
    let mut last_pair = None;

    for index in 0..photos.count() {
        match register_pair(photos, index, board, detector, &mut image_size)? {
            Ok((sample, left, right)) => {
                tracing::debug!(index, corners = sample.left.len(), "Pair registered");
                samples.push(sample);
                last_pair = Some((left, right));
            }
            Err(reason) => {
                tracing::warn!(index, %reason, "Pair skipped");
                skipped.push(SkippedPair { index, reason });
            }
        }
    }

    let (Some(size), Some((left, right))) = (image_size, last_pair) else {
        return Err(CalibrationError::CalibrationFailed(format!(
            "no usable pairs among {} in {}",
            photos.count(),
            photos.dir().display()
        )));
    };

    tracing::info!(
        pairs = samples.len(),
        skipped = skipped.len(),
        width = size.0,
        height = size.1,
        "Starting stereo solve"
    );
    let mut result = solver.solve(board, size, &samples)?;
    result.pair_count = samples.len();
    let result_path = store.save(&result)?;

    let last_pair = StereoPair::new(Frame::from_rgb(left, 0), Frame::from_rgb(right, 0))
        .map_err(|e| CalibrationError::CalibrationFailed(e.to_string()))?;

    Ok(CalibrationReport {
        used: samples.iter().map(|s| s.index).collect(),
        skipped,
        result,
        result_path,
        last_pair,
    })
}

/// Outer error aborts the run; inner error skips the pair.
type Registration =
    Result<Result<(PairSample, RgbImage, RgbImage), SkipReason>, CalibrationError>;

fn register_pair<D: CornerDetector + ?Sized>(
    photos: &PhotoSet,
    index: u32,
    board: &BoardSpec,
    detector: &D,
    image_size: &mut Option<(u32, u32)>,
) -> Registration {
    for path in [photos.left_path(index), photos.right_path(index)] {
        if !path.is_file() {
            return Ok(Err(SkipReason::MissingFile(path)));
        }
    }
    let (left, right) = match photos.read_pair(index) {
        Ok(pair) => pair,
        Err(e) => return Ok(Err(SkipReason::Unreadable(e.to_string()))),
    };

    let expected = image_size.unwrap_or(left.dimensions());
    for actual in [left.dimensions(), right.dimensions()] {
        if actual != expected {
            return Ok(Err(SkipReason::SizeMismatch { expected, actual }));
        }
    }

    let detect = |image: &RgbImage, side| {
        let gray = image::imageops::grayscale(image);
        match detector.find_corners(&gray, board) {
            Ok(corners) if corners.len() == board.corner_count() => Ok(Ok(corners)),
            Ok(_) | Err(CalibrationError::ChessboardNotDetected(_)) => {
                Ok(Err(SkipReason::ChessboardNotDetected(side)))
            }
            Err(e @ CalibrationError::Solver(_)) => Err(e),
            Err(e) => Ok(Err(SkipReason::Unreadable(e.to_string()))),
        }
    };
    let left_corners = match detect(&left, Side::Left)? {
        Ok(corners) => corners,
        Err(reason) => return Ok(Err(reason)),
    };
    let right_corners = match detect(&right, Side::Right)? {
        Ok(corners) => corners,
        Err(reason) => return Ok(Err(reason)),
    };

    *image_size = Some(expected);
    Ok(Ok((
        PairSample {
            index,
            left: left_corners,
            right: right_corners,
        },
        left,
        right,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use std::cell::Cell;

    /// Treats an image whose top-left pixel is black as boardless.
    struct MarkerDetector;

    impl CornerDetector for MarkerDetector {
        fn find_corners(
            &self,
            image: &GrayImage,
            board: &BoardSpec,
        ) -> Result<Vec<[f32; 2]>, CalibrationError> {
            if image.get_pixel(0, 0)[0] == 0 {
                return Err(CalibrationError::ChessboardNotDetected("marker".into()));
            }
            Ok(vec![[1.0, 1.0]; board.corner_count()])
        }
    }

    #[derive(Default)]
    struct CountingSolver {
        calls: Cell<usize>,
        seen: Cell<usize>,
    }

    impl CalibrationSolver for CountingSolver {
        fn solve(
            &self,
            _board: &BoardSpec,
            image_size: (u32, u32),
            samples: &[PairSample],
        ) -> Result<CalibrationResult, CalibrationError> {
            self.calls.set(self.calls.get() + 1);
            self.seen.set(samples.len());
            Ok(CalibrationResult::identity(image_size.0, image_size.1))
        }
    }

    fn board() -> BoardSpec {
        BoardSpec {
            rows: 7,
            columns: 10,
            square_size: 2.0,
        }
    }

    fn write_image(path: PathBuf, value: u8) {
        RgbImage::from_pixel(16, 12, Rgb([value, value, value]))
            .save(path)
            .unwrap();
    }

    #[test]
    fn test_object_points_grid() {
        let points = board().object_points();
        assert_eq!(points.len(), 70);
        assert_eq!(points[0], [0.0, 0.0, 0.0]);
        assert_eq!(points[1], [2.0, 0.0, 0.0]);
        assert_eq!(points[10], [0.0, 2.0, 0.0]);
    }

    #[test]
    fn test_skips_missing_and_undetected_pairs() {
        let dir = tempfile::tempdir().unwrap();
        let photos = PhotoSet::new(dir.path().join("images"), 5);
        std::fs::create_dir_all(photos.dir()).unwrap();

        for index in 0..5 {
            let value = if index == 4 { 0 } else { 200 };
            write_image(photos.left_path(index), value);
            if index != 2 {
                write_image(photos.right_path(index), 200);
            }
        }

        let store = CalibrationStore::new(dir.path().join("calibration_result"));
        let solver = CountingSolver::default();
        let report = run_calibration(&photos, &board(), &MarkerDetector, &solver, &store).unwrap();

        assert_eq!(report.used, vec![0, 1, 3]);
        assert_eq!(report.skipped.len(), 2);
        assert_eq!(report.skipped[0].index, 2);
        assert!(matches!(report.skipped[0].reason, SkipReason::MissingFile(_)));
        assert_eq!(
            report.skipped[1].reason,
            SkipReason::ChessboardNotDetected(Side::Left)
        );

        assert_eq!(solver.calls.get(), 1);
        assert_eq!(solver.seen.get(), 3);
        assert_eq!(report.result.pair_count, 3);
        assert_eq!(store.load().unwrap(), report.result);
        assert_eq!(report.last_pair.width(), 16);
    }

    #[test]
    fn test_no_usable_pairs_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let photos = PhotoSet::new(dir.path().join("images"), 3);
        std::fs::create_dir_all(photos.dir()).unwrap();
        write_image(photos.left_path(0), 0);
        write_image(photos.right_path(0), 0);

        let store = CalibrationStore::new(dir.path().join("calibration_result"));
        let solver = CountingSolver::default();
        let err = run_calibration(&photos, &board(), &MarkerDetector, &solver, &store).unwrap_err();

        assert!(matches!(err, CalibrationError::CalibrationFailed(_)));
        assert_eq!(solver.calls.get(), 0);
        assert!(!store.dir().exists());
    }

    #[test]
    fn test_missing_photo_folder() {
        let dir = tempfile::tempdir().unwrap();
        let photos = PhotoSet::new(dir.path().join("nowhere"), 3);
        let store = CalibrationStore::new(dir.path().join("calibration_result"));
        let result = run_calibration(
            &photos,
            &board(),
            &MarkerDetector,
            &CountingSolver::default(),
            &store,
        );
        assert!(matches!(result, Err(CalibrationError::CalibrationFailed(_))));
    }

    #[test]
    fn test_mismatched_sizes_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let photos = PhotoSet::new(dir.path(), 2);
        write_image(photos.left_path(0), 200);
        write_image(photos.right_path(0), 200);
        RgbImage::from_pixel(8, 8, Rgb([200, 200, 200]))
            .save(photos.left_path(1))
            .unwrap();
        write_image(photos.right_path(1), 200);

        let store = CalibrationStore::new(dir.path().join("out"));
        let report = run_calibration(
            &photos,
            &board(),
            &MarkerDetector,
            &CountingSolver::default(),
            &store,
        )
        .unwrap();
        assert_eq!(report.used, vec![0]);
        assert!(matches!(
            report.skipped[0].reason,
            SkipReason::SizeMismatch { .. }
        ));
    }

    #[test]
    fn test_backend_error_aborts_run() {
        struct Unavailable;

        impl CornerDetector for Unavailable {
            fn find_corners(
                &self,
                _image: &GrayImage,
                _board: &BoardSpec,
            ) -> Result<Vec<[f32; 2]>, CalibrationError> {
                Err(CalibrationError::Solver("backend missing".into()))
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let photos = PhotoSet::new(dir.path(), 2);
        for index in 0..2 {
            write_image(photos.left_path(index), 200);
            write_image(photos.right_path(index), 200);
        }

        let store = CalibrationStore::new(dir.path().join("out"));
        let solver = CountingSolver::default();
        let result = run_calibration(&photos, &board(), &Unavailable, &solver, &store);
        assert!(matches!(result, Err(CalibrationError::Solver(ref m)) if m == "backend missing"));
        assert_eq!(solver.calls.get(), 0);
        assert!(!store.exists());
    }

    #[test]
    fn test_detector_failure_skips_pair() {
        struct Flaky;

        impl CornerDetector for Flaky {
            fn find_corners(
                &self,
                image: &GrayImage,
                board: &BoardSpec,
            ) -> Result<Vec<[f32; 2]>, CalibrationError> {
                if image.get_pixel(0, 0)[0] == 0 {
                    return Err(CalibrationError::CalibrationFailed("decode".into()));
                }
                Ok(vec![[1.0, 1.0]; board.corner_count()])
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let photos = PhotoSet::new(dir.path(), 2);
        write_image(photos.left_path(0), 0);
        write_image(photos.right_path(0), 200);
        write_image(photos.left_path(1), 200);
        write_image(photos.right_path(1), 200);

        let store = CalibrationStore::new(dir.path().join("out"));
        let report = run_calibration(
            &photos,
            &board(),
            &Flaky,
            &CountingSolver::default(),
            &store,
        )
        .unwrap();
        assert_eq!(report.used, vec![1]);
        assert!(matches!(report.skipped[0].reason, SkipReason::Unreadable(_)));
    }
}
