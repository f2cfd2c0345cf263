//! OpenCV-backed corner detection and stereo solve.
//!
//! Requires OpenCV 4.x on the build host. Enable with `--features opencv`.

use super::runner::{BoardSpec, CalibrationSolver, CornerDetector, PairSample};
use super::result::CalibrationResult;
use super::CalibrationError;
use image::GrayImage;

#[cfg(feature = "opencv")]
mod opencv_impl {
    use super::*;
    use crate::calibration::result::{CameraModel, Matrix3};
    use opencv::calib3d;
    use opencv::core::{self, Mat, Point2f, Point3f, Rect, Size, TermCriteria, Vector};
    use opencv::imgproc;
    use opencv::prelude::*;

    fn solver_err(e: opencv::Error) -> CalibrationError {
        CalibrationError::Solver(e.to_string())
    }

    fn criteria(max_count: i32, epsilon: f64) -> Result<TermCriteria, CalibrationError> {
        TermCriteria::new(
            core::TermCriteria_Type::COUNT as i32 + core::TermCriteria_Type::EPS as i32,
            max_count,
            epsilon,
        )
        .map_err(solver_err)
    }

    /// Corner detection with sub-pixel refinement, plus the
    /// intrinsic, stereo and rectification solves.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct OpenCvCalibrator;

    impl OpenCvCalibrator {
        /// Creates the calibrator.
        pub fn new() -> Self {
            Self
        }

        fn to_mat(image: &GrayImage) -> Result<Mat, CalibrationError> {
            let mut mat = Mat::new_rows_cols_with_default(
                image.height() as i32,
                image.width() as i32,
                core::CV_8UC1,
                core::Scalar::all(0.0),
            )
            .map_err(solver_err)?;
            mat.data_bytes_mut()
                .map_err(solver_err)?
                .copy_from_slice(image.as_raw());
            Ok(mat)
        }

        fn mat3(mat: &Mat) -> Result<Matrix3, CalibrationError> {
            let d = Self::values(mat, 9)?;
            Ok([[d[0], d[1], d[2]], [d[3], d[4], d[5]], [d[6], d[7], d[8]]])
        }

        fn values(mat: &Mat, len: usize) -> Result<Vec<f64>, CalibrationError> {
            let data: &[f64] = mat.data_typed().map_err(solver_err)?;
            if data.len() < len {
                return Err(CalibrationError::Solver(format!(
                    "expected {len} values, solver returned {}",
                    data.len()
                )));
            }
            Ok(data[..len].to_vec())
        }

        fn camera_model(
            camera: &Mat,
            dist: &Mat,
            rect: &Mat,
            proj: &Mat,
        ) -> Result<CameraModel, CalibrationError> {
            let d = Self::values(dist, 5)?;
            let p = Self::values(proj, 12)?;
            Ok(CameraModel {
                camera_matrix: Self::mat3(camera)?,
                distortion: [d[0], d[1], d[2], d[3], d[4]],
                rectification: Self::mat3(rect)?,
                projection: [
                    [p[0], p[1], p[2], p[3]],
                    [p[4], p[5], p[6], p[7]],
                    [p[8], p[9], p[10], p[11]],
                ],
            })
        }
    }

    impl CornerDetector for OpenCvCalibrator {
        fn find_corners(
            &self,
            image: &GrayImage,
            board: &BoardSpec,
        ) -> Result<Vec<[f32; 2]>, CalibrationError> {
            let mat = Self::to_mat(image)?;
            let pattern = Size::new(board.columns as i32, board.rows as i32);
            let mut corners = Vector::<Point2f>::new();
            let found = calib3d::find_chessboard_corners(
                &mat,
                pattern,
                &mut corners,
                calib3d::CALIB_CB_ADAPTIVE_THRESH | calib3d::CALIB_CB_NORMALIZE_IMAGE,
            )
            .map_err(solver_err)?;
            if !found {
                return Err(CalibrationError::ChessboardNotDetected(format!(
                    "{}x{} board",
                    board.columns, board.rows
                )));
            }

            imgproc::corner_sub_pix(
                &mat,
                &mut corners,
                Size::new(11, 11),
                Size::new(-1, -1),
                criteria(30, 0.01)?,
            )
            .map_err(solver_err)?;

            Ok(corners.iter().map(|p| [p.x, p.y]).collect())
        }
    }

    impl CalibrationSolver for OpenCvCalibrator {
        fn solve(
            &self,
            board: &BoardSpec,
            image_size: (u32, u32),
            samples: &[PairSample],
        ) -> Result<CalibrationResult, CalibrationError> {
            let size = Size::new(image_size.0 as i32, image_size.1 as i32);
            let board_points: Vector<Point3f> = board
                .object_points()
                .into_iter()
                .map(|[x, y, z]| Point3f::new(x, y, z))
                .collect();
            let points = |corners: &[[f32; 2]]| -> Vector<Point2f> {
                corners.iter().map(|&[x, y]| Point2f::new(x, y)).collect()
            };

            let mut object_points = Vector::<Vector<Point3f>>::new();
            let mut left_points = Vector::<Vector<Point2f>>::new();
            let mut right_points = Vector::<Vector<Point2f>>::new();
            for sample in samples {
                object_points.push(board_points.clone());
                left_points.push(points(&sample.left));
                right_points.push(points(&sample.right));
            }

            let term = criteria(100, 1e-5)?;
            let mut intrinsics = Vec::with_capacity(2);
            for image_points in [&left_points, &right_points] {
                let mut camera = Mat::default();
                let mut dist = Mat::default();
                let mut rvecs = Vector::<Mat>::new();
                let mut tvecs = Vector::<Mat>::new();
                let rms = calib3d::calibrate_camera(
                    &object_points,
                    image_points,
                    size,
                    &mut camera,
                    &mut dist,
                    &mut rvecs,
                    &mut tvecs,
                    0,
                    term,
                )
                .map_err(solver_err)?;
                tracing::debug!(rms, "Intrinsics solved");
                intrinsics.push((camera, dist));
            }
            let (mut right_camera, mut right_dist) = intrinsics.pop().unwrap_or_default();
            let (mut left_camera, mut left_dist) = intrinsics.pop().unwrap_or_default();

            let mut rotation = Mat::default();
            let mut translation = Mat::default();
            let mut essential = Mat::default();
            let mut fundamental = Mat::default();
            let rms_error = calib3d::stereo_calibrate(
                &object_points,
                &left_points,
                &right_points,
                &mut left_camera,
                &mut left_dist,
                &mut right_camera,
                &mut right_dist,
                size,
                &mut rotation,
                &mut translation,
                &mut essential,
                &mut fundamental,
                calib3d::CALIB_FIX_INTRINSIC,
                term,
            )
            .map_err(solver_err)?;

            let mut r1 = Mat::default();
            let mut r2 = Mat::default();
            let mut p1 = Mat::default();
            let mut p2 = Mat::default();
            let mut q = Mat::default();
            let mut roi1 = Rect::default();
            let mut roi2 = Rect::default();
            calib3d::stereo_rectify(
                &left_camera,
                &left_dist,
                &right_camera,
                &right_dist,
                size,
                &rotation,
                &translation,
                &mut r1,
                &mut r2,
                &mut p1,
                &mut p2,
                &mut q,
                calib3d::CALIB_ZERO_DISPARITY,
                0.0,
                size,
                &mut roi1,
                &mut roi2,
            )
            .map_err(solver_err)?;

            let t = Self::values(&translation, 3)?;
            tracing::info!(rms_error, pairs = samples.len(), "Stereo solve complete");

            Ok(CalibrationResult {
                image_width: image_size.0,
                image_height: image_size.1,
                rms_error,
                pair_count: samples.len(),
                created_at: chrono::Utc::now(),
                rotation: Self::mat3(&rotation)?,
                translation: [t[0], t[1], t[2]],
                left: Self::camera_model(&left_camera, &left_dist, &r1, &p1)?,
                right: Self::camera_model(&right_camera, &right_dist, &r2, &p2)?,
            })
        }
    }
}

#[cfg(feature = "opencv")]
pub use opencv_impl::OpenCvCalibrator;

/// Stand-in used when the crate is built without OpenCV; every call
/// fails with a `Solver` error.
#[cfg(not(feature = "opencv"))]
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenCvCalibrator;

#[cfg(not(feature = "opencv"))]
const NOT_ENABLED: &str = "OpenCV feature not enabled. Build with --features opencv";

#[cfg(not(feature = "opencv"))]
impl OpenCvCalibrator {
    /// Creates the calibrator.
    pub fn new() -> Self {
        Self
    }
}

#[cfg(not(feature = "opencv"))]
impl CornerDetector for OpenCvCalibrator {
    fn find_corners(
        &self,
        _image: &GrayImage,
        _board: &BoardSpec,
    ) -> Result<Vec<[f32; 2]>, CalibrationError> {
        Err(CalibrationError::Solver(NOT_ENABLED.to_string()))
    }
}

#[cfg(not(feature = "opencv"))]
impl CalibrationSolver for OpenCvCalibrator {
    fn solve(
        &self,
        _board: &BoardSpec,
        _image_size: (u32, u32),
        _samples: &[PairSample],
    ) -> Result<CalibrationResult, CalibrationError> {
        Err(CalibrationError::Solver(NOT_ENABLED.to_string()))
    }
}
