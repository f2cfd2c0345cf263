//! Undistort-rectify lookup tables and bilinear remapping.

use crate::calibration::{CameraModel, Matrix3};
use crate::capture::{Frame, FrameError};

/// Per-pixel source coordinates for one camera.
#[derive(Debug, Clone, PartialEq)]
pub struct RemapTable {
    map_x: Vec<f32>,
    map_y: Vec<f32>,
    width: u32,
    height: u32,
}

fn mul3(a: &Matrix3, b: &Matrix3) -> Matrix3 {
    let mut out = [[0.0; 3]; 3];
    for (i, row) in out.iter_mut().enumerate() {
        for (j, v) in row.iter_mut().enumerate() {
            *v = (0..3).map(|k| a[i][k] * b[k][j]).sum();
        }
    }
    out
}

fn invert3(m: &Matrix3) -> Option<Matrix3> {
    let det = m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0]);
    if det.abs() < 1e-12 {
        return None;
    }
    let inv = 1.0 / det;
    Some([
        [
            (m[1][1] * m[2][2] - m[1][2] * m[2][1]) * inv,
            (m[0][2] * m[2][1] - m[0][1] * m[2][2]) * inv,
            (m[0][1] * m[1][2] - m[0][2] * m[1][1]) * inv,
        ],
        [
            (m[1][2] * m[2][0] - m[1][0] * m[2][2]) * inv,
            (m[0][0] * m[2][2] - m[0][2] * m[2][0]) * inv,
            (m[0][2] * m[1][0] - m[0][0] * m[1][2]) * inv,
        ],
        [
            (m[1][0] * m[2][1] - m[1][1] * m[2][0]) * inv,
            (m[0][1] * m[2][0] - m[0][0] * m[2][1]) * inv,
            (m[0][0] * m[1][1] - m[0][1] * m[1][0]) * inv,
        ],
    ])
}

impl RemapTable {
    /// Builds the table mapping each rectified pixel back to the raw
    /// image: inverse of `P[:, :3] * R`, then the lens distortion model,
    /// then the camera matrix.
    ///
    /// Returns `None` if the rectified projection is singular.
    pub fn build(camera: &CameraModel, width: u32, height: u32) -> Option<Self> {
        let p = &camera.projection;
        let new_k = [
            [p[0][0], p[0][1], p[0][2]],
            [p[1][0], p[1][1], p[1][2]],
            [p[2][0], p[2][1], p[2][2]],
        ];
        let ir = invert3(&mul3(&new_k, &camera.rectification))?;

        let k = &camera.camera_matrix;
        let (fx, fy, skew, cx, cy) = (k[0][0], k[1][1], k[0][1], k[0][2], k[1][2]);
        let [k1, k2, p1, p2, k3] = camera.distortion;

        let len = width as usize * height as usize;
        let mut map_x = Vec::with_capacity(len);
        let mut map_y = Vec::with_capacity(len);

        for v in 0..height {
            let v = v as f64;
            for u in 0..width {
                let u = u as f64;
                let wx = ir[0][0] * u + ir[0][1] * v + ir[0][2];
                let wy = ir[1][0] * u + ir[1][1] * v + ir[1][2];
                let ww = ir[2][0] * u + ir[2][1] * v + ir[2][2];
                let (x, y) = if ww.abs() > f64::EPSILON {
                    (wx / ww, wy / ww)
                } else {
                    (wx, wy)
                };

                let r2 = x * x + y * y;
                let radial = 1.0 + r2 * (k1 + r2 * (k2 + r2 * k3));
                let xd = x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
                let yd = y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;

                map_x.push((fx * xd + skew * yd + cx) as f32);
                map_y.push((fy * yd + cy) as f32);
            }
        }

        Some(Self {
            map_x,
            map_y,
            width,
            height,
        })
    }

    /// Returns the output width.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Returns the output height.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Source coordinate for rectified pixel `(x, y)`.
    pub fn source(&self, x: u32, y: u32) -> (f32, f32) {
        let i = y as usize * self.width as usize + x as usize;
        (self.map_x[i], self.map_y[i])
    }

    /// Remaps `frame` through the table with bilinear sampling. Samples
    /// falling outside the source image are written as 0.
    pub fn apply(&self, frame: &Frame) -> Result<Frame, FrameError> {
        let channels = frame.channels() as usize;
        let (sw, sh) = (frame.width() as usize, frame.height() as usize);
        let src = frame.pixels();
        let mut out = vec![0u8; self.map_x.len() * channels];

        for (i, (&mx, &my)) in self.map_x.iter().zip(&self.map_y).enumerate() {
            if !(mx > -0.5 && my > -0.5 && mx < sw as f32 - 0.5 && my < sh as f32 - 0.5) {
                continue;
            }
            let x0 = (mx.floor().max(0.0) as usize).min(sw - 1);
            let y0 = (my.floor().max(0.0) as usize).min(sh - 1);
            let x1 = (x0 + 1).min(sw - 1);
            let y1 = (y0 + 1).min(sh - 1);
            let ax = (mx - x0 as f32).clamp(0.0, 1.0);
            let ay = (my - y0 as f32).clamp(0.0, 1.0);

            for c in 0..channels {
                let at = |x: usize, y: usize| src[(y * sw + x) * channels + c] as f32;
                let top = at(x0, y0) * (1.0 - ax) + at(x1, y0) * ax;
                let bottom = at(x0, y1) * (1.0 - ax) + at(x1, y1) * ax;
                out[i * channels + c] = (top * (1.0 - ay) + bottom * ay).round() as u8;
            }
        }

        Frame::new(
            out,
            self.width,
            self.height,
            frame.channels(),
            frame.sequence(),
        )
    }
}
