//! Stereo block matching.
//!
//! [`StereoMatcher`] is the seam for the matching algorithm. The built-in
//! [`BlockMatcher`] is a sum-of-absolute-differences matcher over
//! pre-filtered images with texture, uniqueness and speckle filtering.
//! Disparities are returned in 1/16 pixel fixed point.

use super::params::MatcherParameters;
use image::GrayImage;
use std::collections::VecDeque;
use thiserror::Error;

/// Fixed-point scale of matcher output.
pub const DISP_SCALE: i32 = 16;

/// Errors raised by the depth pipeline.
#[derive(Debug, Error)]
pub enum DepthError {
    #[error("invalid matcher configuration: {0}")]
    InvalidConfig(String),
    #[error("image size mismatch: left {left:?}, right {right:?}")]
    SizeMismatch { left: (u32, u32), right: (u32, u32) },
    #[error("matcher used before it was configured")]
    NotConfigured,
}

/// Pre-filter applied to both images before matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreFilterType {
    /// Pixel minus its local mean, clamped to the cap.
    NormalizedResponse,
    /// Horizontal Sobel response, clamped to the cap.
    XSobel,
}

/// Everything the matcher is configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatcherConfig {
    /// Matcher-ready values.
    pub params: MatcherParameters,
    /// Pre-filter applied to both images before matching.
    pub pre_filter_type: PreFilterType,
}

impl MatcherConfig {
    /// Checks the structural constraints the matcher relies on.
    pub fn validate(&self) -> Result<(), DepthError> {
        let p = &self.params;
        let odd_window = |name: &str, v: i32| {
            if (5..=255).contains(&v) && v % 2 == 1 {
                Ok(())
            } else {
                Err(DepthError::InvalidConfig(format!(
                    "{name} must be odd and within 5..=255, got {v}"
                )))
            }
        };
        odd_window("block size", p.block_size)?;
        odd_window("pre-filter size", p.pre_filter_size)?;
        if !(1..=63).contains(&p.pre_filter_cap) {
            return Err(DepthError::InvalidConfig(format!(
                "pre-filter cap must be within 1..=63, got {}",
                p.pre_filter_cap
            )));
        }
        if p.num_disparities <= 0 || p.num_disparities % DISP_SCALE != 0 {
            return Err(DepthError::InvalidConfig(format!(
                "number of disparities must be a positive multiple of 16, got {}",
                p.num_disparities
            )));
        }
        if p.texture_threshold < 0
            || p.uniqueness_ratio < 0
            || p.speckle_window_size < 0
            || p.speckle_range < 0
        {
            return Err(DepthError::InvalidConfig(
                "thresholds must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-pixel disparity in 1/16 pixel fixed point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisparityMap {
    data: Vec<i16>,
    width: u32,
    height: u32,
    invalid: i16,
}

impl DisparityMap {
    /// Wraps raw fixed-point values. `invalid` marks pixels without a match.
    pub fn from_raw(data: Vec<i16>, width: u32, height: u32, invalid: i16) -> Option<Self> {
        (data.len() == width as usize * height as usize).then_some(Self {
            data,
            width,
            height,
            invalid,
        })
    }

    /// Returns the map width.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Returns the map height.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Returns the raw values, row-major, in 1/16 pixel units.
    pub fn data(&self) -> &[i16] {
        &self.data
    }

    /// Returns the value at `(x, y)`.
    #[inline]
    pub fn get(&self, x: u32, y: u32) -> i16 {
        self.data[y as usize * self.width as usize + x as usize]
    }

    /// Value used for pixels with no reliable match.
    pub fn invalid_value(&self) -> i16 {
        self.invalid
    }

    /// Number of pixels carrying a match.
    pub fn valid_count(&self) -> usize {
        self.data.iter().filter(|&&v| v != self.invalid).count()
    }

    /// Smallest and largest value in the field, invalid pixels included.
    pub fn min_max(&self) -> Option<(i16, i16)> {
        let mut it = self.data.iter().copied();
        let first = it.next()?;
        Some(it.fold((first, first), |(lo, hi), v| (lo.min(v), hi.max(v))))
    }
}

/// A configurable stereo correspondence algorithm.
///
/// Both methods take `&mut self`; one configured instance serves one
/// caller at a time.
pub trait StereoMatcher {
    /// Applies a configuration for subsequent calls to `compute`.
    fn configure(&mut self, config: &MatcherConfig) -> Result<(), DepthError>;

    /// Computes disparities of `left` relative to `right`.
    fn compute(&mut self, left: &GrayImage, right: &GrayImage) -> Result<DisparityMap, DepthError>;
}

/// Summed-area table over a `width x height` field.
struct Integral {
    sums: Vec<u64>,
    width: usize,
    height: usize,
}

impl Integral {
    fn new(values: &[u32], width: usize, height: usize) -> Self {
        let stride = width + 1;
        let mut sums = vec![0u64; stride * (height + 1)];
        for y in 0..height {
            let mut row = 0u64;
            for x in 0..width {
                row += values[y * width + x] as u64;
                sums[(y + 1) * stride + x + 1] = sums[y * stride + x + 1] + row;
            }
        }
        Self {
            sums,
            width,
            height,
        }
    }

    /// Sum over the window of radius `r` around `(x, y)`, clipped to the field.
    /// Returns the sum and the number of covered cells.
    fn window(&self, x: usize, y: usize, r: usize) -> (u64, u64) {
        let x0 = x.saturating_sub(r);
        let y0 = y.saturating_sub(r);
        let x1 = (x + r + 1).min(self.width);
        let y1 = (y + r + 1).min(self.height);
        let stride = self.width + 1;
        let s = self.sums[y1 * stride + x1] + self.sums[y0 * stride + x0]
            - self.sums[y0 * stride + x1]
            - self.sums[y1 * stride + x0];
        (s, ((x1 - x0) * (y1 - y0)) as u64)
    }
}

/// Built-in sum-of-absolute-differences block matcher.
#[derive(Debug, Default)]
pub struct BlockMatcher {
    config: Option<MatcherConfig>,
}

impl BlockMatcher {
    /// Creates an unconfigured matcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the active configuration, if any.
    pub fn config(&self) -> Option<&MatcherConfig> {
        self.config.as_ref()
    }

    /// Maps an image into `0..=2 * cap`, centred on `cap`.
    fn pre_filter(config: &MatcherConfig, image: &GrayImage) -> Vec<u8> {
        let (w, h) = (image.width() as usize, image.height() as usize);
        let src = image.as_raw();
        let cap = config.params.pre_filter_cap;
        let clamp = |v: i32| (v.clamp(-cap, cap) + cap) as u8;

        match config.pre_filter_type {
            PreFilterType::NormalizedResponse => {
                let values: Vec<u32> = src.iter().map(|&v| v as u32).collect();
                let integral = Integral::new(&values, w, h);
                let r = (config.params.pre_filter_size / 2) as usize;
                let mut out = vec![0u8; w * h];
                for y in 0..h {
                    for x in 0..w {
                        let (sum, count) = integral.window(x, y, r);
                        let mean = ((sum + count / 2) / count) as i32;
                        out[y * w + x] = clamp(src[y * w + x] as i32 - mean);
                    }
                }
                out
            }
            PreFilterType::XSobel => {
                let at = |x: isize, y: isize| {
                    let x = x.clamp(0, w as isize - 1) as usize;
                    let y = y.clamp(0, h as isize - 1) as usize;
                    src[y * w + x] as i32
                };
                let mut out = vec![0u8; w * h];
                for y in 0..h as isize {
                    for x in 0..w as isize {
                        let gx = at(x + 1, y - 1) + 2 * at(x + 1, y) + at(x + 1, y + 1)
                            - at(x - 1, y - 1)
                            - 2 * at(x - 1, y)
                            - at(x - 1, y + 1);
                        out[y as usize * w + x as usize] = clamp(gx);
                    }
                }
                out
            }
        }
    }

    /// Adds (`sign > 0`) or removes one image row of absolute differences
    /// to the per-disparity column sums.
    #[allow(clippy::too_many_arguments)]
    fn accumulate_row(
        colsum: &mut [u32],
        left: &[u8],
        right: &[u8],
        w: usize,
        y: usize,
        min_d: i32,
        nd: usize,
        add: bool,
    ) {
        let l = &left[y * w..(y + 1) * w];
        let r = &right[y * w..(y + 1) * w];
        for k in 0..nd {
            let d = min_d + k as i32;
            let sums = &mut colsum[k * w..(k + 1) * w];
            for (x, sum) in sums.iter_mut().enumerate() {
                let xr = x as i32 - d;
                if xr < 0 || xr >= w as i32 {
                    continue;
                }
                let diff = (l[x] as i32 - r[xr as usize] as i32).unsigned_abs();
                if add {
                    *sum += diff;
                } else {
                    *sum -= diff;
                }
            }
        }
    }

    /// Picks the winning disparity from one pixel's cost curve.
    fn select(costs: &[u32], min_d: i32, uniqueness_ratio: i32) -> Option<i16> {
        let (best_k, best) = costs
            .iter()
            .copied()
            .enumerate()
            .filter(|&(_, c)| c != u32::MAX)
            .min_by_key(|&(_, c)| c)?;

        let thresh = best as u64 + best as u64 * uniqueness_ratio as u64 / 100;
        let ambiguous = costs.iter().enumerate().any(|(k, &c)| {
            c != u32::MAX && (c as u64) <= thresh && (k + 1 < best_k || k > best_k + 1)
        });
        if ambiguous {
            return None;
        }

        let mut d16 = (min_d + best_k as i32) * DISP_SCALE;
        if best_k > 0 && best_k + 1 < costs.len() {
            let (n, p) = (costs[best_k - 1], costs[best_k + 1]);
            if n != u32::MAX && p != u32::MAX {
                let denom = n as i64 + p as i64 - 2 * best as i64;
                if denom > 0 {
                    let offset = (n as i64 - p as i64) * DISP_SCALE as i64 / (2 * denom);
                    d16 += offset.clamp(-8, 8) as i32;
                }
            }
        }
        Some(d16 as i16)
    }

    /// Clears connected regions of similar disparity no larger than
    /// `max_size` pixels.
    fn filter_speckles(disp: &mut [i16], w: usize, h: usize, invalid: i16, max_size: usize, max_diff: i32) {
        let mut label = vec![0u32; w * h];
        let mut next_label = 0u32;
        let mut queue = VecDeque::new();
        let mut region = Vec::new();

        for start in 0..w * h {
            if disp[start] == invalid || label[start] != 0 {
                continue;
            }
            next_label += 1;
            label[start] = next_label;
            queue.push_back(start);
            region.clear();

            while let Some(i) = queue.pop_front() {
                region.push(i);
                let (x, y) = (i % w, i / w);
                let neighbours = [
                    (x > 0).then(|| i - 1),
                    (x + 1 < w).then(|| i + 1),
                    (y > 0).then(|| i - w),
                    (y + 1 < h).then(|| i + w),
                ];
                for j in neighbours.into_iter().flatten() {
                    if label[j] == 0
                        && disp[j] != invalid
                        && (disp[j] as i32 - disp[i] as i32).abs() <= max_diff
                    {
                        label[j] = next_label;
                        queue.push_back(j);
                    }
                }
            }

            if region.len() <= max_size {
                for &i in &region {
                    disp[i] = invalid;
                }
            }
        }
    }
}

impl StereoMatcher for BlockMatcher {
    fn configure(&mut self, config: &MatcherConfig) -> Result<(), DepthError> {
        config.validate()?;
        self.config = Some(*config);
        Ok(())
    }

    fn compute(&mut self, left: &GrayImage, right: &GrayImage) -> Result<DisparityMap, DepthError> {
        let config = self.config.ok_or(DepthError::NotConfigured)?;
        if left.dimensions() != right.dimensions() {
            return Err(DepthError::SizeMismatch {
                left: left.dimensions(),
                right: right.dimensions(),
            });
        }

        let p = config.params;
        let (w, h) = (left.width() as usize, left.height() as usize);
        let bs = p.block_size as usize;
        let half = bs / 2;
        let nd = p.num_disparities as usize;
        let min_d = p.min_disparity;
        let invalid = ((min_d - 1) * DISP_SCALE) as i16;
        let mut disp = vec![invalid; w * h];

        if w >= bs && h >= bs {
            let cap = p.pre_filter_cap;
            let lpre = Self::pre_filter(&config, left);
            let rpre = Self::pre_filter(&config, right);

            let texture: Vec<u32> = lpre
                .iter()
                .map(|&v| (v as i32 - cap).unsigned_abs())
                .collect();
            let texture = Integral::new(&texture, w, h);

            let mut colsum = vec![0u32; nd * w];
            let mut rowcost = vec![u32::MAX; nd * w];

            for y in 0..h {
                Self::accumulate_row(&mut colsum, &lpre, &rpre, w, y, min_d, nd, true);
                if y >= bs {
                    Self::accumulate_row(&mut colsum, &lpre, &rpre, w, y - bs, min_d, nd, false);
                }
                if y + 1 < bs {
                    continue;
                }
                let yc = y - half;

                for k in 0..nd {
                    let d = min_d + k as i32;
                    let sums = &colsum[k * w..(k + 1) * w];
                    let mut run: u32 = sums[..bs].iter().sum();
                    for x in half..w - half {
                        if x > half {
                            run = run + sums[x + half] - sums[x - half - 1];
                        }
                        let lo = x as i32 - half as i32 - d;
                        let hi = x as i32 + half as i32 - d;
                        rowcost[x * nd + k] = if lo >= 0 && hi < w as i32 {
                            run
                        } else {
                            u32::MAX
                        };
                    }
                }

                for x in half..w - half {
                    let (tex, _) = texture.window(x, yc, half);
                    if tex < p.texture_threshold as u64 {
                        continue;
                    }
                    if let Some(d16) =
                        Self::select(&rowcost[x * nd..(x + 1) * nd], min_d, p.uniqueness_ratio)
                    {
                        disp[yc * w + x] = d16;
                    }
                }
            }

            if p.speckle_window_size > 0 {
                Self::filter_speckles(
                    &mut disp,
                    w,
                    h,
                    invalid,
                    p.speckle_window_size as usize,
                    p.speckle_range,
                );
            }
        }

        tracing::trace!(width = w, height = h, "Block matching complete");
        Ok(DisparityMap {
            data: disp,
            width: w as u32,
            height: h as u32,
            invalid,
        })
    }
}
