//! Depth map computation from rectified stereo pairs.

use super::colormap::apply_jet;
use super::matcher::{
    BlockMatcher, DepthError, DisparityMap, MatcherConfig, PreFilterType, StereoMatcher,
};
use super::params::MatcherParameters;
use crate::capture::StereoPair;
use image::{GrayImage, RgbImage};
use std::time::{Duration, Instant};

/// Pre-filter used at every call site.
pub const PRE_FILTER_TYPE: PreFilterType = PreFilterType::NormalizedResponse;

/// Result of one depth computation.
#[derive(Debug, Clone)]
pub struct DepthOutput {
    /// Jet-colored visualization of `normalized`.
    pub color: RgbImage,
    /// Disparity min-max scaled to 0..=255.
    pub normalized: GrayImage,
    /// Raw fixed-point disparity from the matcher.
    pub disparity: DisparityMap,
    /// Time spent in the matcher.
    pub elapsed: Duration,
}

/// Configures a matcher from [`MatcherParameters`], runs it and renders
/// the result.
pub struct DepthMapEngine<M = BlockMatcher> {
    matcher: M,
    configured: Option<MatcherConfig>,
    normalized: GrayImage,
}

impl DepthMapEngine<BlockMatcher> {
    /// Creates an engine backed by the built-in block matcher.
    pub fn new() -> Self {
        Self::with_matcher(BlockMatcher::new())
    }
}

impl Default for DepthMapEngine<BlockMatcher> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: StereoMatcher> DepthMapEngine<M> {
    /// Creates an engine around a custom matcher.
    pub fn with_matcher(matcher: M) -> Self {
        Self {
            matcher,
            configured: None,
            normalized: GrayImage::new(0, 0),
        }
    }

    /// Returns the matcher.
    pub fn matcher(&self) -> &M {
        &self.matcher
    }

    /// Computes the disparity of a rectified pair.
    ///
    /// The matcher is reconfigured only when `params` differ from the
    /// previous call. Color pairs are converted to grayscale first.
    pub fn compute(
        &mut self,
        pair: &StereoPair,
        params: &MatcherParameters,
    ) -> Result<DepthOutput, DepthError> {
        let config = MatcherConfig {
            params: *params,
            pre_filter_type: PRE_FILTER_TYPE,
        };
        if self.configured != Some(config) {
            self.matcher.configure(&config)?;
            self.configured = Some(config);
            tracing::debug!(?params, "Block matcher configured");
        }

        let left = pair.left().to_gray_image();
        let right = pair.right().to_gray_image();

        let started = Instant::now();
        let disparity = self.matcher.compute(&left, &right)?;
        let elapsed = started.elapsed();

        normalize_into(&disparity, &mut self.normalized);
        let color = apply_jet(&self.normalized);

        tracing::trace!(
            elapsed_ms = elapsed.as_secs_f64() * 1000.0,
            valid = disparity.valid_count(),
            "Depth map computed"
        );

        Ok(DepthOutput {
            color,
            normalized: self.normalized.clone(),
            disparity,
            elapsed,
        })
    }
}

/// Min-max scales a disparity field into `out` over 0..=255.
///
/// A constant field maps to all zeros. `out` is resized as needed.
pub fn normalize_into(disparity: &DisparityMap, out: &mut GrayImage) {
    if out.dimensions() != (disparity.width(), disparity.height()) {
        *out = GrayImage::new(disparity.width(), disparity.height());
    }
    let Some((lo, hi)) = disparity.min_max() else {
        return;
    };
    let range = (hi as i32 - lo as i32) as f64;
    for (dst, &v) in out.iter_mut().zip(disparity.data()) {
        *dst = if range > 0.0 {
            ((v as i32 - lo as i32) as f64 * 255.0 / range).round() as u8
        } else {
            0
        };
    }
}

/// Min-max scales a disparity field into a new image.
pub fn normalize(disparity: &DisparityMap) -> GrayImage {
    let mut out = GrayImage::new(disparity.width(), disparity.height());
    normalize_into(disparity, &mut out);
    out
}

/// Blends `base` and `color` with equal weight.
pub fn overlay(base: &RgbImage, color: &RgbImage) -> Result<RgbImage, DepthError> {
    if base.dimensions() != color.dimensions() {
        return Err(DepthError::SizeMismatch {
            left: base.dimensions(),
            right: color.dimensions(),
        });
    }
    let pixels = base
        .as_raw()
        .iter()
        .zip(color.as_raw())
        .map(|(&a, &b)| ((a as u16 + b as u16 + 1) / 2) as u8)
        .collect();
    RgbImage::from_raw(base.width(), base.height(), pixels).ok_or(DepthError::SizeMismatch {
        left: base.dimensions(),
        right: color.dimensions(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::Frame;
    use image::{Luma, Rgb};

    #[test]
    fn test_normalize_spans_full_range() {
        let raw = vec![-40, 0, 40, 120, 80, -40];
        let disparity = DisparityMap::from_raw(raw.clone(), 3, 2, -40).unwrap();

        let out = normalize(&disparity);
        let values: Vec<u8> = out.as_raw().clone();
        assert_eq!(*values.iter().min().unwrap(), 0);
        assert_eq!(*values.iter().max().unwrap(), 255);

        // Ordering is preserved.
        for i in 0..raw.len() {
            for j in 0..raw.len() {
                if raw[i] < raw[j] {
                    assert!(values[i] < values[j]);
                }
            }
        }
        assert_eq!(values[1], 64); // 40/160 * 255 = 63.75
    }

    #[test]
    fn test_normalize_constant_field() {
        let disparity = DisparityMap::from_raw(vec![5; 4], 2, 2, -16).unwrap();
        assert!(normalize(&disparity).as_raw().iter().all(|&v| v == 0));
    }

    #[test]
    fn test_normalize_reuses_buffer() {
        let disparity = DisparityMap::from_raw(vec![0, 16, 32, 48], 2, 2, -16).unwrap();
        let mut out = GrayImage::new(2, 2);
        let ptr = out.as_raw().as_ptr();
        normalize_into(&disparity, &mut out);
        assert_eq!(out.as_raw().as_ptr(), ptr);
        assert_eq!(out.as_raw(), &vec![0, 85, 170, 255]);
    }

    #[test]
    fn test_overlay_is_even_blend() {
        let base = RgbImage::from_pixel(2, 2, Rgb([200, 0, 100]));
        let color = RgbImage::from_pixel(2, 2, Rgb([0, 100, 100]));
        let out = overlay(&base, &color).unwrap();
        assert_eq!(*out.get_pixel(1, 1), Rgb([100, 50, 100]));

        let small = RgbImage::new(1, 1);
        assert!(overlay(&base, &small).is_err());
    }

    #[test]
    fn test_compute_does_not_touch_parameters() {
        let left = GrayImage::from_fn(48, 24, |x, y| Luma([((x * 37 + y * 11) % 251) as u8]));
        let pair = StereoPair::new(Frame::from_gray(left.clone(), 1), Frame::from_gray(left, 1))
            .unwrap();

        let params = MatcherParameters {
            block_size: 7,
            num_disparities: 16,
            texture_threshold: 0,
            ..MatcherParameters::default()
        };
        let before = params;
        let mut engine = DepthMapEngine::new();
        let output = engine.compute(&pair, &params).unwrap();

        assert_eq!(params, before);
        assert_eq!(output.color.dimensions(), (48, 24));
        assert_eq!(output.normalized.dimensions(), (48, 24));
        assert_eq!(engine.matcher().config().unwrap().pre_filter_type, PRE_FILTER_TYPE);
    }

    #[test]
    fn test_invalid_parameters_surface_as_error() {
        let pair = StereoPair::new(Frame::blank(16, 16, 1), Frame::blank(16, 16, 1)).unwrap();
        let params = MatcherParameters {
            num_disparities: 20,
            ..MatcherParameters::default()
        };
        let mut engine = DepthMapEngine::new();
        assert!(matches!(
            engine.compute(&pair, &params),
            Err(DepthError::InvalidConfig(_))
        ));
    }
}
