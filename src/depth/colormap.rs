//! False-color rendering of normalized disparity.

use image::{GrayImage, Rgb, RgbImage};

/// Jet palette entry for an 8-bit intensity: dark blue through cyan,
/// yellow and red to dark red.
pub fn jet(value: u8) -> Rgb<u8> {
    let t = value as f32 / 255.0;
    let channel = |centre: f32| {
        let v = (1.5 - (4.0 * t - centre).abs()).clamp(0.0, 1.0);
        (v * 255.0).round() as u8
    };
    Rgb([channel(3.0), channel(2.0), channel(1.0)])
}

/// Colors every pixel of `gray` through the jet palette.
pub fn apply_jet(gray: &GrayImage) -> RgbImage {
    let lut: Vec<Rgb<u8>> = (0..=255u8).map(jet).collect();
    RgbImage::from_fn(gray.width(), gray.height(), |x, y| {
        lut[gray.get_pixel(x, y)[0] as usize]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jet_endpoints() {
        assert_eq!(jet(0), Rgb([0, 0, 128]));
        assert_eq!(jet(255), Rgb([128, 0, 0]));
        // Midpoint is green-dominant.
        let Rgb([r, g, b]) = jet(128);
        assert!(g == 255 && r > 100 && b > 100);
    }

    #[test]
    fn test_apply_jet_shape() {
        let gray = GrayImage::from_fn(4, 2, |x, _| image::Luma([(x * 60) as u8]));
        let color = apply_jet(&gray);
        assert_eq!(color.dimensions(), (4, 2));
        assert_eq!(*color.get_pixel(0, 1), jet(0));
        assert_eq!(*color.get_pixel(3, 0), jet(180));
    }
}
