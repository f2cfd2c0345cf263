//! Benchmarks for the built-in block matcher and rectification.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use image::{GrayImage, Luma};
use std::time::Duration;
use stereo_depth::{
    capture::Frame,
    depth::{BlockMatcher, MatcherConfig, MatcherParameters, StereoMatcher, PRE_FILTER_TYPE},
    CalibrationResult, RectificationAdapter, StereoPair,
};

/// Synthetic textured pair with a constant shift.
fn create_stereo_pair(width: u32, height: u32, disparity: u32) -> (GrayImage, GrayImage) {
    let texture = |x: u32, y: u32| {
        let h = x.wrapping_mul(0x9E37_79B1) ^ y.wrapping_mul(0x85EB_CA77);
        Luma([(h ^ (h >> 13)) as u8])
    };
    let left = GrayImage::from_fn(width, height, texture);
    let right = GrayImage::from_fn(width, height, |x, y| texture(x + disparity, y));
    (left, right)
}

fn benchmark_block_matching(c: &mut Criterion) {
    let mut group = c.benchmark_group("block_matching");
    group.measurement_time(Duration::from_secs(5));
    group.sample_size(20);

    let config = MatcherConfig {
        params: MatcherParameters {
            block_size: 15,
            num_disparities: 64,
            texture_threshold: 10,
            ..MatcherParameters::default()
        },
        pre_filter_type: PRE_FILTER_TYPE,
    };

    for (width, height) in [(160u32, 120u32), (320, 240), (640, 480)] {
        let (left, right) = create_stereo_pair(width, height, 12);
        let mut matcher = BlockMatcher::new();
        matcher.configure(&config).unwrap();

        group.bench_with_input(
            BenchmarkId::new("sad", format!("{}x{}", width, height)),
            &(left, right),
            |b, (l, r)| {
                b.iter(|| matcher.compute(black_box(l), black_box(r)).unwrap());
            },
        );
    }

    group.finish();
}

fn benchmark_rectification(c: &mut Criterion) {
    let adapter = RectificationAdapter::from_result(CalibrationResult::identity(640, 480)).unwrap();
    let (left, right) = create_stereo_pair(640, 480, 12);
    let pair = StereoPair::new(Frame::from_gray(left, 0), Frame::from_gray(right, 0)).unwrap();

    c.bench_function("rectify_640x480", |b| {
        b.iter(|| adapter.rectify(black_box(&pair)).unwrap());
    });
}

criterion_group!(benches, benchmark_block_matching, benchmark_rectification);
criterion_main!(benches);
