//! Preview, capture, depth and tuning loops.

use super::controls::{ControlEvent, ControlPanel};
use super::sink::{hstack, FrameSink};
use super::{LiveError, LoopControl, IDLE_DELAY};
use crate::calibration::{CalibrationStore, PhotoSet};
use crate::capture::{Frame, StereoCameraSession, StereoPair, VideoSource};
use crate::depth::{
    overlay, DepthMapEngine, DepthOutput, MatcherParameters, ParameterStore, StereoMatcher,
};
use crate::metrics::MetricsSnapshot;
use crate::rectify::RectificationAdapter;
use std::path::Path;
use std::time::Duration;

/// Counts reported when a loop exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopSummary {
    /// Frames that went through the full iteration.
    pub frames: u64,
    /// Frames whose processing failed and was skipped.
    pub errors: u64,
}

/// Pacing of the photo capture loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureTiming {
    /// Wait before the first photo.
    pub countdown: Duration,
    /// Wait before each photo.
    pub delay: Duration,
}

impl CaptureTiming {
    /// Builds timings from whole seconds.
    pub fn from_secs(countdown: u64, delay: u64) -> Self {
        Self {
            countdown: Duration::from_secs(countdown),
            delay: Duration::from_secs(delay),
        }
    }
}

/// Blocks until a grabbed frame newer than `last` is available, or the
/// loop should stop.
fn next_frame<S: VideoSource + 'static>(
    session: &StereoCameraSession<S>,
    control: &LoopControl,
    summary: &LoopSummary,
    last: &mut Option<u64>,
) -> Option<Frame> {
    loop {
        if control.finished(summary.frames) {
            return None;
        }
        let capture = session.read();
        if capture.grabbed && *last != Some(capture.frame.sequence()) {
            *last = Some(capture.frame.sequence());
            return Some(capture.frame);
        }
        std::thread::sleep(IDLE_DELAY);
    }
}

/// Split, rectify and match one combined frame.
fn depth_step<M: StereoMatcher>(
    frame: &Frame,
    adapter: &RectificationAdapter,
    engine: &mut DepthMapEngine<M>,
    params: &MatcherParameters,
) -> Result<(StereoPair, DepthOutput), LiveError> {
    let pair = frame.split_side_by_side()?;
    let rectified = adapter.rectify(&pair)?;
    let output = engine.compute(&rectified, params)?;
    Ok((rectified, output))
}

/// Shows the raw combined frames.
pub fn run_preview<S: VideoSource + 'static>(
    session: &mut StereoCameraSession<S>,
    sink: &mut dyn FrameSink,
    control: &LoopControl,
) -> Result<LoopSummary, LiveError> {
    session.start()?;
    tracing::info!("Preview started");

    let mut summary = LoopSummary::default();
    let mut last = None;
    while let Some(frame) = next_frame(session, control, &summary, &mut last) {
        if let Err(e) = sink.show("preview", &frame.to_rgb_image()) {
            tracing::warn!(error = %e, "Preview frame not shown");
            summary.errors += 1;
        }
        summary.frames += 1;
        control.publish(MetricsSnapshot::default().with_capture(&session.counters()));
    }

    tracing::info!(frames = summary.frames, "Preview stopped");
    Ok(summary)
}

/// Captures numbered calibration photo pairs.
///
/// Waits for the countdown, then before each pair waits `delay` and saves
/// the latest grabbed frame. Returns the number of pairs written.
pub fn capture_pictures<S: VideoSource + 'static>(
    session: &mut StereoCameraSession<S>,
    photos: &PhotoSet,
    timing: CaptureTiming,
    sink: &mut dyn FrameSink,
    control: &LoopControl,
) -> Result<u32, LiveError> {
    std::fs::create_dir_all(photos.dir())?;
    session.start()?;

    tracing::info!(
        countdown_secs = timing.countdown.as_secs(),
        count = photos.count(),
        dir = %photos.dir().display(),
        "Photo capture starting"
    );
    if !control.wait(timing.countdown) {
        return Ok(0);
    }

    let mut written = 0;
    for index in 0..photos.count() {
        if !control.wait(timing.delay) {
            break;
        }
        let capture = session.read();
        if !capture.grabbed {
            tracing::warn!(index, "No frame grabbed, photo skipped");
            continue;
        }

        let saved = capture
            .frame
            .split_side_by_side()
            .map_err(LiveError::from)
            .and_then(|pair| photos.write_pair(index, &pair).map_err(LiveError::from));
        if let Err(e) = saved {
            tracing::warn!(index, error = %e, "Photo pair not saved");
            continue;
        }
        written += 1;
        tracing::info!(index, written, "Photo pair saved");

        if let Err(e) = sink.show("capture", &capture.frame.to_rgb_image()) {
            tracing::warn!(error = %e, "Capture frame not shown");
        }
    }

    tracing::info!(written, "Photo capture finished");
    Ok(written)
}

/// Live depth with fixed parameters.
///
/// Fails before touching the session if `store` holds no calibration.
pub fn run_depth<S, M>(
    session: &mut StereoCameraSession<S>,
    store: &CalibrationStore,
    engine: &mut DepthMapEngine<M>,
    params: &MatcherParameters,
    sink: &mut dyn FrameSink,
    control: &LoopControl,
) -> Result<LoopSummary, LiveError>
where
    S: VideoSource + 'static,
    M: StereoMatcher,
{
    let adapter = RectificationAdapter::load(store.clone())?;
    session.start()?;
    tracing::info!(?params, "Depth loop started");

    let mut summary = LoopSummary::default();
    let mut last = None;
    while let Some(frame) = next_frame(session, control, &summary, &mut last) {
        let shown = depth_step(&frame, &adapter, engine, params).and_then(|(rectified, output)| {
            let blended = overlay(&rectified.left().to_rgb_image(), &output.color)?;
            sink.show("depth", &hstack(&output.color, &blended))?;
            Ok(output)
        });
        summary.frames += 1;

        match shown {
            Ok(output) => control.publish(
                MetricsSnapshot {
                    depth_frames: summary.frames - summary.errors,
                    calibration_generation: adapter.generation(),
                    ..MetricsSnapshot::default()
                }
                .with_capture(&session.counters())
                .with_depth(&output),
            ),
            Err(e) => {
                tracing::warn!(error = %e, "Depth frame skipped");
                summary.errors += 1;
            }
        }
    }

    tracing::info!(frames = summary.frames, errors = summary.errors, "Depth loop stopped");
    Ok(summary)
}

fn apply_event(
    event: ControlEvent,
    params: &mut ParameterStore,
    settings_path: &Path,
    adapter: &mut RectificationAdapter,
) {
    match event {
        ControlEvent::Set(id, value) => {
            if let Err(e) = params.set_raw(id, value) {
                tracing::warn!(error = %e, "Control change ignored");
            }
        }
        ControlEvent::Save => match params.save(settings_path) {
            Ok(()) => tracing::info!(path = %settings_path.display(), "Settings saved"),
            Err(e) => tracing::warn!(error = %e, "Settings not saved"),
        },
        ControlEvent::Load => match params.load(settings_path) {
            Ok(()) => tracing::info!(path = %settings_path.display(), "Settings loaded"),
            Err(e) => tracing::warn!(error = %e, "Settings not loaded"),
        },
        ControlEvent::ReloadCalibration => {
            if let Err(e) = adapter.reload() {
                tracing::warn!(error = %e, "Calibration reload failed, keeping current");
            }
        }
    }
}

/// Live depth with operator-adjustable parameters.
///
/// Each frame the panel is polled and its events applied, then the store
/// re-derives matcher parameters if anything changed. Shows the color map
/// as `tuner` and the rectified pair side by side as `frame`.
#[allow(clippy::too_many_arguments)]
pub fn run_tuning<S, M>(
    session: &mut StereoCameraSession<S>,
    store: &CalibrationStore,
    params: &mut ParameterStore,
    settings_path: &Path,
    panel: &mut dyn ControlPanel,
    engine: &mut DepthMapEngine<M>,
    sink: &mut dyn FrameSink,
    control: &LoopControl,
) -> Result<LoopSummary, LiveError>
where
    S: VideoSource + 'static,
    M: StereoMatcher,
{
    let mut adapter = RectificationAdapter::load(store.clone())?;
    session.start()?;
    tracing::info!(settings = %settings_path.display(), "Tuning loop started");

    let mut summary = LoopSummary::default();
    let mut refreshes = 0;
    let mut last = None;
    while let Some(frame) = next_frame(session, control, &summary, &mut last) {
        for event in panel.poll() {
            apply_event(event, params, settings_path, &mut adapter);
        }
        if params.refresh() {
            refreshes += 1;
            tracing::info!(params = ?params.matcher_parameters(), "Matcher parameters updated");
        }

        let shown = depth_step(&frame, &adapter, engine, params.matcher_parameters()).and_then(
            |(rectified, output)| {
                sink.show("tuner", &output.color)?;
                let pair = hstack(
                    &rectified.left().to_rgb_image(),
                    &rectified.right().to_rgb_image(),
                );
                sink.show("frame", &pair)?;
                Ok(output)
            },
        );
        summary.frames += 1;

        match shown {
            Ok(output) => control.publish(
                MetricsSnapshot {
                    depth_frames: summary.frames - summary.errors,
                    calibration_generation: adapter.generation(),
                    parameter_refreshes: refreshes,
                    ..MetricsSnapshot::default()
                }
                .with_capture(&session.counters())
                .with_depth(&output),
            ),
            Err(e) => {
                tracing::warn!(error = %e, "Tuning frame skipped");
                summary.errors += 1;
            }
        }
    }

    tracing::info!(frames = summary.frames, refreshes, "Tuning loop stopped");
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{CalibrationError, CalibrationResult};
    use crate::capture::{CaptureConfig, MockStereoSource};
    use crate::depth::ParameterId;
    use image::RgbImage;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    const EYE_WIDTH: u32 = 64;
    const HEIGHT: u32 = 32;

    #[derive(Default)]
    struct RecordingSink {
        shown: Vec<(String, (u32, u32))>,
    }

    impl FrameSink for RecordingSink {
        fn show(&mut self, view: &str, image: &RgbImage) -> Result<(), LiveError> {
            self.shown.push((view.to_string(), image.dimensions()));
            Ok(())
        }
    }

    impl RecordingSink {
        fn count(&self, view: &str) -> usize {
            self.shown.iter().filter(|(v, _)| v == view).count()
        }
    }

    /// Hands out one batch of events per poll.
    struct ScriptedPanel(VecDeque<Vec<ControlEvent>>);

    impl ControlPanel for ScriptedPanel {
        fn poll(&mut self) -> Vec<ControlEvent> {
            self.0.pop_front().unwrap_or_default()
        }
    }

    fn session() -> StereoCameraSession<MockStereoSource> {
        let source = MockStereoSource::new().with_disparity(4).unpaced();
        let config = CaptureConfig::with_dimensions(EYE_WIDTH * 2, HEIGHT);
        StereoCameraSession::open(source, config).unwrap()
    }

    fn calibrated_store(dir: &Path) -> CalibrationStore {
        let store = CalibrationStore::new(dir.join("calibration_result"));
        store
            .save(&CalibrationResult::identity(EYE_WIDTH, HEIGHT))
            .unwrap();
        store
    }

    fn small_params() -> MatcherParameters {
        MatcherParameters {
            block_size: 5,
            num_disparities: 16,
            texture_threshold: 0,
            ..MatcherParameters::default()
        }
    }

    fn control(limit: u64) -> LoopControl {
        LoopControl::new(Arc::new(AtomicBool::new(false))).with_limit(limit)
    }

    #[test]
    fn test_preview_shows_combined_frames() {
        let mut session = session();
        let mut sink = RecordingSink::default();
        let summary = run_preview(&mut session, &mut sink, &control(3)).unwrap();

        assert_eq!(summary.frames, 3);
        assert_eq!(sink.count("preview"), 3);
        assert_eq!(sink.shown[0].1, (EYE_WIDTH * 2, HEIGHT));
    }

    #[test]
    fn test_quit_flag_stops_loop() {
        let mut session = session();
        let mut sink = RecordingSink::default();
        let quit = Arc::new(AtomicBool::new(true));
        let summary = run_preview(&mut session, &mut sink, &LoopControl::new(quit)).unwrap();
        assert_eq!(summary.frames, 0);
    }

    #[test]
    fn test_depth_without_calibration_aborts_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session();
        let mut sink = RecordingSink::default();
        let result = run_depth(
            &mut session,
            &CalibrationStore::new(dir.path()),
            &mut DepthMapEngine::new(),
            &small_params(),
            &mut sink,
            &control(1),
        );

        assert!(matches!(
            result,
            Err(LiveError::Calibration(CalibrationError::CalibrationMissing { .. }))
        ));
        assert!(!session.is_running());
        assert!(sink.shown.is_empty());
    }

    #[test]
    fn test_depth_loop_shows_color_and_overlay() {
        let dir = tempfile::tempdir().unwrap();
        let store = calibrated_store(dir.path());
        let mut session = session();
        let mut sink = RecordingSink::default();

        let summary = run_depth(
            &mut session,
            &store,
            &mut DepthMapEngine::new(),
            &small_params(),
            &mut sink,
            &control(2),
        )
        .unwrap();

        assert_eq!(summary, LoopSummary { frames: 2, errors: 0 });
        assert_eq!(sink.count("depth"), 2);
        assert_eq!(sink.shown[0].1, (EYE_WIDTH * 2, HEIGHT));
    }

    #[test]
    fn test_depth_loop_absorbs_size_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let store = CalibrationStore::new(dir.path());
        store
            .save(&CalibrationResult::identity(EYE_WIDTH / 2, HEIGHT))
            .unwrap();
        let mut session = session();
        let mut sink = RecordingSink::default();

        let summary = run_depth(
            &mut session,
            &store,
            &mut DepthMapEngine::new(),
            &small_params(),
            &mut sink,
            &control(2),
        )
        .unwrap();
        assert_eq!(summary.errors, 2);
        assert!(sink.shown.is_empty());
    }

    #[test]
    fn test_tuning_applies_events() {
        let dir = tempfile::tempdir().unwrap();
        let store = calibrated_store(dir.path());
        let settings = dir.path().join("depth_settings.toml");
        let mut session = session();
        let mut sink = RecordingSink::default();

        let mut params = ParameterStore::default();
        params.set_raw(ParameterId::BlockSize, 5).unwrap();
        params.set_raw(ParameterId::NumDisparities, 1).unwrap();
        params.set_raw(ParameterId::TextureThreshold, 0).unwrap();

        let mut panel = ScriptedPanel(VecDeque::from(vec![
            vec![
                ControlEvent::Set(ParameterId::BlockSize, 7),
                // Out of range: logged and ignored.
                ControlEvent::Set(ParameterId::UniquenessRatio, 99),
                ControlEvent::Save,
            ],
            vec![ControlEvent::Set(ParameterId::BlockSize, 9)],
            vec![ControlEvent::Load, ControlEvent::ReloadCalibration],
        ]));

        let summary = run_tuning(
            &mut session,
            &store,
            &mut params,
            &settings,
            &mut panel,
            &mut DepthMapEngine::new(),
            &mut sink,
            &control(3),
        )
        .unwrap();

        assert_eq!(summary.frames, 3);
        assert_eq!(sink.count("tuner"), 3);
        assert_eq!(sink.count("frame"), 3);
        assert!(sink.shown.contains(&("frame".to_string(), (EYE_WIDTH * 2, HEIGHT))));

        // Save captured 7, the later 9 was undone by Load.
        assert_eq!(params.raw().get(ParameterId::BlockSize), 7);
        assert_eq!(params.raw().get(ParameterId::UniquenessRatio), 1);
        assert_eq!(params.matcher_parameters().block_size, 7);
        assert!(settings.is_file());
    }

    #[test]
    fn test_capture_pictures_writes_pairs() {
        let dir = tempfile::tempdir().unwrap();
        let photos = PhotoSet::new(dir.path().join("images"), 3);
        let mut session = session();
        let mut sink = RecordingSink::default();

        let written = capture_pictures(
            &mut session,
            &photos,
            CaptureTiming {
                countdown: Duration::ZERO,
                delay: Duration::from_millis(5),
            },
            &mut sink,
            &LoopControl::new(Arc::new(AtomicBool::new(false))),
        )
        .unwrap();

        assert_eq!(written, 3);
        for index in 0..3 {
            let (left, right) = photos.read_pair(index).unwrap();
            assert_eq!(left.dimensions(), (EYE_WIDTH, HEIGHT));
            assert_eq!(right.dimensions(), (EYE_WIDTH, HEIGHT));
        }
        assert_eq!(sink.count("capture"), 3);
    }

    #[test]
    fn test_capture_pictures_honours_quit() {
        let dir = tempfile::tempdir().unwrap();
        let photos = PhotoSet::new(dir.path().join("images"), 3);
        let mut session = session();
        let mut sink = RecordingSink::default();
        let quit = LoopControl::new(Arc::new(AtomicBool::new(true)));

        let written = capture_pictures(
            &mut session,
            &photos,
            CaptureTiming::from_secs(3, 2),
            &mut sink,
            &quit,
        )
        .unwrap();
        assert_eq!(written, 0);
        assert!(photos.dir().is_dir());
    }
}
