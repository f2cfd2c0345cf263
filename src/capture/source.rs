//! Video source abstraction for the stereo rig.
//!
//! This module provides a trait over camera hardware so the capture
//! session can run against a real device or a synthetic stereo scene.

use super::{CaptureConfig, ConfigError, Frame};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during video source operations.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("video device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("failed to read frame: {0}")]
    CaptureReadFailure(String),
    #[error("video source not opened")]
    NotOpen,
    #[error("invalid capture configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Trait for stereo video sources.
///
/// A source delivers combined side-by-side frames. Implementations are
/// moved onto the capture thread while the session runs, hence `Send`.
pub trait VideoSource: Send {
    /// Opens and configures the device.
    fn open(&mut self, config: &CaptureConfig) -> Result<(), SourceError>;

    /// Blocks until the next frame is available and writes it into `frame`.
    ///
    /// On error the contents of `frame` are unspecified; the caller must
    /// not publish it.
    fn read_into(&mut self, frame: &mut Frame) -> Result<(), SourceError>;

    /// Checks if the source is currently open.
    fn is_open(&self) -> bool;

    /// Closes the device and releases resources.
    fn close(&mut self);
}

/// Synthetic stereo source for testing and demos.
///
/// Renders a fixed random texture into the left half and the same texture
/// shifted by `disparity` pixels into the right half, paced at the
/// configured frame rate like a real device.
#[derive(Debug)]
pub struct MockStereoSource {
    config: Option<CaptureConfig>,
    disparity: u32,
    fail_open: bool,
    fail_every: Option<u64>,
    pace: bool,
    reads: u64,
    sequence: u64,
}

impl Default for MockStereoSource {
    fn default() -> Self {
        Self {
            config: None,
            disparity: 8,
            fail_open: false,
            fail_every: None,
            pace: true,
            reads: 0,
            sequence: 0,
        }
    }
}

impl MockStereoSource {
    /// Creates a closed mock source with the default scene.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the horizontal shift between the two eyes.
    pub fn with_disparity(mut self, disparity: u32) -> Self {
        self.disparity = disparity;
        self
    }

    /// Makes `open` fail as if no device were attached.
    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Makes every `n`-th read fail; `n == 1` fails every read.
    pub fn failing_every(mut self, n: u64) -> Self {
        self.fail_every = Some(n.max(1));
        self
    }

    /// Disables frame-rate pacing so reads return immediately.
    pub fn unpaced(mut self) -> Self {
        self.pace = false;
        self
    }

    /// Total reads attempted, including failed ones.
    pub fn reads(&self) -> u64 {
        self.reads
    }

    /// Pseudo-random texture value at a scene coordinate.
    fn texture(x: u32, y: u32) -> u8 {
        let mut h = x.wrapping_mul(0x9E37_79B1) ^ y.wrapping_mul(0x85EB_CA77);
        h ^= h >> 15;
        h = h.wrapping_mul(0x2C1B_3C6D);
        h ^= h >> 12;
        (h & 0xFF) as u8
    }

    fn render(&self, config: &CaptureConfig, frame: &mut Frame) {
        let eye = config.eye_width();
        let width = config.width;
        let disparity = self.disparity;
        let buf = frame.reuse(width, config.height, 3, self.sequence);
        for y in 0..config.height {
            for x in 0..width {
                let v = if x < eye {
                    Self::texture(x, y)
                } else {
                    Self::texture(x - eye + disparity, y)
                };
                let i = ((y * width + x) * 3) as usize;
                buf[i] = v;
                buf[i + 1] = v / 2 + 64;
                buf[i + 2] = 255 - v;
            }
        }
    }
}

impl VideoSource for MockStereoSource {
    fn open(&mut self, config: &CaptureConfig) -> Result<(), SourceError> {
        config.validate()?;
        if self.fail_open {
            return Err(SourceError::DeviceUnavailable(format!(
                "no device at index {}",
                config.source_id
            )));
        }
        self.config = Some(config.clone());
        self.sequence = 0;
        tracing::info!(
            source_id = config.source_id,
            width = config.width,
            height = config.height,
            "MockStereoSource opened"
        );
        Ok(())
    }

    fn read_into(&mut self, frame: &mut Frame) -> Result<(), SourceError> {
        let config = self.config.clone().ok_or(SourceError::NotOpen)?;
        if self.pace {
            std::thread::sleep(Duration::from_secs(1) / config.fps);
        }
        self.reads += 1;

        if let Some(n) = self.fail_every {
            if self.reads % n == 0 {
                return Err(SourceError::CaptureReadFailure(format!(
                    "simulated failure on read {}",
                    self.reads
                )));
            }
        }

        self.sequence += 1;
        self.render(&config, frame);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.config.is_some()
    }

    fn close(&mut self) {
        if self.config.take().is_some() {
            tracing::info!("MockStereoSource closed");
        }
    }
}

#[cfg(feature = "camera")]
mod native {
    use super::*;
    use nokhwa::pixel_format::RgbFormat;
    use nokhwa::utils::{
        CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType, Resolution,
    };
    use nokhwa::Camera as NokhwaCamera;
    use std::sync::mpsc::{self, Receiver, Sender};
    use std::thread::{self, JoinHandle};

    enum Request {
        Frame,
        Stop,
    }

    /// Decoded RGB frame as width, height and packed bytes.
    type Decoded = (u32, u32, Vec<u8>);

    /// Channels to the thread that owns the device. `nokhwa::Camera` is
    /// not `Send`, so it is created, read and dropped on that thread only.
    struct Device {
        requests: Sender<Request>,
        frames: Receiver<Result<Decoded, String>>,
        handle: JoinHandle<()>,
    }

    /// Stereo source backed by a platform camera through `nokhwa`.
    pub struct NokhwaSource {
        device: Option<Device>,
        sequence: u64,
    }

    impl NokhwaSource {
        /// Creates a closed source; the device is opened by [`VideoSource::open`].
        pub fn new() -> Self {
            Self {
                device: None,
                sequence: 0,
            }
        }
    }

    impl Default for NokhwaSource {
        fn default() -> Self {
            Self::new()
        }
    }

    fn open_camera(config: &CaptureConfig) -> Result<NokhwaCamera, String> {
        let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(
            CameraFormat::new(
                Resolution::new(config.width, config.height),
                FrameFormat::MJPEG,
                config.fps,
            ),
        ));
        let mut camera = NokhwaCamera::new(CameraIndex::Index(config.source_id), requested)
            .map_err(|e| e.to_string())?;
        camera.open_stream().map_err(|e| e.to_string())?;

        let resolution = camera.resolution();
        if resolution.width() != config.width || resolution.height() != config.height {
            tracing::warn!(
                requested_width = config.width,
                requested_height = config.height,
                actual_width = resolution.width(),
                actual_height = resolution.height(),
                "Camera negotiated a different resolution"
            );
        }
        tracing::info!(name = %camera.info().human_name(), "Camera opened");
        Ok(camera)
    }

    fn serve(
        mut camera: NokhwaCamera,
        requests: Receiver<Request>,
        frames: Sender<Result<Decoded, String>>,
    ) {
        while let Ok(Request::Frame) = requests.recv() {
            let image = camera
                .frame()
                .and_then(|buffer| buffer.decode_image::<RgbFormat>())
                .map(|image| (image.width(), image.height(), image.into_raw()))
                .map_err(|e| e.to_string());
            if frames.send(image).is_err() {
                break;
            }
        }
        if let Err(e) = camera.stop_stream() {
            tracing::warn!(error = %e, "Failed to stop camera stream");
        }
        tracing::info!("Camera closed");
    }

    impl VideoSource for NokhwaSource {
        fn open(&mut self, config: &CaptureConfig) -> Result<(), SourceError> {
            config.validate()?;
            self.close();

            let (request_tx, request_rx) = mpsc::channel();
            let (frame_tx, frame_rx) = mpsc::channel();
            let (ready_tx, ready_rx) = mpsc::channel();
            let device_config = config.clone();

            let handle = thread::Builder::new()
                .name("camera-device".to_string())
                .spawn(move || match open_camera(&device_config) {
                    Ok(camera) => {
                        let _ = ready_tx.send(Ok(()));
                        serve(camera, request_rx, frame_tx);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                })
                .map_err(|e| SourceError::DeviceUnavailable(e.to_string()))?;

            let ready = ready_rx
                .recv()
                .unwrap_or_else(|_| Err("camera thread exited during open".to_string()));
            if let Err(e) = ready {
                let _ = handle.join();
                return Err(SourceError::DeviceUnavailable(e));
            }

            self.device = Some(Device {
                requests: request_tx,
                frames: frame_rx,
                handle,
            });
            self.sequence = 0;
            Ok(())
        }

        fn read_into(&mut self, frame: &mut Frame) -> Result<(), SourceError> {
            let device = self.device.as_ref().ok_or(SourceError::NotOpen)?;
            let lost = || SourceError::CaptureReadFailure("camera thread stopped".to_string());
            device.requests.send(Request::Frame).map_err(|_| lost())?;
            let (width, height, pixels) = device
                .frames
                .recv()
                .map_err(|_| lost())?
                .map_err(SourceError::CaptureReadFailure)?;

            self.sequence += 1;
            let target = frame.reuse(width, height, 3, self.sequence);
            if target.len() != pixels.len() {
                return Err(SourceError::CaptureReadFailure(format!(
                    "decoded {} bytes for {}x{} RGB",
                    pixels.len(),
                    width,
                    height
                )));
            }
            target.copy_from_slice(&pixels);
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.device.is_some()
        }

        fn close(&mut self) {
            if let Some(device) = self.device.take() {
                let _ = device.requests.send(Request::Stop);
                if device.handle.join().is_err() {
                    tracing::warn!("Camera thread panicked");
                }
            }
        }
    }
}

#[cfg(feature = "camera")]
pub use native::NokhwaSource;

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> CaptureConfig {
        CaptureConfig {
            width: 64,
            height: 16,
            fps: 120,
            ..Default::default()
        }
    }

    #[test]
    fn test_mock_source_lifecycle() {
        let mut source = MockStereoSource::new().unpaced();
        assert!(!source.is_open());

        source.open(&small_config()).unwrap();
        assert!(source.is_open());

        let mut frame = Frame::blank(1, 1, 1);
        source.read_into(&mut frame).unwrap();
        assert_eq!(frame.width(), 64);
        assert_eq!(frame.channels(), 3);
        assert_eq!(frame.sequence(), 1);

        source.read_into(&mut frame).unwrap();
        assert_eq!(frame.sequence(), 2);

        source.close();
        assert!(!source.is_open());
    }

    #[test]
    fn test_read_without_open() {
        let mut source = MockStereoSource::new();
        let mut frame = Frame::blank(1, 1, 1);
        assert!(matches!(
            source.read_into(&mut frame),
            Err(SourceError::NotOpen)
        ));
    }

    #[test]
    fn test_right_eye_is_shifted_left_eye() {
        let mut source = MockStereoSource::new().unpaced().with_disparity(5);
        source.open(&small_config()).unwrap();
        let mut frame = Frame::blank(1, 1, 1);
        source.read_into(&mut frame).unwrap();

        let pair = frame.split_side_by_side().unwrap();
        let (left, right) = (pair.left(), pair.right());
        let row = 3usize;
        for x in 0..20usize {
            let r = (row * 32 + x) * 3;
            let l = (row * 32 + x + 5) * 3;
            assert_eq!(right.pixels()[r], left.pixels()[l]);
        }
    }

    #[test]
    fn test_failure_injection() {
        let mut source = MockStereoSource::new().unpaced().failing_every(2);
        source.open(&small_config()).unwrap();
        let mut frame = Frame::blank(1, 1, 1);

        assert!(source.read_into(&mut frame).is_ok());
        assert!(matches!(
            source.read_into(&mut frame),
            Err(SourceError::CaptureReadFailure(_))
        ));
        assert!(source.read_into(&mut frame).is_ok());
        assert_eq!(source.reads(), 3);
    }

    #[test]
    fn test_failing_open() {
        let mut source = MockStereoSource::new().failing_open();
        assert!(matches!(
            source.open(&small_config()),
            Err(SourceError::DeviceUnavailable(_))
        ));
        assert!(!source.is_open());
    }

    #[cfg(feature = "camera")]
    #[test]
    fn test_nokhwa_source_moves_to_capture_thread() {
        fn assert_send<T: Send>() {}
        assert_send::<NokhwaSource>();

        let mut source = NokhwaSource::new();
        assert!(!source.is_open());
        let mut frame = Frame::blank(2, 2, 3);
        assert!(matches!(
            source.read_into(&mut frame),
            Err(SourceError::NotOpen)
        ));
        source.close();
    }
}
