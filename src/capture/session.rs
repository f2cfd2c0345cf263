//! Stereo camera session and its background capture loop.
//!
//! The session owns the video source. While capturing, the source is
//! moved onto a dedicated thread that publishes every frame into the
//! shared [`FrameBuffer`]; `stop()` joins that thread and takes the
//! source back.

use super::{Capture, CaptureConfig, ConfigError, Frame, FrameBuffer, VideoSource};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

/// Pause after a failed hardware read before trying again.
const READ_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Pause between warm-up attempts at open.
const WARMUP_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Errors that can occur while managing a capture session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("video device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("invalid capture configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("camera session has been released")]
    Released,
    #[error("failed to spawn capture thread: {0}")]
    ThreadSpawn(#[from] std::io::Error),
}

/// Result of [`StereoCameraSession::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A capture thread was spawned.
    Started,
    /// A capture thread was already running; nothing was spawned.
    AlreadyRunning,
}

/// Counters shared with the capture thread.
#[derive(Debug, Default)]
struct CaptureStats {
    frames_published: AtomicU64,
    read_failures: AtomicU64,
}

/// A point-in-time copy of the capture counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureCounters {
    /// Frames published by the capture loop (warm-up read excluded).
    pub frames_published: u64,
    /// Hardware reads that failed and were skipped.
    pub read_failures: u64,
}

/// Producer half: runs on the capture thread until the stop flag clears.
struct CaptureLoop<S> {
    source: S,
    buffer: Arc<FrameBuffer>,
    running: Arc<AtomicBool>,
    stats: Arc<CaptureStats>,
    back: Frame,
}

impl<S: VideoSource> CaptureLoop<S> {
    fn run(mut self) -> S {
        tracing::debug!("Capture loop started");

        // The flag is only checked here; an in-flight read always completes.
        while self.running.load(Ordering::Acquire) {
            match self.source.read_into(&mut self.back) {
                Ok(()) => {
                    let frame = std::mem::replace(&mut self.back, Frame::blank(0, 0, 1));
                    self.back = self.buffer.publish(true, frame);
                    self.stats.frames_published.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    let failures = self.stats.read_failures.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::warn!(
                        error = %e,
                        failures,
                        "Could not read frame from camera, keeping previous frame"
                    );
                    thread::sleep(READ_RETRY_DELAY);
                }
            }
        }

        tracing::debug!("Capture loop exited");
        self.source
    }
}

/// A stereo camera with a background capture thread.
///
/// Readers call [`read`](Self::read) from any thread that holds a
/// reference; they always receive their own copy of the latest frame.
pub struct StereoCameraSession<S: VideoSource + 'static> {
    config: CaptureConfig,
    buffer: Arc<FrameBuffer>,
    running: Arc<AtomicBool>,
    stats: Arc<CaptureStats>,
    /// Present while idle; moved to the worker while capturing.
    source: Option<S>,
    worker: Option<JoinHandle<S>>,
    released: bool,
}

impl<S: VideoSource + 'static> StereoCameraSession<S> {
    /// Opens the source and seeds the buffer with a synchronous warm-up read.
    ///
    /// Fails with [`SessionError::DeviceUnavailable`] if the device cannot
    /// be opened or none of the `warmup_attempts` reads succeeds.
    pub fn open(mut source: S, config: CaptureConfig) -> Result<Self, SessionError> {
        config.validate()?;
        source
            .open(&config)
            .map_err(|e| SessionError::DeviceUnavailable(e.to_string()))?;

        let mut frame = Frame::blank(config.width, config.height, 3);
        let mut last_error = None;
        for attempt in 1..=config.warmup_attempts {
            match source.read_into(&mut frame) {
                Ok(()) => {
                    last_error = None;
                    break;
                }
                Err(e) => {
                    tracing::debug!(attempt, error = %e, "Warm-up read failed");
                    last_error = Some(e);
                    if attempt < config.warmup_attempts {
                        thread::sleep(WARMUP_RETRY_DELAY);
                    }
                }
            }
        }

        if let Some(e) = last_error {
            source.close();
            return Err(SessionError::DeviceUnavailable(format!(
                "no frame after {} warm-up reads: {}",
                config.warmup_attempts, e
            )));
        }

        tracing::info!(
            source_id = config.source_id,
            width = frame.width(),
            height = frame.height(),
            "Stereo camera opened"
        );

        Ok(Self {
            config,
            buffer: Arc::new(FrameBuffer::new(true, frame)),
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(CaptureStats::default()),
            source: Some(source),
            worker: None,
            released: false,
        })
    }

    /// Spawns the capture thread unless one is already running.
    pub fn start(&mut self) -> Result<StartOutcome, SessionError> {
        if self.worker.is_some() {
            tracing::warn!("Video capturing already running");
            return Ok(StartOutcome::AlreadyRunning);
        }
        let source = self.source.take().ok_or(SessionError::Released)?;

        self.running.store(true, Ordering::Release);
        let capture_loop = CaptureLoop {
            source,
            buffer: Arc::clone(&self.buffer),
            running: Arc::clone(&self.running),
            stats: Arc::clone(&self.stats),
            back: self.buffer.snapshot().frame,
        };

        let spawned = thread::Builder::new()
            .name("stereo-capture".to_string())
            .spawn(move || capture_loop.run());

        match spawned {
            Ok(handle) => {
                self.worker = Some(handle);
                tracing::info!("Video capture started");
                Ok(StartOutcome::Started)
            }
            Err(e) => {
                // The closure owning the source was dropped with the error.
                self.running.store(false, Ordering::Release);
                self.released = true;
                Err(SessionError::ThreadSpawn(e))
            }
        }
    }

    /// Signals the capture loop to stop and waits until it has exited.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.worker.take() {
            match handle.join() {
                Ok(source) => self.source = Some(source),
                Err(_) => tracing::error!("Capture thread panicked, video source lost"),
            }
            let counters = self.counters();
            tracing::info!(
                frames = counters.frames_published,
                read_failures = counters.read_failures,
                "Video capture stopped"
            );
        }
    }

    /// Returns a copy of the latest frame and its grabbed flag.
    ///
    /// After [`release`](Self::release) this keeps returning the last
    /// snapshot taken before the device was closed.
    pub fn read(&self) -> Capture {
        self.buffer.snapshot()
    }

    /// Stops capturing if needed and closes the device. Safe to repeat.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.stop();
        if let Some(mut source) = self.source.take() {
            source.close();
        }
        self.released = true;
        tracing::info!("Stereo camera released");
    }

    /// Returns true while a capture thread is alive.
    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }

    /// Returns true once the device has been released.
    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Returns the idle source, if the session is neither capturing nor released.
    pub fn source(&self) -> Option<&S> {
        self.source.as_ref()
    }

    /// Returns the capture configuration.
    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Returns the capture counters.
    pub fn counters(&self) -> CaptureCounters {
        CaptureCounters {
            frames_published: self.stats.frames_published.load(Ordering::Relaxed),
            read_failures: self.stats.read_failures.load(Ordering::Relaxed),
        }
    }
}

impl<S: VideoSource + 'static> Drop for StereoCameraSession<S> {
    fn drop(&mut self) {
        self.release();
    }
}
