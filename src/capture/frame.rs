//! Frame types representing captured images with metadata.

use image::{GrayImage, RgbImage};
use std::time::Instant;
use thiserror::Error;

/// Errors raised when frame buffers do not line up.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("left frame is {left_width}x{left_height}, right frame is {right_width}x{right_height}")]
    DimensionMismatch {
        left_width: u32,
        left_height: u32,
        right_width: u32,
        right_height: u32,
    },
    #[error("channel mismatch: left has {left}, right has {right}")]
    ChannelMismatch { left: u8, right: u8 },
    #[error("unsupported channel count {0} (expected 1 or 3)")]
    UnsupportedChannels(u8),
    #[error("pixel buffer holds {actual} bytes, {expected} expected")]
    BufferSize { expected: usize, actual: usize },
    #[error("combined frame width {0} cannot be split into two halves")]
    OddWidth(u32),
}

/// A single captured frame.
///
/// Pixels are stored row-major and interleaved, either one channel
/// (grayscale) or three (RGB). Once a frame has been published to the
/// shared buffer it is only ever read; readers get their own copies.
#[derive(Clone, PartialEq)]
pub struct Frame {
    pixels: Vec<u8>,
    width: u32,
    height: u32,
    channels: u8,
    timestamp: Instant,
    sequence: u64,
}

impl Frame {
    /// Creates a frame, checking that the buffer matches the dimensions.
    pub fn new(
        pixels: Vec<u8>,
        width: u32,
        height: u32,
        channels: u8,
        sequence: u64,
    ) -> Result<Self, FrameError> {
        if channels != 1 && channels != 3 {
            return Err(FrameError::UnsupportedChannels(channels));
        }
        let expected = width as usize * height as usize * channels as usize;
        if pixels.len() != expected {
            return Err(FrameError::BufferSize {
                expected,
                actual: pixels.len(),
            });
        }
        Ok(Self {
            pixels,
            width,
            height,
            channels,
            timestamp: Instant::now(),
            sequence,
        })
    }

    /// Creates a zero-filled frame.
    pub fn blank(width: u32, height: u32, channels: u8) -> Self {
        Self {
            pixels: vec![0; width as usize * height as usize * channels as usize],
            width,
            height,
            channels,
            timestamp: Instant::now(),
            sequence: 0,
        }
    }

    /// Wraps an 8-bit grayscale image.
    pub fn from_gray(image: GrayImage, sequence: u64) -> Self {
        let (width, height) = image.dimensions();
        Self {
            pixels: image.into_raw(),
            width,
            height,
            channels: 1,
            timestamp: Instant::now(),
            sequence,
        }
    }

    /// Wraps an 8-bit RGB image.
    pub fn from_rgb(image: RgbImage, sequence: u64) -> Self {
        let (width, height) = image.dimensions();
        Self {
            pixels: image.into_raw(),
            width,
            height,
            channels: 3,
            timestamp: Instant::now(),
            sequence,
        }
    }

    /// Prepares this frame to be overwritten by a source and returns the
    /// pixel buffer to fill.
    ///
    /// Used by capture backends to recycle the back buffer instead of
    /// allocating a new frame per read. The timestamp is refreshed.
    pub fn reuse(&mut self, width: u32, height: u32, channels: u8, sequence: u64) -> &mut [u8] {
        let len = width as usize * height as usize * channels as usize;
        self.pixels.resize(len, 0);
        self.width = width;
        self.height = height;
        self.channels = channels;
        self.sequence = sequence;
        self.timestamp = Instant::now();
        &mut self.pixels
    }

    /// Returns a reference to the raw pixel data.
    #[inline]
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Returns the frame width.
    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Returns the frame height.
    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Returns the number of interleaved channels.
    #[inline]
    pub fn channels(&self) -> u8 {
        self.channels
    }

    /// Returns the capture timestamp.
    #[inline]
    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }

    /// Returns the sequence number assigned by the source.
    #[inline]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Converts to a single-channel frame using BT.601 luma weights.
    pub fn to_gray(&self) -> Frame {
        if self.channels == 1 {
            return self.clone();
        }
        let pixels = self
            .pixels
            .chunks_exact(3)
            .map(|px| {
                let luma = 299 * px[0] as u32 + 587 * px[1] as u32 + 114 * px[2] as u32;
                ((luma + 500) / 1000) as u8
            })
            .collect();
        Frame {
            pixels,
            width: self.width,
            height: self.height,
            channels: 1,
            timestamp: self.timestamp,
            sequence: self.sequence,
        }
    }

    /// Copies the frame into a grayscale image, converting if needed.
    pub fn to_gray_image(&self) -> GrayImage {
        let gray = self.to_gray();
        // Dimensions are checked at construction, so this cannot fail.
        GrayImage::from_raw(gray.width, gray.height, gray.pixels)
            .unwrap_or_else(|| GrayImage::new(self.width, self.height))
    }

    /// Copies the frame into an RGB image, replicating gray channels.
    pub fn to_rgb_image(&self) -> RgbImage {
        let pixels = if self.channels == 3 {
            self.pixels.clone()
        } else {
            self.pixels.iter().flat_map(|&v| [v, v, v]).collect()
        };
        RgbImage::from_raw(self.width, self.height, pixels)
            .unwrap_or_else(|| RgbImage::new(self.width, self.height))
    }

    /// Returns the columns `[x0, x0 + width)` as a new frame.
    fn columns(&self, x0: u32, width: u32) -> Frame {
        let channels = self.channels as usize;
        let row_bytes = self.width as usize * channels;
        let start = x0 as usize * channels;
        let len = width as usize * channels;
        let mut pixels = Vec::with_capacity(len * self.height as usize);
        for row in self.pixels.chunks_exact(row_bytes) {
            pixels.extend_from_slice(&row[start..start + len]);
        }
        Frame {
            pixels,
            width,
            height: self.height,
            channels: self.channels,
            timestamp: self.timestamp,
            sequence: self.sequence,
        }
    }

    /// Splits a side-by-side combined frame into its left and right halves.
    pub fn split_side_by_side(&self) -> Result<StereoPair, FrameError> {
        if self.width % 2 != 0 {
            return Err(FrameError::OddWidth(self.width));
        }
        let half = self.width / 2;
        StereoPair::new(self.columns(0, half), self.columns(half, half))
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("channels", &self.channels)
            .field("sequence", &self.sequence)
            .field("pixel_bytes", &self.pixels.len())
            .finish()
    }
}

/// Left and right frames of equal size and channel count.
#[derive(Debug, Clone, PartialEq)]
pub struct StereoPair {
    left: Frame,
    right: Frame,
}

impl StereoPair {
    /// Pairs two frames, rejecting mismatched geometry.
    pub fn new(left: Frame, right: Frame) -> Result<Self, FrameError> {
        if left.width != right.width || left.height != right.height {
            return Err(FrameError::DimensionMismatch {
                left_width: left.width,
                left_height: left.height,
                right_width: right.width,
                right_height: right.height,
            });
        }
        if left.channels != right.channels {
            return Err(FrameError::ChannelMismatch {
                left: left.channels,
                right: right.channels,
            });
        }
        Ok(Self { left, right })
    }

    /// Returns the left frame.
    pub fn left(&self) -> &Frame {
        &self.left
    }

    /// Returns the right frame.
    pub fn right(&self) -> &Frame {
        &self.right
    }

    /// Returns the width of one frame.
    pub fn width(&self) -> u32 {
        self.left.width
    }

    /// Returns the height of one frame.
    pub fn height(&self) -> u32 {
        self.left.height
    }

    /// Converts both frames to grayscale.
    pub fn to_gray(&self) -> StereoPair {
        StereoPair {
            left: self.left.to_gray(),
            right: self.right.to_gray(),
        }
    }

    /// Splits into the left and right frames.
    pub fn into_parts(self) -> (Frame, Frame) {
        (self.left, self.right)
    }
}
