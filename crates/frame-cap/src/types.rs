use std::{fmt, io, path::PathBuf};

use thiserror::Error;

/// Pixel layout of a captured frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    /// 16-bit RGB565, little-endian, the sensor's native preview format.
    Rgb565,
    /// Packed 8-bit RGB.
    Rgb888,
    /// 8-bit luma.
    Gray8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgb565 => 2,
            PixelFormat::Rgb888 => 3,
            PixelFormat::Gray8 => 1,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            PixelFormat::Rgb565 => "rgb565",
            PixelFormat::Rgb888 => "rgb888",
            PixelFormat::Gray8 => "gray8",
        }
    }

    /// Number of bytes a `width` x `height` frame occupies in this layout,
    /// or `None` when that does not fit in `usize`.
    pub fn frame_len(self, width: u32, height: u32) -> Option<usize> {
        (width as usize)
            .checked_mul(height as usize)?
            .checked_mul(self.bytes_per_pixel())
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Fixed dimensions and layout of every frame a source produces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameGeometry {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl FrameGeometry {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
        }
    }

    /// Saturates at `usize::MAX`, which no frame buffer can match.
    pub fn frame_len(&self) -> usize {
        self.format
            .frame_len(self.width, self.height)
            .unwrap_or(usize::MAX)
    }
}

/// Frame owned by the capture ring.
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub timestamp_ms: i64,
    pub sequence: u64,
}

impl Frame {
    pub fn view(&self) -> FrameView<'_> {
        FrameView {
            data: &self.data,
            width: self.width,
            height: self.height,
            format: self.format,
            timestamp_ms: self.timestamp_ms,
            sequence: self.sequence,
        }
    }
}

/// Borrowed view of a buffered frame. Only valid for the duration of a peek.
#[derive(Clone, Copy)]
pub struct FrameView<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub timestamp_ms: i64,
    pub sequence: u64,
}

impl FrameView<'_> {
    /// Copy the view into an owned frame.
    pub fn to_frame(&self) -> Frame {
        Frame {
            data: self.data.to_vec(),
            width: self.width,
            height: self.height,
            format: self.format,
            timestamp_ms: self.timestamp_ms,
            sequence: self.sequence,
        }
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open frame source {path:?}")]
    Open { path: PathBuf },
    #[error("no decodable images found in {path:?}")]
    Empty { path: PathBuf },
    #[error("frame holds {actual} bytes, expected {expected}")]
    Size { expected: usize, actual: usize },
    #[error(transparent)]
    Image(#[from] image::ImageError),
    #[error("failed to spawn capture thread: {0}")]
    Spawn(#[from] io::Error),
}
