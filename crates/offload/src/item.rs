use frame_cap::PixelFormat;

use crate::buffer::PixelBuffer;

/// Deferred plain-text status report.
#[derive(Debug)]
pub struct PlainPost {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub body: Vec<u8>,
}

impl PlainPost {
    /// `http://host:port/path`, with a leading `/` added to the path if missing.
    pub fn url(&self) -> String {
        if self.path.starts_with('/') {
            format!("http://{}:{}{}", self.host, self.port, self.path)
        } else {
            format!("http://{}:{}/{}", self.host, self.port, self.path)
        }
    }
}

/// Deferred snapshot upload. Owns its pixels until the worker drops it.
#[derive(Debug)]
pub struct ImageSend {
    pub pixels: PixelBuffer,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub quality: u8,
    pub caption: String,
}

/// One unit of work for the send worker.
#[derive(Debug)]
pub enum TransferItem {
    PlainPost(PlainPost),
    ImageSend(ImageSend),
}

impl TransferItem {
    pub fn kind(&self) -> &'static str {
        match self {
            TransferItem::PlainPost(_) => "plain_post",
            TransferItem::ImageSend(_) => "image_send",
        }
    }

    /// Recover the pixel buffer from a rejected image item.
    pub(crate) fn into_pixels(self) -> Option<PixelBuffer> {
        match self {
            TransferItem::ImageSend(image) => Some(image.pixels),
            TransferItem::PlainPost(_) => None,
        }
    }
}
