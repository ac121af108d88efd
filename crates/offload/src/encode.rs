use frame_cap::{PixelFormat, rgb565};
use image::{ExtendedColorType, ImageEncoder, codecs::jpeg::JpegEncoder};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("expected {expected} bytes of {format} pixels, got {actual}")]
    Size {
        format: PixelFormat,
        expected: usize,
        actual: usize,
    },
    #[error("JPEG encode failed: {0}")]
    Jpeg(#[from] image::ImageError),
}

/// Compress raw pixels to JPEG. RGB565 is expanded to RGB888 first.
pub fn encode_jpeg(
    pixels: &[u8],
    width: u32,
    height: u32,
    format: PixelFormat,
    quality: u8,
) -> Result<Vec<u8>, EncodeError> {
    match format.frame_len(width, height) {
        Some(expected) if expected == pixels.len() => {}
        expected => {
            return Err(EncodeError::Size {
                format,
                expected: expected.unwrap_or(usize::MAX),
                actual: pixels.len(),
            });
        }
    }

    let expanded;
    let (data, color) = match format {
        PixelFormat::Rgb565 => {
            expanded = rgb565::to_rgb888(pixels);
            (expanded.as_slice(), ExtendedColorType::Rgb8)
        }
        PixelFormat::Rgb888 => (pixels, ExtendedColorType::Rgb8),
        PixelFormat::Gray8 => (pixels, ExtendedColorType::L8),
    };

    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
        .write_image(data, width, height, color)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_rgb565_frame() {
        let pixels = vec![0x1f; 8 * 8 * 2];
        let jpeg = encode_jpeg(&pixels, 8, 8, PixelFormat::Rgb565, 80).unwrap();
        assert_eq!(&jpeg[..2], &[0xff, 0xd8]);
    }

    #[test]
    fn rejects_length_mismatch() {
        let err = encode_jpeg(&[0; 10], 8, 8, PixelFormat::Gray8, 80).unwrap_err();
        assert!(matches!(
            err,
            EncodeError::Size {
                expected: 64,
                actual: 10,
                ..
            }
        ));
    }
}
