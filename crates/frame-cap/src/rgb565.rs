//! RGB565 helpers shared by the snapshot path, the JPEG encoder and the
//! preview server. Pixels are stored little-endian.

use crate::types::PixelFormat;

#[inline]
fn unpack(lo: u8, hi: u8) -> [u8; 3] {
    let px = u16::from_le_bytes([lo, hi]);
    let r = ((px >> 11) & 0x1f) as u8;
    let g = ((px >> 5) & 0x3f) as u8;
    let b = (px & 0x1f) as u8;
    [(r << 3) | (r >> 2), (g << 2) | (g >> 4), (b << 3) | (b >> 2)]
}

#[inline]
fn pack(r: u8, g: u8, b: u8) -> [u8; 2] {
    let px = ((r as u16 & 0xf8) << 8) | ((g as u16 & 0xfc) << 3) | (b as u16 >> 3);
    px.to_le_bytes()
}

/// Expand RGB565 pixels into packed RGB888.
pub fn to_rgb888(src: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(src.len() / 2 * 3);
    for px in src.chunks_exact(2) {
        out.extend_from_slice(&unpack(px[0], px[1]));
    }
    out
}

/// Pack RGB888 pixels into RGB565.
pub fn from_rgb888(src: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(src.len() / 3 * 2);
    for px in src.chunks_exact(3) {
        out.extend_from_slice(&pack(px[0], px[1], px[2]));
    }
    out
}

/// Nearest-neighbour 2x downscale, keeping the top-left pixel of each 2x2 block.
///
/// Writes `(width / 2) * (height / 2)` pixels into `dst` and returns the new
/// dimensions, or `None` when the source is smaller than 2x2 or either buffer
/// has the wrong length.
pub fn downscale_half_into(
    src: &[u8],
    width: u32,
    height: u32,
    dst: &mut [u8],
) -> Option<(u32, u32)> {
    if width < 2 || height < 2 {
        return None;
    }
    let (src_w, src_h) = (width as usize, height as usize);
    let (dst_w, dst_h) = (src_w / 2, src_h / 2);
    if Some(src.len()) != PixelFormat::Rgb565.frame_len(width, height)
        || dst.len() != half_len(width, height)
    {
        return None;
    }

    for y in 0..dst_h {
        let src_row = &src[(y * 2) * src_w * 2..];
        let dst_row = &mut dst[y * dst_w * 2..(y + 1) * dst_w * 2];
        for x in 0..dst_w {
            let s = x * 2 * 2;
            dst_row[x * 2] = src_row[s];
            dst_row[x * 2 + 1] = src_row[s + 1];
        }
    }
    Some((dst_w as u32, dst_h as u32))
}

/// Byte length of a half-downscaled RGB565 frame.
pub fn half_len(width: u32, height: u32) -> usize {
    PixelFormat::Rgb565
        .frame_len(width / 2, height / 2)
        .unwrap_or(usize::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primaries_survive_expansion() {
        let packed = from_rgb888(&[255, 0, 0, 0, 255, 0, 0, 0, 255, 255, 255, 255]);
        assert_eq!(
            to_rgb888(&packed),
            vec![255, 0, 0, 0, 255, 0, 0, 0, 255, 255, 255, 255]
        );
    }

    #[test]
    fn downscale_keeps_top_left_of_each_block() {
        // 4x2 frame, pixel value = column index in the low byte.
        let mut src = Vec::new();
        for _row in 0..2 {
            for col in 0..4u8 {
                src.extend_from_slice(&[col, 0]);
            }
        }
        let mut dst = vec![0u8; half_len(4, 2)];
        assert_eq!(downscale_half_into(&src, 4, 2, &mut dst), Some((2, 1)));
        assert_eq!(dst, vec![0, 0, 2, 0]);
    }

    #[test]
    fn downscale_rejects_tiny_or_mismatched_input() {
        let mut dst = vec![0u8; 2];
        assert_eq!(downscale_half_into(&[0; 2], 1, 1, &mut dst), None);
        assert_eq!(downscale_half_into(&[0; 6], 2, 2, &mut dst), None);
    }
}
