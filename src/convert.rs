//! Pixel conversion from sensor encodings to interleaved RGB.

use crate::error::ConversionError;
use crate::traits::{Frame, PixelFormat};

/// An owned 24-bit interleaved RGB image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbImage {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// `width * height * 3` bytes, row-major, R G B per pixel.
    pub data: Vec<u8>,
}

impl RgbImage {
    /// Get the RGB values of the pixel at `(x, y)`.
    ///
    /// Returns `None` when the coordinates lie outside the image.
    #[must_use]
    pub fn pixel(&self, x: u32, y: u32) -> Option<(u8, u8, u8)> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = ((y as usize) * (self.width as usize) + x as usize) * 3;
        let px = self.data.get(offset..offset + 3)?;
        Some((*px.first()?, *px.get(1)?, *px.get(2)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Channel {
    Red,
    Green,
    Blue,
}

/// Colour filter array of a Bayer format, indexed by `[y & 1][x & 1]`.
const fn cfa(format: PixelFormat) -> Option<[[Channel; 2]; 2]> {
    use Channel::{Blue, Green, Red};
    match format {
        PixelFormat::BayerRG8 => Some([[Red, Green], [Green, Blue]]),
        PixelFormat::BayerGB8 => Some([[Green, Blue], [Red, Green]]),
        PixelFormat::BayerGR8 => Some([[Green, Red], [Blue, Green]]),
        PixelFormat::BayerBG8 => Some([[Blue, Green], [Green, Red]]),
        PixelFormat::Mono8 | PixelFormat::RGB8 => None,
    }
}

/// Check that a frame holds enough bytes for its geometry.
///
/// Returns the pixel bytes trimmed to `width * height * bytes_per_pixel`.
pub fn check_frame<'a>(frame: &Frame<'a>) -> Result<&'a [u8], ConversionError> {
    let expected =
        frame.width as usize * frame.height as usize * frame.pixel_format.bytes_per_pixel();
    frame
        .data
        .get(..expected)
        .ok_or(ConversionError::BufferTooSmall {
            width: frame.width,
            height: frame.height,
            format: frame.pixel_format.name(),
            expected,
            actual: frame.data.len(),
        })
}

/// Convert a captured frame to RGB.
///
/// Bayer formats are demosaiced bilinearly: each missing channel is the mean
/// of the same-colour samples in the 3x3 neighbourhood, mirrored at the image
/// border. Mono8 is replicated into all three channels and RGB8 is copied.
pub fn to_rgb(frame: &Frame<'_>) -> Result<RgbImage, ConversionError> {
    let mut data = Vec::new();
    rgb_into(frame, &mut data)?;
    Ok(RgbImage {
        width: frame.width,
        height: frame.height,
        data,
    })
}

/// Convert a captured frame to interleaved RGB into a reusable buffer.
///
/// `out` is resized to `width * height * 3` bytes.
pub fn rgb_into(frame: &Frame<'_>, out: &mut Vec<u8>) -> Result<(), ConversionError> {
    let raw = check_frame(frame)?;
    let width = frame.width as usize;
    let height = frame.height as usize;
    out.resize(width * height * 3, 0);

    match (frame.pixel_format, cfa(frame.pixel_format)) {
        (_, Some(pattern)) => demosaic(raw, width, height, pattern, out),
        (PixelFormat::Mono8, None) => {
            for (px, &v) in out.chunks_exact_mut(3).zip(raw) {
                px.fill(v);
            }
        }
        (_, None) => out.copy_from_slice(raw),
    }
    Ok(())
}

/// Index of the neighbour before `i`, reflected at the start of the axis.
const fn before(i: usize, n: usize) -> usize {
    if i > 0 {
        i - 1
    } else if n > 1 {
        1
    } else {
        0
    }
}

/// Index of the neighbour after `i`, reflected at the end of the axis.
const fn after(i: usize, n: usize) -> usize {
    if i + 1 < n {
        i + 1
    } else {
        n.saturating_sub(2)
    }
}

// `raw` holds `width * height` samples and `out` three bytes per sample;
// every index below stays inside a row of that size.
#[allow(clippy::indexing_slicing, clippy::cast_possible_truncation)]
fn demosaic(raw: &[u8], width: usize, height: usize, pattern: [[Channel; 2]; 2], out: &mut [u8]) {
    for (y, dst) in out.chunks_exact_mut(width * 3).enumerate().take(height) {
        let mid = &raw[y * width..][..width];
        let up = &raw[before(y, height) * width..][..width];
        let down = &raw[after(y, height) * width..][..width];
        let tile = pattern[y & 1];
        let red_row = tile.contains(&Channel::Red);

        for (x, px) in dst.chunks_exact_mut(3).enumerate() {
            let (xl, xr) = (before(x, width), after(x, width));
            let c = u16::from(mid[x]);
            let across = u16::from(mid[xl]) + u16::from(mid[xr]);
            let along = u16::from(up[x]) + u16::from(down[x]);
            let diagonal = || {
                u16::from(up[xl]) + u16::from(up[xr]) + u16::from(down[xl]) + u16::from(down[xr])
            };

            let (r, g, b) = match tile[x & 1] {
                Channel::Red => (c, (across + along + 2) / 4, (diagonal() + 2) / 4),
                Channel::Blue => ((diagonal() + 2) / 4, (across + along + 2) / 4, c),
                Channel::Green if red_row => ((across + 1) / 2, c, (along + 1) / 2),
                Channel::Green => ((along + 1) / 2, c, (across + 1) / 2),
            };
            px[0] = r as u8;
            px[1] = g as u8;
            px[2] = b as u8;
        }
    }
}

/// Convert RGB values to full-range `YCbCr`.
///
/// Uses the ITU-R BT.601 coefficients in 16-bit fixed point.
#[must_use]
#[allow(clippy::many_single_char_names)]
pub fn rgb_to_ycbcr(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let (r, g, b) = (i32::from(r), i32::from(g), i32::from(b));
    let y = (19_595 * r + 38_470 * g + 7_471 * b + 32_768) >> 16;
    let cb = ((-11_056 * r - 21_712 * g + 32_768 * b + 32_768) >> 16) + 128;
    let cr = ((32_768 * r - 27_440 * g - 5_328 * b + 32_768) >> 16) + 128;
    (clamp(y), clamp(cb), clamp(cr))
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
const fn clamp(val: i32) -> u8 {
    if val < 0 {
        0
    } else if val > 255 {
        255
    } else {
        val as u8
    }
}
