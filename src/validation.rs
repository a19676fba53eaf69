//! Checks on recorded configuration writes and captured frames.
//!
//! Used by tests against the simulated rig, by the V4L2 integration tests
//! against virtual cameras, and by the session's post-capture drift check.

use crate::capture::CaptureSummary;
use crate::convert::RgbImage;
use crate::error::ValidationError;
use crate::mock::COLOR_BARS;
use crate::traits::PropertyValue;

/// Tolerance for colour matching (accounts for demosaic blending).
const COLOR_TOLERANCE: u8 = 15;

/// Validates that an RGB image contains the eight vertical colour bars.
///
/// Samples the centre of each bar on the middle row.
///
/// # Errors
///
/// Returns a [`ValidationError`] if the image is narrower than eight pixels
/// or any bar differs from its expected colour by more than the tolerance.
pub fn validate_color_bars(image: &RgbImage) -> Result<(), ValidationError> {
    let bar_width = image.width / 8;
    if bar_width == 0 {
        return Err(ValidationError(format!(
            "image is {} pixels wide, colour bars need at least 8",
            image.width
        )));
    }
    let center_y = image.height / 2;

    for (bar_idx, expected) in (0u32..).zip(COLOR_BARS.iter()) {
        let sample_x = bar_idx * bar_width + bar_width / 2;
        let actual = image.pixel(sample_x, center_y).ok_or_else(|| {
            ValidationError(format!("failed to get pixel at ({sample_x}, {center_y})"))
        })?;

        if !colors_match(actual, *expected, COLOR_TOLERANCE) {
            return Err(ValidationError(format!(
                "colour bar {bar_idx} mismatch at ({sample_x}, {center_y}): \
                 expected RGB{expected:?}, got RGB{actual:?}"
            )));
        }
    }

    Ok(())
}

/// Validates that `log` names exactly the properties in `expected`, in order.
///
/// # Errors
///
/// Returns a [`ValidationError`] naming the first position where the
/// recorded write differs, or the length mismatch.
pub fn validate_write_order(
    log: &[(String, PropertyValue)],
    expected: &[&str],
) -> Result<(), ValidationError> {
    for (index, (written, wanted)) in log.iter().map(|(name, _)| name).zip(expected).enumerate() {
        if written != wanted {
            return Err(ValidationError(format!(
                "write {index} went to {written}, expected {wanted}"
            )));
        }
    }
    if log.len() != expected.len() {
        return Err(ValidationError(format!(
            "{} writes recorded, expected {}",
            log.len(),
            expected.len()
        )));
    }
    Ok(())
}

/// Checks that the two streams advanced together.
///
/// # Errors
///
/// Returns a [`ValidationError`] when the written frame counts differ by
/// more than `tolerance`.
pub fn check_stream_balance(summary: &CaptureSummary, tolerance: u64) -> Result<(), ValidationError> {
    let left = summary.left.written;
    let right = summary.right.written;
    let drift = left.abs_diff(right);
    if drift > tolerance {
        return Err(ValidationError(format!(
            "streams drifted apart: left wrote {left} frames, right wrote {right} \
             over {} cycles",
            summary.cycles
        )));
    }
    Ok(())
}

/// Checks whether two RGB colours match within a per-channel tolerance.
fn colors_match(actual: (u8, u8, u8), expected: (u8, u8, u8), tolerance: u8) -> bool {
    let (ar, ag, ab) = actual;
    let (er, eg, eb) = expected;
    ar.abs_diff(er) <= tolerance && ag.abs_diff(eg) <= tolerance && ab.abs_diff(eb) <= tolerance
}
