//! Captured buffer de-interleaving.

use crate::error::{DriverError, DriverErrorKind, ScanResult};

/// Split a frame-major capture buffer into one row per point.
///
/// Row `p`, column `c` is `buffer[p * channel_count + c]`, so columns keep the
/// order of the input channel list given at `init`.
pub fn assemble_result(
    buffer: &[f64],
    points_per_channel: usize,
    channel_count: usize,
) -> ScanResult<Vec<Vec<f64>>> {
    let expected = points_per_channel * channel_count;
    if buffer.len() != expected {
        return Err(DriverError::new(
            "capture",
            DriverErrorKind::Hardware,
            format!(
                "captured buffer holds {} samples, expected {} ({} points x {} channels)",
                buffer.len(),
                expected,
                points_per_channel,
                channel_count
            ),
        )
        .into());
    }

    if channel_count == 0 {
        return Ok(vec![Vec::new(); points_per_channel]);
    }

    Ok(buffer
        .chunks_exact(channel_count)
        .map(<[f64]>::to_vec)
        .collect())
}
