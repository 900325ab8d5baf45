//! Output buffer staging.
//!
//! The board's multi-channel output scan reads one interleaved buffer, frame-major:
//! all channels for point 0, then all channels for point 1, and so on.
//!
//! ```text
//! waveforms:  ch0 = [a0, a1, a2]      ch1 = [b0, b1, b2]
//! buffer:     [a0, b0, a1, b1, a2, b2]            (scaled to raw codes)
//! index:      buffer[p * channel_count + c] = scale(waveform[c][p])
//! ```

use crate::error::{ScanError, ScanResult};
use crate::hardware::OutputRange;

/// Number of analog output channels a session drives.
pub const OUTPUT_CHANNEL_COUNT: usize = 2;

/// One output channel and the samples it plays, in engineering units.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputWaveform {
    /// Output channel number
    pub channel: u32,
    /// Samples in volts, one per point
    pub samples: Vec<f64>,
}

impl OutputWaveform {
    /// Waveform for `channel`.
    pub fn new(channel: u32, samples: Vec<f64>) -> Self {
        Self { channel, samples }
    }
}

/// Build the interleaved raw output buffer for `waveforms`, in the given order.
///
/// Fails with a validation error unless there are exactly
/// [`OUTPUT_CHANNEL_COUNT`] non-empty waveforms of equal length.
pub fn build_output_buffer(waveforms: &[OutputWaveform], range: &OutputRange) -> ScanResult<Vec<u16>> {
    if waveforms.len() != OUTPUT_CHANNEL_COUNT {
        return Err(ScanError::validation(
            "dac_waveforms",
            format!(
                "exactly {} DAC channels are required (got {})",
                OUTPUT_CHANNEL_COUNT,
                waveforms.len()
            ),
        ));
    }

    let points_per_channel = waveforms[0].samples.len();
    if points_per_channel == 0 {
        return Err(ScanError::validation(
            "dac_waveforms",
            "waveforms must contain at least one point",
        ));
    }
    if let Some(odd) = waveforms
        .iter()
        .find(|w| w.samples.len() != points_per_channel)
    {
        return Err(ScanError::validation(
            "dac_waveforms",
            format!(
                "waveforms must have equal length (channel {} has {} points, expected {})",
                odd.channel,
                odd.samples.len(),
                points_per_channel
            ),
        ));
    }

    let channel_count = waveforms.len();
    let mut buffer = vec![0u16; channel_count * points_per_channel];
    for point in 0..points_per_channel {
        for (c, waveform) in waveforms.iter().enumerate() {
            buffer[point * channel_count + c] = range.to_raw(waveform.samples[point]);
        }
    }
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(a: Vec<f64>, b: Vec<f64>) -> Vec<OutputWaveform> {
        vec![OutputWaveform::new(0, a), OutputWaveform::new(1, b)]
    }

    #[test]
    fn test_frame_major_interleave() {
        let range = OutputRange::default();
        let waveforms = pair(vec![1.0, 2.0, 3.0, 4.0], vec![-1.0, -2.0, -3.0, -4.0]);
        let buffer = build_output_buffer(&waveforms, &range).unwrap();

        let expected: Vec<u16> = [1.0, -1.0, 2.0, -2.0, 3.0, -3.0, 4.0, -4.0]
            .iter()
            .map(|v| range.to_raw(*v))
            .collect();
        assert_eq!(buffer, expected);
    }

    #[test]
    fn test_index_formula_holds() {
        let range = OutputRange::new(0.0, 5.0, 12);
        let a: Vec<f64> = (0..50).map(|i| i as f64 * 0.1).collect();
        let b: Vec<f64> = (0..50).map(|i| 5.0 - i as f64 * 0.1).collect();
        let waveforms = pair(a.clone(), b.clone());
        let buffer = build_output_buffer(&waveforms, &range).unwrap();

        assert_eq!(buffer.len(), 100);
        for p in 0..50 {
            assert_eq!(buffer[2 * p], range.to_raw(a[p]));
            assert_eq!(buffer[2 * p + 1], range.to_raw(b[p]));
        }
    }

    #[test]
    fn test_list_order_not_channel_number() {
        let range = OutputRange::default();
        let waveforms = vec![
            OutputWaveform::new(3, vec![5.0]),
            OutputWaveform::new(1, vec![-5.0]),
        ];
        let buffer = build_output_buffer(&waveforms, &range).unwrap();
        assert_eq!(buffer, vec![range.to_raw(5.0), range.to_raw(-5.0)]);
    }

    #[test]
    fn test_wrong_channel_count_rejected() {
        let range = OutputRange::default();
        let one = vec![OutputWaveform::new(0, vec![0.0])];
        let three = vec![
            OutputWaveform::new(0, vec![0.0]),
            OutputWaveform::new(1, vec![0.0]),
            OutputWaveform::new(2, vec![0.0]),
        ];
        for waveforms in [one, three] {
            let err = build_output_buffer(&waveforms, &range).unwrap_err();
            assert_eq!(err.field(), Some("dac_waveforms"));
        }
    }

    #[test]
    fn test_unequal_lengths_rejected() {
        let err = build_output_buffer(&pair(vec![0.0, 1.0], vec![0.0]), &OutputRange::default())
            .unwrap_err();
        assert!(err.to_string().contains("equal length"));
    }

    #[test]
    fn test_empty_waveforms_rejected() {
        assert!(build_output_buffer(&pair(vec![], vec![]), &OutputRange::default()).is_err());
    }
}
