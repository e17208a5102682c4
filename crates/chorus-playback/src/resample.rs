//! Sample-rate conversion using rubato.
//!
//! Scheduled sources arrive at the stream's native rate and are converted to
//! the output device's rate once, at schedule time, rather than streaming
//! through the real-time callback.

use chorus_core::{Error, Result};
use rubato::{FftFixedIn, Resampler as RubatoResampler};
use tracing::trace;

/// Fixed input block size fed to the FFT resampler.
const BLOCK_FRAMES: usize = 1024;

/// Resample a whole planar buffer from `input_rate` to `output_rate`.
///
/// The output has the same channel count and covers the same span of time;
/// resampler latency is compensated by flushing with silence and trimming.
pub fn resample_planar(
    planes: &[Vec<f32>],
    input_rate: u32,
    output_rate: u32,
) -> Result<Vec<Vec<f32>>> {
    if planes.is_empty() || planes[0].is_empty() || input_rate == output_rate {
        return Ok(planes.to_vec());
    }

    let channels = planes.len();
    let input_frames = planes[0].len();
    let expected_frames =
        (input_frames as f64 * f64::from(output_rate) / f64::from(input_rate)).round() as usize;

    let mut resampler = FftFixedIn::<f32>::new(
        input_rate as usize,
        output_rate as usize,
        BLOCK_FRAMES,
        2,
        channels,
    )
    .map_err(|e| Error::Output(format!("failed to create resampler: {e}")))?;

    let delay = resampler.output_delay();
    let mut output: Vec<Vec<f32>> = vec![Vec::new(); channels];

    let mut pos = 0;
    while pos < input_frames {
        let take = BLOCK_FRAMES.min(input_frames - pos);
        let block: Vec<Vec<f32>> = planes
            .iter()
            .map(|ch| {
                let mut block = ch[pos..pos + take].to_vec();
                block.resize(BLOCK_FRAMES, 0.0);
                block
            })
            .collect();

        let processed = resampler
            .process(&block, None)
            .map_err(|e| Error::Output(format!("resample failed: {e}")))?;
        for (ch, plane) in processed.iter().enumerate() {
            output[ch].extend_from_slice(plane);
        }
        pos += take;
    }

    // Flush the resampler's internal delay line with silence until the
    // trailing edge of the signal has come out.
    while output[0].len() < delay + expected_frames {
        let silence = vec![vec![0.0f32; BLOCK_FRAMES]; channels];
        let processed = resampler
            .process(&silence, None)
            .map_err(|e| Error::Output(format!("resample flush failed: {e}")))?;
        for (ch, plane) in processed.iter().enumerate() {
            output[ch].extend_from_slice(plane);
        }
    }

    trace!(
        "resampled {input_frames} frames @{input_rate} -> {expected_frames} frames @{output_rate}"
    );

    Ok(output
        .into_iter()
        .map(|ch| ch[delay..delay + expected_frames].to_vec())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_rate_passthrough() {
        let planes = vec![vec![0.25f32; 2048], vec![-0.25f32; 2048]];
        let out = resample_planar(&planes, 48000, 48000).unwrap();
        assert_eq!(out, planes);
    }

    #[test]
    fn test_halving_rate_halves_frames() {
        let planes = vec![vec![0.1f32; 44100]];
        let out = resample_planar(&planes, 44100, 22050).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].len(), 22050);
    }

    #[test]
    fn test_upsample_preserves_duration() {
        let frames = 4410;
        let planes = vec![vec![0.0f32; frames], vec![0.0f32; frames]];
        let out = resample_planar(&planes, 44100, 48000).unwrap();
        let expected = (frames as f64 * 48000.0 / 44100.0).round() as usize;
        assert_eq!(out[0].len(), expected);
        assert_eq!(out[1].len(), expected);
    }

    #[test]
    fn test_empty_input() {
        let out = resample_planar(&[], 44100, 48000).unwrap();
        assert!(out.is_empty());
    }
}
