//! Stateless linear-interpolation resampling between the rates this daemon
//! carries audio at: 8, 16, 24 and 48 kHz.
//!
//! Deliberately not a sinc/windowed resampler: each call is frame-boundary
//! aligned and must not carry a filter tail across calls, so there is no
//! state to own between invocations.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResampleError {
    #[error("pcm buffer length {0} is not a multiple of the sample size (2 bytes)")]
    UnalignedBuffer(usize),
    #[error("unsupported sample rate: {0}")]
    UnsupportedRate(u32),
}

/// Resample signed 16-bit linear PCM (little-endian) from `from_rate` to `to_rate`.
///
/// `from_rate == to_rate` returns the input unchanged.
pub fn resample(pcm: &[u8], from_rate: u32, to_rate: u32) -> Result<Vec<u8>, ResampleError> {
    if pcm.len() % 2 != 0 {
        return Err(ResampleError::UnalignedBuffer(pcm.len()));
    }
    if from_rate == to_rate {
        return Ok(pcm.to_vec());
    }
    for rate in [from_rate, to_rate] {
        if !matches!(rate, 8000 | 16000 | 24000 | 48000) {
            return Err(ResampleError::UnsupportedRate(rate));
        }
    }

    let samples: Vec<i16> = pcm
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect();

    let resampled = resample_samples(&samples, from_rate, to_rate);

    let mut out = Vec::with_capacity(resampled.len() * 2);
    for s in resampled {
        out.extend_from_slice(&s.to_le_bytes());
    }
    Ok(out)
}

fn resample_samples(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if samples.is_empty() {
        return Vec::new();
    }
    if samples.len() == 1 {
        return vec![samples[0]];
    }

    let ratio = to_rate as f64 / from_rate as f64;
    let out_len = ((samples.len() as f64) * ratio).round() as usize;
    let mut out = Vec::with_capacity(out_len);

    let last_index = (samples.len() - 1) as f64;
    for i in 0..out_len {
        let src_pos = (i as f64 / ratio).min(last_index);
        let idx0 = src_pos.floor() as usize;
        let idx1 = (idx0 + 1).min(samples.len() - 1);
        let frac = src_pos - idx0 as f64;

        let s0 = samples[idx0] as f64;
        let s1 = samples[idx1] as f64;
        let interpolated = s0 + (s1 - s0) * frac;
        out.push(interpolated.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples_to_pcm(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn same_rate_is_identity() {
        let pcm = samples_to_pcm(&[1, 2, 3, -4]);
        assert_eq!(resample(&pcm, 16000, 16000).unwrap(), pcm);
    }

    #[test]
    fn upsample_then_downsample_stays_close() {
        let original: Vec<i16> = (0..160).map(|i| ((i as f64 * 0.2).sin() * 8000.0) as i16).collect();
        let pcm = samples_to_pcm(&original);

        let up = resample(&pcm, 16000, 24000).unwrap();
        let back = resample(&up, 24000, 16000).unwrap();

        let back_samples: Vec<i16> = back
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();

        assert_eq!(back_samples.len(), original.len());
        for (a, b) in original.iter().zip(back_samples.iter()) {
            assert!((*a as i32 - *b as i32).abs() < 400, "a={a} b={b}");
        }
    }

    #[test]
    fn repeated_conversion_does_not_grow_error() {
        let original: Vec<i16> = (0..320).map(|i| ((i as f64 * 0.1).sin() * 10000.0) as i16).collect();
        let mut pcm = samples_to_pcm(&original);

        for _ in 0..5 {
            pcm = resample(&pcm, 16000, 24000).unwrap();
            pcm = resample(&pcm, 24000, 16000).unwrap();
        }

        let final_samples: Vec<i16> = pcm
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        for (a, b) in original.iter().zip(final_samples.iter()) {
            assert!((*a as i32 - *b as i32).abs() < 600, "a={a} b={b}");
        }
    }

    #[test]
    fn unsupported_rate_is_rejected() {
        let pcm = samples_to_pcm(&[1, 2]);
        assert!(matches!(
            resample(&pcm, 16000, 44100),
            Err(ResampleError::UnsupportedRate(44100))
        ));
    }

    #[test]
    fn unaligned_buffer_is_rejected() {
        assert!(matches!(
            resample(&[0u8; 3], 8000, 16000),
            Err(ResampleError::UnalignedBuffer(3))
        ));
    }
}
