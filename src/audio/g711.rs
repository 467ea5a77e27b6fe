//! G.711 μ-law / A-law codec and 8-bit unsigned PCM conversion.

const ULAW_BIAS: i32 = 0x84;
const ULAW_CLIP: i32 = 32635;

/// Decode a single μ-law byte to a signed 16-bit linear PCM sample.
pub fn ulaw_decode_sample(u: u8) -> i16 {
    let u = !u;
    let sign = (u & 0x80) != 0;
    let exponent = (u >> 4) & 0x07;
    let mantissa = u & 0x0F;
    let mut sample = ((mantissa as i32) << 3) + ULAW_BIAS;
    sample <<= exponent as i32;
    sample -= ULAW_BIAS;
    let sample = if sign { -sample } else { sample };
    sample.clamp(i16::MIN as i32, i16::MAX as i32) as i16
}

/// Encode a signed 16-bit linear PCM sample to μ-law.
pub fn ulaw_encode_sample(sample: i16) -> u8 {
    let sign: u8 = if sample < 0 { 0x80 } else { 0x00 };
    let mut magnitude = if sample < 0 {
        -(sample as i32)
    } else {
        sample as i32
    };
    if magnitude > ULAW_CLIP {
        magnitude = ULAW_CLIP;
    }
    magnitude += ULAW_BIAS;

    let mut exponent: u8 = 7;
    for exp in 0..8u8 {
        if magnitude <= (0x84 << exp) {
            exponent = exp;
            break;
        }
    }
    let mantissa = ((magnitude >> (exponent + 3)) & 0x0F) as u8;
    let byte = sign | (exponent << 4) | mantissa;
    !byte
}

const ALAW_CLIP: i32 = 32635;

/// Decode a single A-law byte to a signed 16-bit linear PCM sample.
pub fn alaw_decode_sample(a: u8) -> i16 {
    let a = a ^ 0x55;
    let sign = (a & 0x80) != 0;
    let exponent = (a >> 4) & 0x07;
    let mantissa = a & 0x0F;

    let mut sample = ((mantissa as i32) << 4) + 8;
    if exponent != 0 {
        sample += 0x100;
        sample <<= exponent as i32 - 1;
    }
    let sample = if sign { sample } else { -sample };
    sample.clamp(i16::MIN as i32, i16::MAX as i32) as i16
}

/// Encode a signed 16-bit linear PCM sample to A-law.
pub fn alaw_encode_sample(sample: i16) -> u8 {
    let sign: u8 = if sample >= 0 { 0x80 } else { 0x00 };
    let mut magnitude = if sample < 0 {
        -(sample as i32)
    } else {
        sample as i32
    };
    if magnitude > ALAW_CLIP {
        magnitude = ALAW_CLIP;
    }

    let (exponent, mantissa) = if magnitude >= 256 {
        let mut exp: u8 = 7;
        for e in 1..8u8 {
            if magnitude < (1 << (e + 7)) {
                exp = e;
                break;
            }
        }
        let mantissa = ((magnitude >> (exp + 3)) & 0x0F) as u8;
        (exp, mantissa)
    } else {
        (0u8, (magnitude >> 4) as u8)
    };

    let byte = sign | (exponent << 4) | mantissa;
    byte ^ 0x55
}

/// Decode a μ-law byte buffer to signed 16-bit linear PCM (little-endian bytes).
pub fn ulaw_decode(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len() * 2);
    for &b in input {
        out.extend_from_slice(&ulaw_decode_sample(b).to_le_bytes());
    }
    out
}

/// Encode signed 16-bit linear PCM (little-endian bytes) to μ-law.
pub fn ulaw_encode(pcm: &[u8]) -> Vec<u8> {
    pcm.chunks_exact(2)
        .map(|c| ulaw_encode_sample(i16::from_le_bytes([c[0], c[1]])))
        .collect()
}

/// Decode an A-law byte buffer to signed 16-bit linear PCM (little-endian bytes).
pub fn alaw_decode(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len() * 2);
    for &b in input {
        out.extend_from_slice(&alaw_decode_sample(b).to_le_bytes());
    }
    out
}

/// Encode signed 16-bit linear PCM (little-endian bytes) to A-law.
pub fn alaw_encode(pcm: &[u8]) -> Vec<u8> {
    pcm.chunks_exact(2)
        .map(|c| alaw_encode_sample(i16::from_le_bytes([c[0], c[1]])))
        .collect()
}

/// Convert 8-bit unsigned PCM (center 128) to signed 16-bit linear PCM.
pub fn u8_to_s16(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len() * 2);
    for &b in input {
        let sample = ((b as i32 - 128) * 256) as i16;
        out.extend_from_slice(&sample.to_le_bytes());
    }
    out
}

/// Convert signed 16-bit linear PCM (little-endian bytes) to 8-bit unsigned PCM.
pub fn s16_to_u8(pcm: &[u8]) -> Vec<u8> {
    pcm.chunks_exact(2)
        .map(|c| {
            let sample = i16::from_le_bytes([c[0], c[1]]);
            ((sample as i32 / 256) + 128).clamp(0, 255) as u8
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ulaw_roundtrip_within_quantization_bound() {
        for sample in [-30000i16, -1000, -1, 0, 1, 1000, 30000] {
            let encoded = ulaw_encode_sample(sample);
            let decoded = ulaw_decode_sample(encoded);
            let error = (decoded as i32 - sample as i32).abs();
            // G.711 is a logarithmic codec; error scales with magnitude.
            assert!(error <= (sample as i32).abs() / 30 + 32, "sample={sample} decoded={decoded} error={error}");
        }
    }

    #[test]
    fn alaw_roundtrip_within_quantization_bound() {
        for sample in [-30000i16, -1000, -1, 0, 1, 1000, 30000] {
            let encoded = alaw_encode_sample(sample);
            let decoded = alaw_decode_sample(encoded);
            let error = (decoded as i32 - sample as i32).abs();
            assert!(error <= (sample as i32).abs() / 30 + 32, "sample={sample} decoded={decoded} error={error}");
        }
    }

    #[test]
    fn ulaw_silence_roundtrips_exactly() {
        assert_eq!(ulaw_decode_sample(ulaw_encode_sample(0)), 0);
    }

    #[test]
    fn u8_s16_roundtrip_center() {
        let pcm16 = u8_to_s16(&[128]);
        assert_eq!(i16::from_le_bytes([pcm16[0], pcm16[1]]), 0);
        let back = s16_to_u8(&pcm16);
        assert_eq!(back, vec![128]);
    }

    #[test]
    fn ulaw_buffer_roundtrip_length() {
        let pcm: Vec<u8> = (0..64i16).flat_map(|s| (s * 100).to_le_bytes()).collect();
        let encoded = ulaw_encode(&pcm);
        assert_eq!(encoded.len(), pcm.len() / 2);
        let decoded = ulaw_decode(&encoded);
        assert_eq!(decoded.len(), pcm.len());
    }
}
