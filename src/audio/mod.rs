//! C1 — Audio Transcoder: pure, stateless PCM conversion functions.
//!
//! Everything here is a free function over byte buffers; no component owns
//! an `Audio*` value across calls, so there is nothing to put behind a lock.

pub mod g711;
pub mod resample;

pub use g711::{alaw_decode, alaw_encode, s16_to_u8, u8_to_s16, ulaw_decode, ulaw_encode};
pub use resample::{resample, ResampleError};

/// Wire codec negotiated at SIP answer time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Opus,
    G722,
    Pcma,
    Pcmu,
}

impl Codec {
    /// Preference order used when negotiating the SDP answer (§4.2).
    pub const PREFERENCE_ORDER: [(Codec, u32); 4] = [
        (Codec::Opus, 48000),
        (Codec::G722, 16000),
        (Codec::Pcma, 8000),
        (Codec::Pcmu, 8000),
    ];

    pub fn sdp_name(self) -> &'static str {
        match self {
            Codec::Opus => "OPUS",
            Codec::G722 => "G722",
            Codec::Pcma => "PCMA",
            Codec::Pcmu => "PCMU",
        }
    }

    pub fn from_sdp_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "OPUS" => Some(Codec::Opus),
            "G722" => Some(Codec::G722),
            "PCMA" => Some(Codec::Pcma),
            "PCMU" => Some(Codec::Pcmu),
            _ => None,
        }
    }

    /// Default clock rate for this codec (used when the SDP fmtp doesn't override it).
    pub fn default_rate(self) -> u32 {
        match self {
            Codec::Opus => 48000,
            Codec::G722 => 16000,
            Codec::Pcma | Codec::Pcmu => 8000,
        }
    }
}

/// Decode a wire payload (as delivered by the negotiated codec) to linear PCM16.
///
/// Opus is out of scope for a hand-rolled decoder here; it is accepted in the
/// preference list per §4.2 but payload (de)coding beyond G.711 is left to a
/// dedicated codec library at the RTP layer (see `sip::rtp`), which is why
/// this module only implements the G.711 family directly.
pub fn decode_to_linear(payload: &[u8], codec: Codec) -> Vec<u8> {
    match codec {
        Codec::Pcmu => ulaw_decode(payload),
        Codec::Pcma => alaw_decode(payload),
        Codec::Opus | Codec::G722 => payload.to_vec(),
    }
}

/// Encode linear PCM16 to the wire payload for the negotiated codec.
pub fn encode_from_linear(pcm: &[u8], codec: Codec) -> Vec<u8> {
    match codec {
        Codec::Pcmu => ulaw_encode(pcm),
        Codec::Pcma => alaw_encode(pcm),
        Codec::Opus | Codec::G722 => pcm.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_sdp_name_roundtrips() {
        for (codec, _) in Codec::PREFERENCE_ORDER {
            assert_eq!(Codec::from_sdp_name(codec.sdp_name()), Some(codec));
        }
    }

    #[test]
    fn preference_order_starts_with_opus() {
        assert_eq!(Codec::PREFERENCE_ORDER[0].0, Codec::Opus);
        assert_eq!(Codec::PREFERENCE_ORDER[3].0, Codec::Pcmu);
    }
}
