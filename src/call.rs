//! The `Call` value (§3) — owned exclusively by the Call Orchestrator (C7).
//! Other components only ever hold a `CallId`.

use std::time::Instant;

use serde::Serialize;

use crate::audio::Codec;

/// Opaque call identifier. Never reused once a call reaches `Ended`.
pub type CallId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    Ringing,
    Active,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    Caller,
    Assistant,
    System,
}

#[derive(Debug, Clone, Serialize)]
pub struct TranscriptSegment {
    pub speaker: Speaker,
    pub text: String,
    pub r#final: bool,
    pub timestamp_ms: u64,
}

#[derive(Debug)]
pub struct Call {
    pub call_id: CallId,
    pub remote_uri: String,
    pub remote_ip: String,
    pub start_time: Instant,
    pub state: CallState,
    pub negotiated_codec: Option<Codec>,
    pub negotiated_rate: Option<u32>,
    pub transcript_segments: Vec<TranscriptSegment>,
}

impl Call {
    pub fn new(call_id: CallId, remote_uri: String, remote_ip: String) -> Self {
        Self {
            call_id,
            remote_uri,
            remote_ip,
            start_time: Instant::now(),
            state: CallState::Ringing,
            negotiated_codec: None,
            negotiated_rate: None,
            transcript_segments: Vec::new(),
        }
    }

    /// Append a final transcript segment, or overwrite the trailing
    /// non-final segment for the same speaker (§3: "partial updates
    /// overwrite the last non-final segment for that speaker").
    pub fn apply_transcript(&mut self, segment: TranscriptSegment) {
        if !segment.r#final {
            if let Some(last) = self.transcript_segments.last_mut() {
                if last.speaker == segment.speaker && !last.r#final {
                    *last = segment;
                    return;
                }
            }
            self.transcript_segments.push(segment);
            return;
        }

        if let Some(last) = self.transcript_segments.last_mut() {
            if last.speaker == segment.speaker && !last.r#final {
                *last = segment;
                return;
            }
        }
        self.transcript_segments.push(segment);
    }
}
