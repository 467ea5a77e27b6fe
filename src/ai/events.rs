//! Tagged event types for the realtime speech WebSocket wire protocol.
//!
//! The AI service emits ~30 event types distinguished by a `type` string
//! field, mapped here onto tagged enum variants instead of dispatched by
//! string. `ServerEvent::Other` is the explicit fall-through for anything
//! this daemon doesn't need to act on — it must be tolerated, not rejected.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session.updated")]
    SessionUpdated,

    #[serde(rename = "response.audio.delta")]
    AudioDelta { delta: String },

    #[serde(rename = "response.audio_transcript.delta")]
    TranscriptDelta { delta: String },

    #[serde(rename = "response.audio_transcript.done")]
    TranscriptDone { transcript: String },

    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputTranscriptDone { transcript: String },

    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,

    #[serde(rename = "response.function_call_arguments.done")]
    FunctionCallArgumentsDone {
        call_id: String,
        name: String,
        arguments: String,
    },

    #[serde(rename = "error")]
    Error { error: ErrorDetail },

    /// Any other event type. Must never cause the read loop to fail.
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(default)]
    pub code: Option<String>,
}

/// High-level events the AI Stream Client exposes to the orchestrator,
/// after dispatch from the raw `ServerEvent` wire type (§4.4).
#[derive(Debug, Clone)]
pub enum AiEvent {
    Connected,
    Audio { pcm_24khz_s16: Vec<u8> },
    Transcript { role: TranscriptRole, text: String, r#final: bool },
    Interruption,
    ToolCall { id: String, name: String, arguments_json: String },
    Error { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptRole {
    Assistant,
    Caller,
}

/// Client → server messages (§4.4 outbound contract).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },

    #[serde(rename = "session.update")]
    SessionUpdateInstructions { session: InstructionsPatch },

    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { audio: String },

    #[serde(rename = "response.create")]
    ResponseCreate,

    #[serde(rename = "response.cancel")]
    ResponseCancel,

    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: FunctionCallOutputItem },
}

/// A partial `session.update`, carrying only the instructions field — used
/// when a tool call switches product domain mid-call (§4.5) and the session
/// needs new specialist instructions without a full reconfiguration.
#[derive(Debug, Clone, Serialize)]
pub struct InstructionsPatch {
    pub instructions: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FunctionCallOutputItem {
    #[serde(rename = "type")]
    pub item_type: &'static str, // "function_call_output"
    pub call_id: String,
    pub output: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionConfig {
    pub modalities: Vec<&'static str>,
    pub instructions: String,
    pub voice: String,
    pub input_audio_format: &'static str,
    pub output_audio_format: &'static str,
    pub input_audio_transcription: TranscriptionConfig,
    pub turn_detection: ServerVadConfig,
    pub tools: Vec<Value>,
    pub tool_choice: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct TranscriptionConfig {
    pub model: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerVadConfig {
    #[serde(rename = "type")]
    pub vad_type: &'static str,
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
    pub create_response: bool,
}

impl Default for ServerVadConfig {
    fn default() -> Self {
        Self {
            vad_type: "server_vad",
            threshold: 0.4,
            prefix_padding_ms: 200,
            silence_duration_ms: 400,
            create_response: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_event_type_falls_through() {
        let raw = r#"{"type":"response.created","response":{}}"#;
        let event: ServerEvent = serde_json::from_str(raw).unwrap();
        assert!(matches!(event, ServerEvent::Other));
    }

    #[test]
    fn function_call_arguments_done_parses() {
        let raw = r#"{"type":"response.function_call_arguments.done","call_id":"c1","name":"order_add","arguments":"{}"}"#;
        let event: ServerEvent = serde_json::from_str(raw).unwrap();
        match event {
            ServerEvent::FunctionCallArgumentsDone { call_id, name, .. } => {
                assert_eq!(call_id, "c1");
                assert_eq!(name, "order_add");
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn session_config_serializes_expected_vad_defaults() {
        let vad = ServerVadConfig::default();
        let json = serde_json::to_string(&vad).unwrap();
        assert!(json.contains("\"threshold\":0.4"));
        assert!(json.contains("\"create_response\":true"));
    }
}
