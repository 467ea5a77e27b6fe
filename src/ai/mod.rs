//! C4 — AI Stream Client: one WebSocket session per call to the realtime
//! speech service. A dedicated writer task drains an outbound queue into
//! the WS sink while a reader task dispatches inbound frames, with a
//! bearer-auth `connect_async` retry loop for the initial handshake.

pub mod events;

use std::time::Duration;

use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use self::events::{
    ClientEvent, FunctionCallOutputItem, InstructionsPatch, ServerEvent, ServerVadConfig, SessionConfig,
    TranscriptionConfig,
};
pub use self::events::{AiEvent, TranscriptRole};

const MAX_CONNECT_ATTEMPTS: u32 = 5;
const DROP_LOG_INTERVAL: u64 = 100;

#[derive(Debug, Error)]
pub enum AiStreamError {
    #[error("failed to connect after {0} attempts")]
    ConnectFailed(u32),
    #[error("session is closed")]
    Closed,
}

enum OutboundMessage {
    Json(ClientEvent),
    Close,
}

/// Handle the orchestrator uses to drive an open AI session.
pub struct AiHandle {
    outbound: mpsc::UnboundedSender<OutboundMessage>,
    drop_count: std::sync::atomic::AtomicU64,
}

impl AiHandle {
    /// Base64-encode and append PCM16 @ 16kHz audio. Non-blocking: if the
    /// outbound channel is saturated the frame is dropped and a warning is
    /// logged once per 100 drops (§4.4).
    pub fn send_audio(&self, pcm_16khz_s16: &[u8]) {
        let audio = base64::engine::general_purpose::STANDARD.encode(pcm_16khz_s16);
        if self
            .outbound
            .send(OutboundMessage::Json(ClientEvent::InputAudioBufferAppend { audio }))
            .is_err()
        {
            let count = self.drop_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed) + 1;
            if count % DROP_LOG_INTERVAL == 0 {
                warn!(drops = count, "dropped audio frames to AI session (channel saturated)");
            }
        }
    }

    pub fn trigger_greeting(&self) {
        let _ = self.outbound.send(OutboundMessage::Json(ClientEvent::ResponseCreate));
    }

    pub fn cancel_response(&self) {
        let _ = self.outbound.send(OutboundMessage::Json(ClientEvent::ResponseCancel));
    }

    /// Push new instructions mid-call (domain switch) without a full
    /// session reconfiguration.
    pub fn update_instructions(&self, instructions: String) {
        let _ = self
            .outbound
            .send(OutboundMessage::Json(ClientEvent::SessionUpdateInstructions {
                session: InstructionsPatch { instructions },
            }));
    }

    /// Reply to a tool call: function_call_output item followed immediately
    /// by response.create (§4.4 — "without the second message the assistant stalls").
    pub fn post_tool_result(&self, call_id: String, result_text: String) {
        let _ = self.outbound.send(OutboundMessage::Json(ClientEvent::ConversationItemCreate {
            item: FunctionCallOutputItem {
                item_type: "function_call_output",
                call_id,
                output: result_text,
            },
        }));
        let _ = self.outbound.send(OutboundMessage::Json(ClientEvent::ResponseCreate));
    }

    pub fn close(&self) {
        let _ = self.outbound.send(OutboundMessage::Close);
    }
}

pub struct ConnectParams {
    pub ws_base_url: String,
    pub api_key: String,
    pub model: String,
    pub instructions: String,
    pub voice: String,
    pub tools: Vec<Value>,
}

/// Open a realtime session for one call. Retries the initial connect with
/// exponential backoff (1s, x2, cap 30s, max 5 attempts); once established,
/// a dropped WebSocket ends the call rather than reconnecting mid-call
/// (§4.4: "per-call reconnect is discouraged").
pub async fn connect(params: ConnectParams) -> Result<(AiHandle, mpsc::UnboundedReceiver<AiEvent>), AiStreamError> {
    let url = format!("{}?model={}", params.ws_base_url, params.model);

    let mut backoff = Duration::from_secs(1);
    let mut attempt = 0;
    let ws_stream = loop {
        attempt += 1;
        let request = build_request(&url, &params.api_key);
        match tokio_tungstenite::connect_async(request).await {
            Ok((stream, _)) => break stream,
            Err(err) => {
                warn!(attempt, error = %err, "AI realtime connect failed");
                if attempt >= MAX_CONNECT_ATTEMPTS {
                    return Err(AiStreamError::ConnectFailed(attempt));
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(30));
            }
        }
    };

    let (mut sink, mut stream) = ws_stream.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<OutboundMessage>();
    let (event_tx, event_rx) = mpsc::unbounded_channel::<AiEvent>();

    let session_update = ClientEvent::SessionUpdate {
        session: SessionConfig {
            modalities: vec!["text", "audio"],
            instructions: params.instructions,
            voice: params.voice,
            input_audio_format: "pcm16",
            output_audio_format: "pcm16",
            input_audio_transcription: TranscriptionConfig { model: "whisper-1" },
            turn_detection: ServerVadConfig::default(),
            tools: params.tools,
            tool_choice: "auto",
        },
    };
    let _ = outbound_tx.send(OutboundMessage::Json(session_update));

    // Writer task: drains the outbound queue into the WS sink.
    tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            match msg {
                OutboundMessage::Json(event) => match serde_json::to_string(&event) {
                    Ok(text) => {
                        if sink.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!(error = %err, "failed to serialize outbound AI event"),
                },
                OutboundMessage::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    // Reader task: dispatches inbound wire events to typed AiEvents.
    tokio::spawn(async move {
        while let Some(next) = stream.next().await {
            match next {
                Ok(Message::Text(text)) => dispatch_inbound(&text, &event_tx),
                Ok(Message::Close(_)) => {
                    info!("AI realtime session closed");
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(error = %err, "AI realtime session error, ending call");
                    let _ = event_tx.send(AiEvent::Error { message: err.to_string() });
                    break;
                }
            }
        }
    });

    let handle = AiHandle {
        outbound: outbound_tx,
        drop_count: std::sync::atomic::AtomicU64::new(0),
    };

    Ok((handle, event_rx))
}

fn build_request(url: &str, api_key: &str) -> tokio_tungstenite::tungstenite::handshake::client::Request {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    let mut request = url.into_client_request().expect("ws url is valid");
    let headers = request.headers_mut();
    headers.insert(
        "Authorization",
        format!("Bearer {api_key}").parse().expect("valid header value"),
    );
    headers.insert("OpenAI-Beta", "realtime=v1".parse().expect("valid header value"));
    request
}

fn dispatch_inbound(text: &str, event_tx: &mpsc::UnboundedSender<AiEvent>) {
    let parsed: Result<ServerEvent, _> = serde_json::from_str(text);
    let event = match parsed {
        Ok(event) => event,
        Err(err) => {
            debug!(error = %err, "unparseable AI event, ignoring");
            return;
        }
    };

    let mapped = match event {
        ServerEvent::SessionUpdated => Some(AiEvent::Connected),
        ServerEvent::AudioDelta { delta } => base64::engine::general_purpose::STANDARD
            .decode(delta)
            .ok()
            .map(|pcm_24khz_s16| AiEvent::Audio { pcm_24khz_s16 }),
        ServerEvent::TranscriptDelta { delta } => Some(AiEvent::Transcript {
            role: TranscriptRole::Assistant,
            text: delta,
            r#final: false,
        }),
        ServerEvent::TranscriptDone { transcript } => Some(AiEvent::Transcript {
            role: TranscriptRole::Assistant,
            text: transcript,
            r#final: true,
        }),
        ServerEvent::InputTranscriptDone { transcript } => Some(AiEvent::Transcript {
            role: TranscriptRole::Caller,
            text: transcript,
            r#final: true,
        }),
        ServerEvent::SpeechStarted => Some(AiEvent::Interruption),
        ServerEvent::FunctionCallArgumentsDone { call_id, name, arguments } => Some(AiEvent::ToolCall {
            id: call_id,
            name,
            arguments_json: arguments,
        }),
        ServerEvent::Error { error } => Some(AiEvent::Error { message: error.message }),
        ServerEvent::Other => None,
    };

    if let Some(event) = mapped {
        let _ = event_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_ignores_unknown_event() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatch_inbound(r#"{"type":"response.created"}"#, &tx);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dispatch_maps_tool_call() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatch_inbound(
            r#"{"type":"response.function_call_arguments.done","call_id":"c1","name":"order_add","arguments":"{}"}"#,
            &tx,
        );
        match rx.try_recv().unwrap() {
            AiEvent::ToolCall { id, name, .. } => {
                assert_eq!(id, "c1");
                assert_eq!(name, "order_add");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn dispatch_maps_speech_started_to_interruption() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatch_inbound(r#"{"type":"input_audio_buffer.speech_started"}"#, &tx);
        assert!(matches!(rx.try_recv().unwrap(), AiEvent::Interruption));
    }
}
