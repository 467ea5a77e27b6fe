//! C7 — Call Orchestrator: the `idle → ringing → active → ended` state
//! machine that wires C2 (SIP/RTP) to C4 (AI realtime) through the C1
//! transcoder, dispatches tool calls to C5, and reports everything to C8's
//! Event Hub. Exactly one call is live at a time; a second inbound INVITE
//! is rejected 486 Busy Here while one is in progress.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{info, warn};

use crate::admission::AdmissionFilter;
use crate::ai::{self, AiEvent, AiHandle, ConnectParams, TranscriptRole};
use crate::audio::{self, resample};
use crate::call::{Call, CallId, CallState, Speaker, TranscriptSegment};
use crate::hub::{EventHub, HubEvent};
use crate::queue::{AudioFrame, BoundedFrameQueue};
use crate::sip::{RejectStatus, SipEvent, SipHandle};
use crate::tools::catalog::CatalogStore;
use crate::tools::order::Order;
use crate::tools::{DomainSwitch, ProductDomain, ToolDispatcher};
use crate::expert::ExpertClient;

/// Inbound audio is delivered to the AI at a fixed rate/depth regardless of
/// the negotiated SIP codec.
const AI_INPUT_RATE: u32 = 16000;
const OUTBOUND_TICK_MS: u64 = 20;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("no call is currently ringing")]
    NoRingingCall,
    #[error("no call is currently active")]
    NoActiveCall,
    #[error("AI session failed to connect: {0}")]
    AiConnect(#[from] ai::AiStreamError),
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct StatusSnapshot {
    pub registered: bool,
    pub firewall_enabled: bool,
    pub call_state: Option<CallState>,
    pub call_id: Option<CallId>,
    pub muted: bool,
    pub model: String,
}

enum Command {
    AcceptCall,
    RejectCall,
    HangupCall,
    Mute,
    Unmute,
    SetModel(String),
    SetInstructions(String),
    GetInstructions(oneshot::Sender<String>),
    Status(oneshot::Sender<StatusSnapshot>),
}

#[derive(Clone)]
pub struct OrchestratorHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl OrchestratorHandle {
    pub fn accept_call(&self) {
        let _ = self.commands.send(Command::AcceptCall);
    }
    pub fn reject_call(&self) {
        let _ = self.commands.send(Command::RejectCall);
    }
    pub fn hangup_call(&self) {
        let _ = self.commands.send(Command::HangupCall);
    }
    pub fn mute(&self) {
        let _ = self.commands.send(Command::Mute);
    }
    pub fn unmute(&self) {
        let _ = self.commands.send(Command::Unmute);
    }
    pub fn set_model(&self, model: String) {
        let _ = self.commands.send(Command::SetModel(model));
    }
    /// Sets the realtime voice AI session's own `instructions`, distinct
    /// from the expert assistant's system prompt (`ExpertClient::instructions`).
    pub fn set_instructions(&self, instructions: String) {
        let _ = self.commands.send(Command::SetInstructions(instructions));
    }
    pub async fn instructions(&self) -> Option<String> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(Command::GetInstructions(tx)).ok()?;
        rx.await.ok()
    }
    pub async fn status(&self) -> Option<StatusSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(Command::Status(tx)).ok()?;
        rx.await.ok()
    }
}

enum Internal {
    Sip(SipEvent),
    Ai { call_id: CallId, event: AiEvent },
    AiSessionEnded { call_id: CallId },
    Command(Command),
}

struct ActiveResources {
    ai: Arc<AiHandle>,
    inbound: Arc<BoundedFrameQueue>,
    outbound: Arc<BoundedFrameQueue>,
    tool_dispatcher: Arc<ToolDispatcher>,
    inbound_task: JoinHandle<()>,
    outbound_task: JoinHandle<()>,
    ai_relay_task: JoinHandle<()>,
    domain_relay_task: JoinHandle<()>,
}

impl Drop for ActiveResources {
    fn drop(&mut self) {
        self.inbound_task.abort();
        self.outbound_task.abort();
        self.ai_relay_task.abort();
        self.domain_relay_task.abort();
    }
}

pub struct OrchestratorConfig {
    pub ws_base_url: String,
    pub openai_api_key: String,
    pub voice: String,
    pub tool_schema: Vec<Value>,
    pub domains: Vec<ProductDomain>,
}

pub struct CallOrchestrator {
    sip: SipHandle,
    admission: Arc<AdmissionFilter>,
    catalogs: Arc<Mutex<CatalogStore>>,
    expert: Arc<ExpertClient>,
    hub: Arc<EventHub>,
    config: OrchestratorConfig,

    call: Mutex<Option<Call>>,
    order: Arc<Mutex<Option<Order>>>,
    resources: Mutex<Option<ActiveResources>>,
    muted: AtomicBool,
    model: Mutex<String>,
    /// The realtime voice AI session's own `instructions`. Kept separate
    /// from `expert.instructions()`, which governs the text-escalation
    /// assistant's system prompt instead (§6).
    ai_instructions: Mutex<String>,
    registered: AtomicBool,
}

impl CallOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        sip: SipHandle,
        admission: Arc<AdmissionFilter>,
        catalogs: Arc<Mutex<CatalogStore>>,
        expert: Arc<ExpertClient>,
        hub: Arc<EventHub>,
        order: Arc<Mutex<Option<Order>>>,
        config: OrchestratorConfig,
        initial_model: String,
        initial_instructions: String,
        mut sip_events: mpsc::UnboundedReceiver<SipEvent>,
    ) -> OrchestratorHandle {
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<Command>();

        let orchestrator = Arc::new(Self {
            sip,
            admission,
            catalogs,
            expert,
            hub,
            config,
            call: Mutex::new(None),
            order,
            resources: Mutex::new(None),
            muted: AtomicBool::new(false),
            model: Mutex::new(initial_model),
            ai_instructions: Mutex::new(initial_instructions),
            registered: AtomicBool::new(false),
        });

        let (internal_tx, mut internal_rx) = mpsc::unbounded_channel::<Internal>();

        let sip_tx = internal_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = sip_events.recv().await {
                if sip_tx.send(Internal::Sip(event)).is_err() {
                    break;
                }
            }
        });

        let cmd_tx_internal = internal_tx.clone();
        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                if cmd_tx_internal.send(Internal::Command(cmd)).is_err() {
                    break;
                }
            }
        });

        let loop_orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            while let Some(event) = internal_rx.recv().await {
                match event {
                    Internal::Sip(e) => loop_orchestrator.handle_sip_event(e, &internal_tx).await,
                    Internal::Ai { call_id, event } => loop_orchestrator.handle_ai_event(call_id, event).await,
                    Internal::AiSessionEnded { call_id } => loop_orchestrator.end_call(call_id, true).await,
                    Internal::Command(cmd) => loop_orchestrator.handle_command(cmd).await,
                }
            }
        });

        OrchestratorHandle { commands: cmd_tx }
    }

    async fn handle_sip_event(&self, event: SipEvent, internal_tx: &mpsc::UnboundedSender<Internal>) {
        match event {
            SipEvent::RegistrationState { registered } => {
                self.registered.store(registered, Ordering::Relaxed);
            }
            SipEvent::Incoming {
                call_id,
                remote_uri,
                remote_ip,
            } => {
                if self.call.lock().is_some() {
                    info!(%call_id, "second call while one active, rejecting 486");
                    let _ = self.sip.reject(call_id, RejectStatus::Busy486);
                    return;
                }

                if self.admission.evaluate(&remote_ip, &remote_uri) == crate::admission::AdmissionDecision::Reject {
                    warn!(%remote_ip, %remote_uri, "call rejected by admission filter");
                    let _ = self.sip.reject(call_id, RejectStatus::Forbidden403);
                    self.hub.broadcast(HubEvent::CallRejected {
                        remote_ip,
                        reason: "not in allowed network".to_string(),
                    });
                    return;
                }

                *self.call.lock() = Some(Call::new(call_id.clone(), remote_uri.clone(), remote_ip));
                self.hub.broadcast(HubEvent::CallIncoming { call_id, remote_uri });
            }

            SipEvent::Accepted { call_id, codec, rate } => {
                self.on_accepted(call_id, codec, rate, internal_tx.clone()).await;
            }

            SipEvent::Audio { call_id, pcm } => {
                self.on_inbound_rtp(&call_id, pcm);
            }

            SipEvent::Ended { call_id } => {
                self.end_call(call_id, false).await;
            }
        }
    }

    async fn on_accepted(
        &self,
        call_id: CallId,
        codec: audio::Codec,
        rate: u32,
        internal_tx: mpsc::UnboundedSender<Internal>,
    ) {
        {
            let mut call = self.call.lock();
            let Some(call) = call.as_mut() else { return };
            if call.call_id != call_id {
                return;
            }
            call.state = CallState::Active;
            call.negotiated_codec = Some(codec);
            call.negotiated_rate = Some(rate);
        }

        let model = self.model.lock().clone();
        let instructions = self.ai_instructions.lock().clone();
        let connect_result = ai::connect(ConnectParams {
            ws_base_url: self.config.ws_base_url.clone(),
            api_key: self.config.openai_api_key.clone(),
            model,
            instructions,
            voice: self.config.voice.clone(),
            tools: self.config.tool_schema.clone(),
        })
        .await;

        let (ai_handle, mut ai_events) = match connect_result {
            Ok(pair) => pair,
            Err(err) => {
                warn!(%call_id, error = %err, "AI session failed to connect, ending call");
                let _ = self.sip.hangup(call_id.clone());
                self.end_call(call_id, true).await;
                return;
            }
        };
        let ai_handle = Arc::new(ai_handle);

        *self.order.lock() = Some(Order::new(self.call.lock().as_ref().map(|c| c.remote_uri.clone()).unwrap_or_default()));

        let (domain_tx, mut domain_rx) = mpsc::unbounded_channel::<DomainSwitch>();
        let tool_dispatcher = Arc::new(ToolDispatcher::new(
            self.catalogs.clone(),
            self.order.clone(),
            self.expert.clone(),
            self.config.domains.clone(),
            domain_tx,
        ));

        let inbound = Arc::new(BoundedFrameQueue::with_default_capacity());
        let outbound = Arc::new(BoundedFrameQueue::with_default_capacity());

        let relay_call_id = call_id.clone();
        let relay_tx = internal_tx.clone();
        let ai_relay_task = tokio::spawn(async move {
            while let Some(event) = ai_events.recv().await {
                if relay_tx
                    .send(Internal::Ai {
                        call_id: relay_call_id.clone(),
                        event,
                    })
                    .is_err()
                {
                    break;
                }
            }
            let _ = relay_tx.send(Internal::AiSessionEnded { call_id: relay_call_id });
        });

        let domain_ai = ai_handle.clone();
        let domain_hub = self.hub.clone();
        let domain_call_id = call_id.clone();
        let domain_relay_task = tokio::spawn(async move {
            while let Some(switch) = domain_rx.recv().await {
                domain_ai.update_instructions(switch.instructions);
                domain_hub.broadcast(HubEvent::DebugEvent {
                    message: format!("call {domain_call_id} switched to domain {}", switch.domain_name),
                });
            }
        });

        let inbound_for_task = inbound.clone();
        let ai_for_inbound = ai_handle.clone();
        let inbound_task = tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(OUTBOUND_TICK_MS));
            loop {
                ticker.tick().await;
                if let Some(frame) = inbound_for_task.pop() {
                    ai_for_inbound.send_audio(&frame.payload);
                }
            }
        });

        let outbound_for_task = outbound.clone();
        let sip_for_outbound = self.sip.clone();
        let outbound_call_id = call_id.clone();
        let outbound_rate = rate;
        let outbound_task = tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(OUTBOUND_TICK_MS));
            loop {
                ticker.tick().await;
                let Some(frame) = outbound_for_task.pop() else {
                    continue; // nothing buffered; let the RTP layer pad with silence
                };
                let resampled = match resample(&frame.payload, frame.source_rate, outbound_rate) {
                    Ok(pcm) => pcm,
                    Err(err) => {
                        warn!(error = %err, "failed to resample outbound audio frame");
                        continue;
                    }
                };
                if sip_for_outbound.send_audio(outbound_call_id.clone(), resampled).is_err() {
                    break;
                }
            }
        });

        *self.resources.lock() = Some(ActiveResources {
            ai: ai_handle.clone(),
            inbound,
            outbound,
            tool_dispatcher,
            inbound_task,
            outbound_task,
            ai_relay_task,
            domain_relay_task,
        });

        ai_handle.trigger_greeting();
        self.hub.broadcast(HubEvent::CallActive {
            call_id,
            codec: codec.sdp_name().to_string(),
            rate,
        });
    }

    fn on_inbound_rtp(&self, call_id: &CallId, pcm: Vec<u8>) {
        let negotiated_rate = match self.call.lock().as_ref() {
            Some(call) if &call.call_id == call_id => call.negotiated_rate,
            _ => None,
        };
        let Some(negotiated_rate) = negotiated_rate else { return };

        let resources = self.resources.lock();
        let Some(resources) = resources.as_ref() else { return };

        if self.muted.load(Ordering::Relaxed) {
            return;
        }

        match resample(&pcm, negotiated_rate, AI_INPUT_RATE) {
            Ok(resampled) => resources.inbound.push(AudioFrame {
                payload: resampled,
                timestamp_ms: 0,
                source_rate: AI_INPUT_RATE,
                bit_depth: 16,
            }),
            Err(err) => warn!(%call_id, error = %err, "failed to resample inbound audio frame"),
        }
    }

    async fn handle_ai_event(&self, call_id: CallId, event: AiEvent) {
        match event {
            AiEvent::Connected => {}
            AiEvent::Audio { pcm_24khz_s16 } => {
                let resources = self.resources.lock();
                if let Some(resources) = resources.as_ref() {
                    resources.outbound.push(AudioFrame {
                        payload: pcm_24khz_s16,
                        timestamp_ms: 0,
                        source_rate: 24000,
                        bit_depth: 16,
                    });
                }
            }
            AiEvent::Transcript { role, text, r#final } => {
                let speaker = match role {
                    TranscriptRole::Assistant => Speaker::Assistant,
                    TranscriptRole::Caller => Speaker::Caller,
                };
                let mut call = self.call.lock();
                if let Some(call) = call.as_mut() {
                    if call.call_id == call_id {
                        call.apply_transcript(TranscriptSegment {
                            speaker,
                            text: text.clone(),
                            r#final,
                            timestamp_ms: call.start_time.elapsed().as_millis() as u64,
                        });
                    }
                }
                self.hub.broadcast(HubEvent::Transcript {
                    call_id,
                    speaker: format!("{speaker:?}").to_lowercase(),
                    text,
                    r#final,
                });
            }
            AiEvent::Interruption => {
                // Barge-in: flush only the outbound path. The inbound queue
                // is left untouched so the caller's speech keeps flowing.
                let resources = self.resources.lock();
                if let Some(resources) = resources.as_ref() {
                    resources.outbound.flush();
                    resources.ai.cancel_response();
                }
            }
            AiEvent::ToolCall { id, name, arguments_json } => {
                let dispatcher = self.resources.lock().as_ref().map(|r| r.tool_dispatcher.clone());
                let ai_handle = self.resources.lock().as_ref().map(|r| r.ai.clone());
                let order = self.order.clone();
                let hub = self.hub.clone();
                let expert = self.expert.clone();
                if let (Some(dispatcher), Some(ai_handle)) = (dispatcher, ai_handle) {
                    tokio::spawn(async move {
                        if name == "ask_expert" {
                            let question = serde_json::from_str::<Value>(&arguments_json)
                                .ok()
                                .and_then(|v| v["question"].as_str().map(str::to_string))
                                .unwrap_or_default();
                            hub.broadcast(HubEvent::ExpertQueryStart {
                                call_id: call_id.clone(),
                                question,
                            });
                        }
                        let stats_before = expert.stats();
                        let result = dispatcher.dispatch(&name, &arguments_json).await;
                        if name == "ask_expert" {
                            let stats_after = expert.stats();
                            hub.broadcast(HubEvent::ExpertQueryDone {
                                call_id: call_id.clone(),
                                success: stats_after.successful_queries > stats_before.successful_queries,
                                confidence: 0.0,
                            });
                        }
                        if name == "order_add" {
                            if let Some(order) = order.lock().as_ref() {
                                hub.broadcast(HubEvent::OrderUpdate {
                                    call_id: call_id.clone(),
                                    rendered: order.render(),
                                });
                            }
                        }
                        ai_handle.post_tool_result(id, result);
                    });
                }
            }
            AiEvent::Error { message } => {
                warn!(%call_id, %message, "AI session reported an error");
            }
        }
    }

    async fn end_call(&self, call_id: CallId, from_ai_failure: bool) {
        let was_current = {
            let call = self.call.lock();
            matches!(call.as_ref(), Some(c) if c.call_id == call_id)
        };
        if !was_current {
            return;
        }
        if !from_ai_failure {
            if let Some(resources) = self.resources.lock().as_ref() {
                resources.ai.close();
            }
        }
        *self.call.lock() = None;
        *self.order.lock() = None;
        *self.resources.lock() = None; // dropping ActiveResources aborts its tasks
        self.hub.broadcast(HubEvent::CallEnded { call_id });
    }

    async fn handle_command(&self, cmd: Command) {
        match cmd {
            Command::AcceptCall => {
                let call_id = self.call.lock().as_ref().map(|c| c.call_id.clone());
                match call_id {
                    Some(call_id) => {
                        let _ = self.sip.accept(call_id);
                    }
                    None => warn!("accept requested with no ringing call"),
                }
            }
            Command::RejectCall => {
                let call_id = self.call.lock().take().map(|c| c.call_id);
                if let Some(call_id) = call_id {
                    let _ = self.sip.reject(call_id, RejectStatus::Busy486);
                }
            }
            Command::HangupCall => {
                let call_id = self.call.lock().as_ref().map(|c| c.call_id.clone());
                if let Some(call_id) = call_id {
                    let _ = self.sip.hangup(call_id.clone());
                    self.end_call(call_id, false).await;
                }
            }
            Command::Mute => self.muted.store(true, Ordering::Relaxed),
            Command::Unmute => self.muted.store(false, Ordering::Relaxed),
            Command::SetModel(model) => *self.model.lock() = model,
            Command::SetInstructions(instructions) => {
                *self.ai_instructions.lock() = instructions.clone();
                if let Some(resources) = self.resources.lock().as_ref() {
                    resources.ai.update_instructions(instructions);
                }
            }
            Command::GetInstructions(reply) => {
                let _ = reply.send(self.ai_instructions.lock().clone());
            }
            Command::Status(reply) => {
                let call = self.call.lock();
                let snapshot = StatusSnapshot {
                    registered: self.registered.load(Ordering::Relaxed),
                    firewall_enabled: self.admission.is_enabled(),
                    call_state: call.as_ref().map(|c| c.state),
                    call_id: call.as_ref().map(|c| c.call_id.clone()),
                    muted: self.muted.load(Ordering::Relaxed),
                    model: self.model.lock().clone(),
                };
                let _ = reply.send(snapshot);
            }
        }
    }
}

/// Domain table lookup helper, exposed for `main` to build `ProductDomain`
/// entries keyed by name (kept free of any particular config file format).
pub fn domains_by_name(domains: &[ProductDomain]) -> BTreeMap<String, &ProductDomain> {
    domains.iter().map(|d| (d.name.clone(), d)).collect()
}
