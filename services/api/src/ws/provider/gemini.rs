//! Handles the real-time WebSocket connection to Google Gemini Live.
//!
//! [`GeminiConnector`] performs the setup handshake and spawns a reader task
//! that converts server frames into [`UpstreamEvent`]s on a bounded channel.
//! [`GeminiSession`] is the sending half shared by the orchestrator's tasks.

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use bytes::Bytes;
use casa_core::{
    actions,
    generic_types::{ActionRequest, SessionConfig, UpstreamEvent},
    realtime_api::{RealtimeConnector, RealtimeSession, UpstreamConnection, UpstreamError},
};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::{
    net::TcpStream,
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{self, protocol::Message as WsMessage},
};
use tracing::{debug, error, info, warn};

const GEMINI_LIVE_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";
const INPUT_MIME_TYPE: &str = "audio/pcm;rate=16000";
const EVENT_CHANNEL_CAPACITY: usize = 256;

type GeminiStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// --- Local Gemini Live wire types ---
mod gemini_live_types {
    use serde::{Deserialize, Serialize};
    use serde_json::Value;

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) enum ClientMessage {
        Setup(Setup),
        RealtimeInput(RealtimeInput),
        ClientContent(ClientContent),
        ToolResponse(ToolResponse),
    }

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct Setup {
        pub model: String,
        pub generation_config: GenerationConfig,
        pub system_instruction: Content,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        pub tools: Vec<Tool>,
    }

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct GenerationConfig {
        pub response_modalities: Vec<String>,
        pub speech_config: SpeechConfig,
    }

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct SpeechConfig {
        pub voice_config: VoiceConfig,
        pub language_code: String,
    }

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct VoiceConfig {
        pub prebuilt_voice_config: PrebuiltVoiceConfig,
    }

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct PrebuiltVoiceConfig {
        pub voice_name: String,
    }

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct Tool {
        pub function_declarations: Vec<Value>,
    }

    #[derive(Serialize)]
    pub(super) struct Content {
        #[serde(skip_serializing_if = "Option::is_none")]
        pub role: Option<String>,
        pub parts: Vec<Part>,
    }

    #[derive(Serialize)]
    pub(super) struct Part {
        pub text: String,
    }

    #[derive(Serialize, Default)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct RealtimeInput {
        #[serde(skip_serializing_if = "Option::is_none")]
        pub audio: Option<Blob>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub audio_stream_end: Option<bool>,
    }

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct Blob {
        pub mime_type: String,
        pub data: String,
    }

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct ClientContent {
        pub turns: Vec<Content>,
        pub turn_complete: bool,
    }

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct ToolResponse {
        pub function_responses: Vec<FunctionResponse>,
    }

    #[derive(Serialize)]
    pub(super) struct FunctionResponse {
        pub id: String,
        pub name: String,
        pub response: Value,
    }

    #[derive(Deserialize, Debug, Default)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct ServerMessage {
        pub setup_complete: Option<Value>,
        pub server_content: Option<ServerContent>,
        pub tool_call: Option<ToolCall>,
        pub go_away: Option<Value>,
    }

    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct ServerContent {
        pub model_turn: Option<ModelTurn>,
        #[serde(default)]
        pub turn_complete: bool,
        #[serde(default)]
        pub interrupted: bool,
    }

    #[derive(Deserialize, Debug)]
    pub(super) struct ModelTurn {
        #[serde(default)]
        pub parts: Vec<ServerPart>,
    }

    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct ServerPart {
        pub text: Option<String>,
        pub inline_data: Option<ServerBlob>,
    }

    #[derive(Deserialize, Debug)]
    pub(super) struct ServerBlob {
        pub data: String,
    }

    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct ToolCall {
        #[serde(default)]
        pub function_calls: Vec<FunctionCall>,
    }

    #[derive(Deserialize, Debug)]
    pub(super) struct FunctionCall {
        #[serde(default)]
        pub id: String,
        pub name: String,
        #[serde(default)]
        pub args: Value,
    }
}

use gemini_live_types as live;

/// Opens Gemini Live sessions.
pub struct GeminiConnector {
    api_key: String,
    model: String,
    endpoint: String,
    handshake_timeout: Duration,
}

impl GeminiConnector {
    pub fn new(api_key: String, model: String, handshake_timeout: Duration) -> Self {
        Self {
            api_key,
            model,
            endpoint: GEMINI_LIVE_ENDPOINT.to_string(),
            handshake_timeout,
        }
    }

    fn setup_message(&self, config: &SessionConfig) -> live::ClientMessage {
        let tools = if config.enable_actions {
            vec![live::Tool {
                function_declarations: actions::declarations(),
            }]
        } else {
            Vec::new()
        };
        live::ClientMessage::Setup(live::Setup {
            model: self.model.clone(),
            generation_config: live::GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: live::SpeechConfig {
                    voice_config: live::VoiceConfig {
                        prebuilt_voice_config: live::PrebuiltVoiceConfig {
                            voice_name: config.voice.voice_name.clone(),
                        },
                    },
                    language_code: config.voice.language_code.clone(),
                },
            },
            system_instruction: live::Content {
                role: None,
                parts: vec![live::Part {
                    text: config.system_prompt.clone(),
                }],
            },
            tools,
        })
    }
}

#[async_trait]
impl RealtimeConnector for GeminiConnector {
    async fn connect(&self, config: &SessionConfig) -> Result<UpstreamConnection, UpstreamError> {
        let url = format!("{}?key={}", self.endpoint, self.api_key);
        let (ws_stream, _) = connect_async(url).await.map_err(map_ws_error)?;
        info!(model = %self.model, "Connected to Gemini Live WebSocket.");
        let (mut sink, mut stream) = ws_stream.split();

        sink.send(encode(&self.setup_message(config))?)
            .await
            .map_err(map_ws_error)?;

        tokio::time::timeout(self.handshake_timeout, await_setup_complete(&mut stream))
            .await
            .map_err(|_| UpstreamError::Timeout)??;
        info!("Gemini session setup is complete.");

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let reader = tokio::spawn(read_loop(stream, events_tx));
        let session = Arc::new(GeminiSession {
            sink: Mutex::new(sink),
            closed: AtomicBool::new(false),
            reader: parking_lot::Mutex::new(Some(reader)),
        });

        Ok(UpstreamConnection {
            session,
            events: events_rx,
        })
    }
}

async fn await_setup_complete(stream: &mut SplitStream<GeminiStream>) -> Result<(), UpstreamError> {
    while let Some(frame) = stream.next().await {
        match frame.map_err(map_ws_error)? {
            WsMessage::Text(text) => {
                let msg: live::ServerMessage = serde_json::from_str(&text)
                    .map_err(|e| UpstreamError::Protocol(e.to_string()))?;
                if msg.setup_complete.is_some() {
                    return Ok(());
                }
                warn!("Ignoring Gemini message received before setup completed.");
            }
            WsMessage::Binary(data) => {
                let msg: live::ServerMessage = serde_json::from_slice(&data)
                    .map_err(|e| UpstreamError::Protocol(e.to_string()))?;
                if msg.setup_complete.is_some() {
                    return Ok(());
                }
            }
            WsMessage::Close(frame) => {
                let reason = frame.map(|f| (*f.reason).to_string()).unwrap_or_default();
                return Err(UpstreamError::Config(format!(
                    "setup rejected by upstream: {reason}"
                )));
            }
            _ => {}
        }
    }
    Err(UpstreamError::Transport(
        "stream ended during setup".to_string(),
    ))
}

/// Forwards server frames as events until the upstream goes away.
async fn read_loop(mut stream: SplitStream<GeminiStream>, events: mpsc::Sender<UpstreamEvent>) {
    while let Some(frame) = stream.next().await {
        let parsed = match frame {
            Ok(WsMessage::Text(text)) => parse_server_message(text.as_bytes()),
            Ok(WsMessage::Binary(data)) => parse_server_message(&data),
            Ok(WsMessage::Close(close_frame)) => {
                info!(?close_frame, "Gemini WebSocket closed by server.");
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                error!(error = %e, "Error reading from Gemini WebSocket.");
                break;
            }
        };
        let batch = match parsed {
            Ok(batch) => batch,
            Err(e) => vec![UpstreamEvent::Error(e.to_string())],
        };
        for event in batch {
            if events.send(event).await.is_err() {
                debug!("Event receiver dropped; stopping Gemini reader.");
                return;
            }
        }
    }
    let _ = events.send(UpstreamEvent::Closed).await;
}

/// Converts one server frame into zero or more events.
fn parse_server_message(raw: &[u8]) -> Result<Vec<UpstreamEvent>, UpstreamError> {
    let msg: live::ServerMessage =
        serde_json::from_slice(raw).map_err(|e| UpstreamError::Protocol(e.to_string()))?;
    let mut events = Vec::new();

    if let Some(content) = msg.server_content {
        for part in content.model_turn.map(|t| t.parts).unwrap_or_default() {
            if let Some(text) = part.text.filter(|t| !t.is_empty()) {
                events.push(UpstreamEvent::TextDelta(text));
            }
            if let Some(blob) = part.inline_data {
                let pcm = BASE64
                    .decode(blob.data.as_bytes())
                    .map_err(|e| UpstreamError::Protocol(format!("invalid audio payload: {e}")))?;
                events.push(UpstreamEvent::AudioDelta(Bytes::from(pcm)));
            }
        }
        if content.interrupted {
            events.push(UpstreamEvent::Interrupted);
        } else if content.turn_complete {
            events.push(UpstreamEvent::TurnComplete);
        }
    }
    if let Some(call) = msg.tool_call {
        events.extend(call.function_calls.into_iter().map(|c| {
            UpstreamEvent::ActionRequest(ActionRequest {
                id: c.id,
                name: c.name,
                args: c.args,
            })
        }));
    }
    if msg.go_away.is_some() {
        warn!("Gemini announced an upcoming disconnect.");
    }
    Ok(events)
}

fn encode(msg: &live::ClientMessage) -> Result<WsMessage, UpstreamError> {
    serde_json::to_string(msg)
        .map(|json| WsMessage::Text(json.into()))
        .map_err(|e| UpstreamError::Protocol(e.to_string()))
}

/// Maps transport failures onto the upstream error taxonomy.
fn map_ws_error(e: tungstenite::Error) -> UpstreamError {
    match e {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            UpstreamError::Disconnected(e.to_string())
        }
        tungstenite::Error::Http(response) => {
            let status = response.status().as_u16();
            let body = response
                .body()
                .as_ref()
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_default();
            match status {
                401 | 403 => UpstreamError::Auth(format!("HTTP {status}")),
                429 => UpstreamError::RateLimited { retry_after: None },
                400..=499 => UpstreamError::Config(format!("HTTP {status}: {body}")),
                _ => UpstreamError::Transport(format!("HTTP {status}")),
            }
        }
        other => UpstreamError::Transport(other.to_string()),
    }
}

/// The sending half of a Gemini Live session.
pub struct GeminiSession {
    sink: Mutex<SplitSink<GeminiStream, WsMessage>>,
    closed: AtomicBool,
    reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl GeminiSession {
    async fn send(&self, msg: live::ClientMessage) -> Result<(), UpstreamError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(UpstreamError::Disconnected("session closed".to_string()));
        }
        let frame = encode(&msg)?;
        self.sink.lock().await.send(frame).await.map_err(map_ws_error)
    }
}

#[async_trait]
impl RealtimeSession for GeminiSession {
    async fn send_audio(&self, pcm: Bytes) -> Result<(), UpstreamError> {
        self.send(live::ClientMessage::RealtimeInput(live::RealtimeInput {
            audio: Some(live::Blob {
                mime_type: INPUT_MIME_TYPE.to_string(),
                data: BASE64.encode(&pcm),
            }),
            audio_stream_end: None,
        }))
        .await
    }

    async fn send_text(&self, text: &str, turn_complete: bool) -> Result<(), UpstreamError> {
        self.send(live::ClientMessage::ClientContent(live::ClientContent {
            turns: vec![live::Content {
                role: Some("user".to_string()),
                parts: vec![live::Part {
                    text: text.to_string(),
                }],
            }],
            turn_complete,
        }))
        .await
    }

    async fn end_audio_turn(&self) -> Result<(), UpstreamError> {
        self.send(live::ClientMessage::RealtimeInput(live::RealtimeInput {
            audio: None,
            audio_stream_end: Some(true),
        }))
        .await
    }

    async fn send_action_result(
        &self,
        id: &str,
        name: &str,
        result: Value,
    ) -> Result<(), UpstreamError> {
        self.send(live::ClientMessage::ToolResponse(live::ToolResponse {
            function_responses: vec![live::FunctionResponse {
                id: id.to_string(),
                name: name.to_string(),
                response: result,
            }],
        }))
        .await
    }

    async fn close(&self) -> Result<(), UpstreamError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        let mut sink = self.sink.lock().await;
        let _ = sink.send(WsMessage::Close(None)).await;
        sink.close().await.map_err(map_ws_error)?;
        info!("Gemini session closed.");
        Ok(())
    }
}
