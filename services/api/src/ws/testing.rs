//! In-memory collaborators for driving connections end to end in tests.

use super::protocol::ServerMessage;
use super::registry::{ConnectionId, ConnectionRegistry};
use super::session::{Frame, run_connection};
use super::session_state::SessionStore;
use crate::config::AudioPolicy;
use crate::error::SessionError;
use crate::resilience::{CircuitBreakerConfig, ResilienceExecutor, RetryPolicy};
use crate::state::{AppState, SessionSettings};
use async_trait::async_trait;
use bytes::Bytes;
use casa_core::device_backend::{DeviceBackend, DeviceError};
use casa_core::generic_types::{SessionConfig, UpstreamEvent, VoiceConfig};
use casa_core::realtime_api::{
    RealtimeConnector, RealtimeSession, UpstreamConnection, UpstreamError,
};
use mockall::mock;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

mock! {
    pub Backend {}

    #[async_trait]
    impl DeviceBackend for Backend {
        async fn invoke(&self, action: &str, args: &Value) -> Result<Value, DeviceError>;
    }
}

/// A call the fake upstream session received.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Audio(usize),
    Text(String, bool),
    EndTurn,
    ActionResult { id: String, name: String, result: Value },
}

/// Records every call; scripted failures are returned first, in order.
#[derive(Default)]
pub struct FakeSession {
    pub calls: Mutex<Vec<Call>>,
    pub failures: Mutex<VecDeque<UpstreamError>>,
    pub closes: AtomicUsize,
}

impl FakeSession {
    fn record(&self, call: Call) -> Result<(), UpstreamError> {
        if let Some(e) = self.failures.lock().pop_front() {
            return Err(e);
        }
        self.calls.lock().push(call);
        Ok(())
    }

    pub fn fail_next(&self, errors: impl IntoIterator<Item = UpstreamError>) {
        self.failures.lock().extend(errors);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl RealtimeSession for FakeSession {
    async fn send_audio(&self, pcm: Bytes) -> Result<(), UpstreamError> {
        self.record(Call::Audio(pcm.len()))
    }

    async fn send_text(&self, text: &str, turn_complete: bool) -> Result<(), UpstreamError> {
        self.record(Call::Text(text.to_string(), turn_complete))
    }

    async fn end_audio_turn(&self) -> Result<(), UpstreamError> {
        self.record(Call::EndTurn)
    }

    async fn send_action_result(
        &self,
        id: &str,
        name: &str,
        result: Value,
    ) -> Result<(), UpstreamError> {
        self.record(Call::ActionResult {
            id: id.to_string(),
            name: name.to_string(),
            result,
        })
    }

    async fn close(&self) -> Result<(), UpstreamError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out a single [`FakeSession`]; the test pushes upstream events
/// through `events`.
pub struct FakeConnector {
    pub session: Arc<FakeSession>,
    pub events: mpsc::Sender<UpstreamEvent>,
    receiver: Mutex<Option<mpsc::Receiver<UpstreamEvent>>>,
    pub connect_failures: Mutex<VecDeque<UpstreamError>>,
    pub connects: AtomicUsize,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        let (events, receiver) = mpsc::channel(32);
        Arc::new(Self {
            session: Arc::new(FakeSession::default()),
            events,
            receiver: Mutex::new(Some(receiver)),
            connect_failures: Mutex::new(VecDeque::new()),
            connects: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl RealtimeConnector for FakeConnector {
    async fn connect(&self, _config: &SessionConfig) -> Result<UpstreamConnection, UpstreamError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.connect_failures.lock().pop_front() {
            return Err(e);
        }
        let events = self
            .receiver
            .lock()
            .take()
            .ok_or_else(|| UpstreamError::Transport("fake already connected".into()))?;
        Ok(UpstreamConnection {
            session: self.session.clone(),
            events,
        })
    }
}

pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(1),
        backoff_multiplier: 2.0,
        jitter: false,
    }
}

pub fn test_state(
    connector: Arc<FakeConnector>,
    backend: Arc<dyn DeviceBackend>,
    upstream_retry: RetryPolicy,
) -> Arc<AppState> {
    let executor = |name: &str, retry: RetryPolicy| {
        Arc::new(ResilienceExecutor::new(
            name,
            retry,
            CircuitBreakerConfig::default(),
            Duration::from_secs(1),
        ))
    };
    Arc::new(AppState {
        settings: SessionSettings {
            voice: VoiceConfig::default(),
            enable_actions: true,
            turn_timeout: Duration::from_secs(8),
            close_grace: Duration::from_secs(1),
            audio_policy: AudioPolicy::Block,
        },
        registry: Arc::new(ConnectionRegistry::new(64, Duration::from_secs(1))),
        sessions: Arc::new(SessionStore::new()),
        upstream_executor: executor("upstream", upstream_retry),
        device_executor: executor("device", fast_retry(3)),
        connector,
        device_backend: backend,
        system_prompt: Arc::new("You are a test assistant.".to_string()),
    })
}

/// One connection driven through `run_connection` over channels.
pub struct Harness {
    pub id: ConnectionId,
    pub client: mpsc::Receiver<ServerMessage>,
    pub frames: mpsc::Sender<Result<Frame, SessionError>>,
    pub task: JoinHandle<()>,
}

impl Harness {
    pub fn start(state: Arc<AppState>) -> Self {
        let (id, client) = state.registry.register();
        let (frames, rx) = mpsc::channel(16);
        let task = tokio::spawn(run_connection(
            state,
            id,
            ReceiverStream::new(rx),
        ));
        Self {
            id,
            client,
            frames,
            task,
        }
    }

    pub async fn send(&self, frame: Frame) {
        self.frames.send(Ok(frame)).await.unwrap();
    }

    pub async fn send_json(&self, value: Value) {
        self.send(Frame::Text(value.to_string())).await;
    }

    /// The next message queued for the client.
    pub async fn next(&mut self) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(30), self.client.recv())
            .await
            .expect("timed out waiting for a client message")
            .expect("client queue closed")
    }

    /// Skips messages until one satisfies `pred`.
    pub async fn next_where(&mut self, pred: impl Fn(&ServerMessage) -> bool) -> ServerMessage {
        loop {
            let message = self.next().await;
            if pred(&message) {
                return message;
            }
        }
    }

    pub async fn next_error(&mut self) -> (String, String) {
        match self
            .next_where(|m| matches!(m, ServerMessage::Error { .. }))
            .await
        {
            ServerMessage::Error { code, message, .. } => (code, message),
            _ => unreachable!(),
        }
    }
}
