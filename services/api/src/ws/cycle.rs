//! Drains events from the upstream session and tracks the generation cycle.
//!
//! One drain task runs per connection, concurrently with the receive loop in
//! `session`. Deltas are forwarded to the client as they arrive, device
//! actions are executed and answered, and a turn-complete or interrupt signal
//! ends the current cycle.

use super::{
    protocol::{ServerMessage, SessionStatus},
    provider::UPSTREAM_OUTPUT_SAMPLE_RATE,
    registry::ConnectionId,
    session_state::{SessionHandle, SessionState},
};
use crate::{error::SessionError, state::AppState};
use casa_core::{
    generic_types::{ActionRequest, UpstreamEvent},
    realtime_api::{RealtimeSession, UpstreamError},
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Recording,
    Generating { started: Instant },
}

#[derive(Debug)]
struct CycleInner {
    phase: Phase,
    last_event: Instant,
    chunks_sent: u64,
    total_size: u64,
}

/// Totals of a finished generation cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnSummary {
    pub elapsed: Duration,
    pub chunks_sent: u64,
    pub total_size: u64,
}

/// Where a connection is in its record, generate, ready loop.
///
/// Shared by the receive loop (which starts recording and generation) and
/// the drain task (which observes upstream output and ends the cycle).
#[derive(Debug)]
pub struct GenerationCycle {
    inner: Mutex<CycleInner>,
    started: Notify,
}

impl Default for GenerationCycle {
    fn default() -> Self {
        Self::new()
    }
}

impl GenerationCycle {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CycleInner {
                phase: Phase::Idle,
                last_event: Instant::now(),
                chunks_sent: 0,
                total_size: 0,
            }),
            started: Notify::new(),
        }
    }

    pub fn is_generating(&self) -> bool {
        matches!(self.inner.lock().phase, Phase::Generating { .. })
    }

    /// Moves an idle cycle to recording. Returns true on that transition.
    pub fn begin_recording(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.phase == Phase::Idle {
            inner.phase = Phase::Recording;
            true
        } else {
            false
        }
    }

    /// Starts a generation cycle. Returns false if one is already running.
    pub fn begin_generation(&self) -> bool {
        let mut inner = self.inner.lock();
        if matches!(inner.phase, Phase::Generating { .. }) {
            return false;
        }
        let now = Instant::now();
        inner.phase = Phase::Generating { started: now };
        inner.last_event = now;
        inner.chunks_sent = 0;
        inner.total_size = 0;
        self.started.notify_one();
        true
    }

    /// Resolves after a generation cycle has started.
    pub async fn generation_started(&self) {
        self.started.notified().await
    }

    /// Notes upstream output. Output arriving outside a cycle (server-side
    /// voice activity detection) opens one; returns true in that case.
    pub fn observe_output(&self) -> bool {
        let started = self.begin_generation();
        self.inner.lock().last_event = Instant::now();
        started
    }

    pub fn add_chunk(&self, size: usize) {
        let mut inner = self.inner.lock();
        inner.chunks_sent += 1;
        inner.total_size += size as u64;
        inner.last_event = Instant::now();
    }

    /// Ends the current cycle and returns to idle.
    pub fn finish(&self) -> Option<TurnSummary> {
        let mut inner = self.inner.lock();
        let summary = match inner.phase {
            Phase::Generating { started } => Some(TurnSummary {
                elapsed: started.elapsed(),
                chunks_sent: inner.chunks_sent,
                total_size: inner.total_size,
            }),
            _ => None,
        };
        inner.phase = Phase::Idle;
        inner.chunks_sent = 0;
        inner.total_size = 0;
        summary
    }

    /// When a running generation is considered stalled.
    pub fn deadline(&self, turn_timeout: Duration) -> Option<Instant> {
        let inner = self.inner.lock();
        match inner.phase {
            Phase::Generating { .. } => Some(inner.last_event + turn_timeout),
            _ => None,
        }
    }
}

/// Everything the receive loop and the drain task of one connection share.
#[derive(Clone)]
pub struct SessionContext {
    pub state: Arc<AppState>,
    pub connection_id: ConnectionId,
    pub upstream: Arc<dyn RealtimeSession>,
    pub handle: SessionHandle,
    pub cycle: Arc<GenerationCycle>,
}

impl SessionContext {
    /// Queues a message for this connection's client.
    pub async fn send(&self, message: ServerMessage) -> bool {
        self.state.registry.send_to(self.connection_id, message).await
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        f(&mut self.handle.state.lock())
    }

    pub async fn status(&self, status: SessionStatus, message: &str) -> bool {
        self.send(ServerMessage::status(status, message)).await
    }

    /// Notes a failed call on the session. Circuit-open rejections are
    /// counted but do not advance the consecutive-failure streak.
    pub fn record_failure(&self, err: &SessionError) {
        let message = err.to_string();
        match err {
            SessionError::CircuitOpen { .. } => self.with_state(|s| s.record_rejection(message)),
            _ => self.with_state(|s| s.record_error(message)),
        }
    }

    /// Runs one call on the upstream session inside the upstream executor.
    pub async fn call_upstream<F, Fut>(&self, operation: &str, call: F) -> Result<(), SessionError>
    where
        F: Fn(Arc<dyn RealtimeSession>) -> Fut,
        Fut: Future<Output = Result<(), UpstreamError>>,
    {
        self.state
            .upstream_executor
            .execute(operation, || call(self.upstream.clone()))
            .await?;
        self.with_state(SessionState::record_success);
        Ok(())
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Consumes upstream events until the session is cancelled or the upstream
/// goes away.
pub async fn drain_events(ctx: SessionContext, mut events: mpsc::Receiver<UpstreamEvent>) {
    let turn_timeout = ctx.state.settings.turn_timeout;
    loop {
        let deadline = ctx.cycle.deadline(turn_timeout);
        tokio::select! {
            _ = ctx.handle.cancel.cancelled() => break,
            _ = ctx.cycle.generation_started(), if deadline.is_none() => {}
            _ = until(deadline) => {
                warn!(timeout_secs = turn_timeout.as_secs(), "Generation stalled, resetting turn.");
                ctx.cycle.finish();
                ctx.status(SessionStatus::TurnTimeout, "Response timed out").await;
            }
            event = events.recv() => match event {
                Some(UpstreamEvent::Closed) | None => {
                    info!("Upstream session closed.");
                    let err = SessionError::Connection("upstream session closed".into());
                    ctx.send(err.to_message()).await;
                    ctx.handle.cancel.cancel();
                    break;
                }
                Some(event) => handle_event(&ctx, event).await,
            }
        }
    }
    debug!("Event drain stopped.");
}

async fn handle_event(ctx: &SessionContext, event: UpstreamEvent) {
    match event {
        UpstreamEvent::TextDelta(content) => {
            announce_output(ctx).await;
            ctx.send(ServerMessage::TextDelta { content }).await;
        }
        UpstreamEvent::AudioDelta(pcm) => {
            announce_output(ctx).await;
            ctx.cycle.add_chunk(pcm.len());
            ctx.send(ServerMessage::audio_chunk(&pcm, UPSTREAM_OUTPUT_SAMPLE_RATE))
                .await;
        }
        UpstreamEvent::ActionRequest(request) => {
            announce_output(ctx).await;
            run_action(ctx, request).await;
        }
        UpstreamEvent::TurnComplete => end_turn(ctx, false).await,
        UpstreamEvent::Interrupted => end_turn(ctx, true).await,
        UpstreamEvent::Error(message) => {
            warn!(%message, "Upstream reported an error.");
            ctx.with_state(|s| s.record_error(message.clone()));
            let err = SessionError::Upstream(UpstreamError::Protocol(message));
            ctx.send(err.to_message()).await;
        }
        UpstreamEvent::Closed => {}
    }
}

async fn announce_output(ctx: &SessionContext) {
    if ctx.cycle.observe_output() {
        ctx.status(SessionStatus::Generating, "Generating response").await;
    }
}

async fn end_turn(ctx: &SessionContext, interrupted: bool) {
    let Some(summary) = ctx.cycle.finish() else {
        debug!(interrupted, "Turn end outside a generation cycle.");
        return;
    };
    if summary.chunks_sent > 0 {
        ctx.send(ServerMessage::AudioComplete {
            chunks_sent: summary.chunks_sent,
            total_size: summary.total_size,
        })
        .await;
    }
    ctx.send(ServerMessage::TurnComplete { interrupted }).await;
    ctx.with_state(|s| {
        s.record_response_time(summary.elapsed);
        s.record_success();
    });
    info!(
        interrupted,
        elapsed_ms = summary.elapsed.as_millis() as u64,
        chunks = summary.chunks_sent,
        "Generation cycle finished."
    );
    ctx.status(SessionStatus::Ready, "Ready").await;
}

/// Executes a device action and returns its outcome to the upstream session.
/// Failures go back upstream as a structured result, not to the client.
async fn run_action(ctx: &SessionContext, request: ActionRequest) {
    info!(action = %request.name, "Executing device action.");
    let backend = ctx.state.device_backend.clone();
    let operation = format!("device.{}", request.name);
    let outcome = ctx
        .state
        .device_executor
        .execute(&operation, || {
            let backend = backend.clone();
            let name = request.name.clone();
            let args = request.args.clone();
            async move { backend.invoke(&name, &args).await }
        })
        .await;

    let payload: Value = match outcome {
        Ok(completed) => {
            ctx.with_state(|s| {
                s.record_backend_action();
                s.record_success();
            });
            json!({ "success": true, "result": completed.value })
        }
        Err(e) => {
            let err = SessionError::from(e);
            warn!(action = %request.name, code = err.code(), error = %err, "Device action failed.");
            ctx.record_failure(&err);
            json!({ "success": false, "error": err.to_string(), "code": err.code() })
        }
    };

    let (id, name) = (request.id, request.name);
    let result = ctx
        .call_upstream("upstream.action_result", |upstream| {
            let (id, name, payload) = (id.clone(), name.clone(), payload.clone());
            async move { upstream.send_action_result(&id, &name, payload).await }
        })
        .await;
    if let Err(e) = result {
        warn!(action = %name, error = %e, "Could not return action result upstream.");
        ctx.record_failure(&e);
        ctx.send(e.to_message()).await;
    }
}
