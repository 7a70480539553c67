//! Manages the primary WebSocket connection lifecycle for a client session.
//!
//! A connection moves through connecting, active, closing and closed. The
//! receive loop here owns the transport; upstream events are drained by the
//! task in `cycle`, and outbound messages are written by a dedicated writer
//! task that drains the connection's registry queue.

use super::{
    cycle::{self, GenerationCycle, SessionContext},
    protocol::{self, ClientMessage, ControlCommand, ServerMessage, SessionStatus},
    provider,
    registry::ConnectionId,
    session_state::SessionState,
};
use crate::{config::AudioPolicy, error::SessionError, state::AppState};
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use bytes::Bytes;
use casa_core::realtime_api::{UpstreamConnection, UpstreamGuard};
use futures_util::{
    SinkExt, Stream, StreamExt,
    stream::SplitSink,
};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// A transport frame, already stripped of WebSocket keep-alives.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
    Close,
}

/// What the receive loop does after dispatching a frame.
enum Flow {
    Continue,
    Close,
}

/// Axum handler to upgrade an HTTP connection to a WebSocket.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Main handler for an individual WebSocket connection.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (sink, stream) = socket.split();
    let (connection_id, outbound) = state.registry.register();
    let span = info_span!("ws_connection", %connection_id);

    let writer = tokio::spawn(write_loop(sink, outbound).instrument(span.clone()));

    let frames = stream.filter_map(|msg| async move {
        match msg {
            Ok(Message::Text(text)) => Some(Ok(Frame::Text(text.as_str().to_owned()))),
            Ok(Message::Binary(data)) => Some(Ok(Frame::Binary(data))),
            Ok(Message::Close(_)) => Some(Ok(Frame::Close)),
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => None,
            Err(e) => Some(Err(SessionError::Connection(e.to_string()))),
        }
    });
    let frames = std::pin::pin!(frames);

    run_connection(state.clone(), connection_id, frames)
        .instrument(span.clone())
        .await;

    // The registry dropped the queue on unregister, so the writer finishes
    // once it has flushed what is left.
    let grace = state.settings.close_grace;
    if tokio::time::timeout(grace, writer).await.is_err() {
        warn!(parent: &span, "Writer did not finish within the close grace period.");
    }
}

/// Drains the outbound queue onto the socket, then closes it.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<ServerMessage>,
) {
    while let Some(message) = outbound.recv().await {
        let text = protocol::serialize(&message);
        if let Err(e) = sink.send(Message::Text(text.into())).await {
            debug!(error = %e, "Socket write failed, stopping writer.");
            break;
        }
    }
    let _ = sink.close().await;
}

/// Runs one registered connection from upstream handshake to teardown.
///
/// The caller registers the connection first; this function always
/// unregisters it before returning.
pub async fn run_connection<S>(state: Arc<AppState>, connection_id: ConnectionId, mut frames: S)
where
    S: Stream<Item = Result<Frame, SessionError>> + Unpin,
{
    info!("Connection accepted, opening upstream session.");
    let established = match provider::connect_upstream(&state).await {
        Ok(established) => established,
        Err(e) => {
            error!(error = %e, code = e.code(), "Upstream session could not be established.");
            state.registry.send_to(connection_id, e.to_message()).await;
            state.registry.unregister(connection_id);
            return;
        }
    };

    let UpstreamConnection { session, events } = established.connection;
    let guard = UpstreamGuard::new(session.clone());
    let mut session_state = SessionState::new();
    for _ in 0..established.retries {
        session_state.record_connection_retry();
    }
    let handle = state.sessions.insert(connection_id, session_state);
    let ctx = SessionContext {
        state: state.clone(),
        connection_id,
        upstream: session,
        handle: handle.clone(),
        cycle: Arc::new(GenerationCycle::new()),
    };
    let mut drain = tokio::spawn(
        cycle::drain_events(ctx.clone(), events).instrument(tracing::Span::current()),
    );
    ctx.status(SessionStatus::Ready, "Session ready").await;
    info!("Session active.");

    loop {
        let frame = tokio::select! {
            _ = handle.cancel.cancelled() => {
                if state.sessions.get(connection_id).is_none() {
                    info!("Session evicted, closing connection.");
                    let err = SessionError::Connection("session evicted".into());
                    ctx.send(err.to_message()).await;
                }
                break;
            }
            frame = frames.next() => frame,
        };

        let result = match frame {
            None | Some(Ok(Frame::Close)) => {
                info!("Client closed the connection.");
                break;
            }
            Some(Err(e)) => Err(e),
            Some(Ok(frame)) => {
                state.registry.record_inbound(connection_id);
                ctx.with_state(SessionState::touch);
                dispatch(&ctx, frame).await
            }
        };

        match result {
            Ok(Flow::Continue) => {}
            Ok(Flow::Close) => break,
            Err(e) => {
                if !handle_error(&ctx, e).await {
                    break;
                }
            }
        }
    }

    // Closing
    let grace = state.settings.close_grace;
    handle.cancel.cancel();
    if tokio::time::timeout(grace, &mut drain).await.is_err() {
        warn!("Event drain did not stop in time, aborting it.");
        drain.abort();
    }
    guard.close(grace).await;
    state.registry.unregister(connection_id);
    state.sessions.remove(connection_id);
    info!("Connection closed.");
}

/// Records and reports an error. Returns false when the connection must close.
async fn handle_error(ctx: &SessionContext, err: SessionError) -> bool {
    if err.is_disconnect() {
        info!(error = %err, "Transport gone, closing.");
        if !matches!(err, SessionError::Connection(_)) {
            ctx.send(err.to_message()).await;
        }
        return false;
    }

    match &err {
        SessionError::MessageParsing(_)
        | SessionError::GenerationInProgress
        | SessionError::Broadcast(_) => debug!(code = err.code(), error = %err, "Request rejected."),
        _ => {
            warn!(code = err.code(), error = %err, "Request failed.");
            ctx.record_failure(&err);
        }
    }
    ctx.send(err.to_message()).await;

    let recoverable = err.is_recoverable();
    if !recoverable {
        error!(code = err.code(), "Unrecoverable error, closing connection.");
    }
    recoverable
}

fn check_generation(ctx: &SessionContext) -> Result<(), SessionError> {
    if ctx.state.settings.audio_policy == AudioPolicy::Block && ctx.cycle.is_generating() {
        Err(SessionError::GenerationInProgress)
    } else {
        Ok(())
    }
}

async fn dispatch(ctx: &SessionContext, frame: Frame) -> Result<Flow, SessionError> {
    let inbound = match frame {
        Frame::Text(raw) => protocol::parse(&raw)?,
        Frame::Binary(data) => protocol::parse_binary(data)?,
        Frame::Close => return Ok(Flow::Close),
    };
    let started = Instant::now();

    match inbound.body {
        ClientMessage::Text { content } => {
            check_generation(ctx)?;
            let announce = ctx.cycle.begin_generation();
            let forwarded = ctx
                .call_upstream("upstream.send_text", |upstream| {
                    let content = content.clone();
                    async move { upstream.send_text(&content, true).await }
                })
                .await;
            if let Err(e) = forwarded {
                ctx.cycle.finish();
                return Err(e);
            }
            ctx.send(ServerMessage::Response {
                content: format!("Echo: {content}"),
                correlation_id: Some(inbound.correlation_id.unwrap_or(inbound.message_id)),
                processing_time_ms: started.elapsed().as_millis() as u64,
            })
            .await;
            if announce {
                ctx.status(SessionStatus::Generating, "Generating response")
                    .await;
            }
        }
        ClientMessage::AudioChunk {
            pcm, sample_rate, ..
        } => {
            check_generation(ctx)?;
            if sample_rate != protocol::DEFAULT_SAMPLE_RATE {
                debug!(sample_rate, "Forwarding audio with a non-default sample rate.");
            }
            let size = pcm.len();
            ctx.call_upstream("upstream.send_audio", |upstream| {
                let pcm = pcm.clone();
                async move { upstream.send_audio(pcm).await }
            })
            .await?;
            ctx.with_state(|s| s.record_audio_chunk(size));
            if ctx.cycle.begin_recording() {
                ctx.status(SessionStatus::Recording, "Recording").await;
            }
            ctx.send(ServerMessage::AudioReceived { size_bytes: size })
                .await;
        }
        ClientMessage::Ping { data } => {
            ctx.send(ServerMessage::Pong { data }).await;
        }
        ClientMessage::Control { command } => return control(ctx, command).await,
        ClientMessage::BroadcastRequest {
            message,
            exclude_sender,
            targets,
        } => broadcast(ctx, message, exclude_sender, targets).await?,
        ClientMessage::ConnectionInfoRequest => {
            let info = ctx
                .state
                .registry
                .connection_info(ctx.connection_id)
                .ok_or_else(|| SessionError::Connection("connection no longer registered".into()))?;
            ctx.send(ServerMessage::ConnectionInfo {
                total_connections: info.total_connections,
                your_id: ctx.connection_id.to_string(),
                connected_at: info.connected_at,
                message_count: info.message_count,
                last_activity: info.last_activity,
            })
            .await;
        }
    }
    Ok(Flow::Continue)
}

async fn control(ctx: &SessionContext, command: ControlCommand) -> Result<Flow, SessionError> {
    debug!(?command, "Control command.");
    match command {
        ControlCommand::StartRecording => {
            check_generation(ctx)?;
            ctx.cycle.begin_recording();
            ctx.status(SessionStatus::Recording, "Recording started")
                .await;
        }
        ControlCommand::StopRecording => {
            ctx.call_upstream("upstream.end_audio_turn", |upstream| async move {
                upstream.end_audio_turn().await
            })
            .await?;
            ctx.cycle.begin_generation();
            ctx.status(SessionStatus::Generating, "Generating response")
                .await;
        }
        ControlCommand::EndSession => {
            info!("Client ended the session.");
            return Ok(Flow::Close);
        }
    }
    Ok(Flow::Continue)
}

async fn broadcast(
    ctx: &SessionContext,
    message: String,
    exclude_sender: bool,
    targets: Option<Vec<String>>,
) -> Result<(), SessionError> {
    let registry = &ctx.state.registry;
    let outbound = ServerMessage::Broadcast {
        message,
        sender_id: ctx.connection_id.to_string(),
    };

    let outcome = match targets {
        Some(targets) => {
            let (ids, invalid): (Vec<_>, Vec<_>) = targets
                .iter()
                .map(|t| t.parse::<ConnectionId>())
                .partition(Result::is_ok);
            let ids: Vec<ConnectionId> = ids.into_iter().flatten().collect();
            let mut outcome = registry.send_to_targets(&outbound, &ids).await;
            outcome.failed += invalid.len();
            outcome
        }
        None => {
            let mut exclude = HashSet::new();
            if exclude_sender {
                exclude.insert(ctx.connection_id);
            }
            registry.broadcast(&outbound, &exclude).await
        }
    };

    info!(
        delivered = outcome.delivered,
        failed = outcome.failed,
        "Broadcast sent."
    );
    if outcome.failed > outcome.delivered {
        return Err(SessionError::Broadcast(format!(
            "{} of {} recipients could not be reached",
            outcome.failed,
            outcome.delivered + outcome.failed
        )));
    }
    ctx.send(ServerMessage::BroadcastConfirmation {
        recipient_count: outcome.delivered,
        failed_count: outcome.failed,
    })
    .await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::CircuitState;
    use crate::ws::testing::{Call, FakeConnector, Harness, MockBackend, fast_retry, test_state};
    use casa_core::device_backend::{DeviceBackend, DeviceError, MockDeviceBackend};
    use casa_core::generic_types::{ActionRequest, UpstreamEvent};
    use casa_core::realtime_api::UpstreamError;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn mock_backend() -> Arc<dyn DeviceBackend> {
        Arc::new(MockDeviceBackend)
    }

    async fn ready(harness: &mut Harness) {
        let first = harness.next().await;
        assert_eq!(
            first,
            ServerMessage::status(SessionStatus::Ready, "Session ready")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_text_is_echoed_and_forwarded() {
        let connector = FakeConnector::new();
        let state = test_state(connector.clone(), mock_backend(), fast_retry(3));
        let mut harness = Harness::start(state);
        ready(&mut harness).await;

        harness
            .send_json(json!({ "type": "text", "content": "hi", "id": "m1" }))
            .await;

        match harness.next().await {
            ServerMessage::Response {
                content,
                correlation_id,
                processing_time_ms,
            } => {
                assert_eq!(content, "Echo: hi");
                assert_eq!(correlation_id.as_deref(), Some("m1"));
                assert_eq!(processing_time_ms, 0);
            }
            other => panic!("expected a response, got {other:?}"),
        }
        assert_eq!(
            harness.next().await,
            ServerMessage::status(SessionStatus::Generating, "Generating response")
        );
        assert_eq!(
            connector.session.calls(),
            vec![Call::Text("hi".to_string(), true)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_message_keeps_connection_open() {
        let connector = FakeConnector::new();
        let state = test_state(connector, mock_backend(), fast_retry(3));
        let mut harness = Harness::start(state.clone());
        ready(&mut harness).await;

        harness.send(Frame::Text("{not json".to_string())).await;
        let (code, _) = harness.next_error().await;
        assert_eq!(code, "MESSAGE_PARSING_ERROR");

        harness
            .send_json(json!({ "type": "ping", "data": { "n": 1 } }))
            .await;
        assert_eq!(
            harness.next().await,
            ServerMessage::Pong {
                data: Some(json!({ "n": 1 }))
            }
        );
        let session = state.sessions.get(harness.id).unwrap();
        assert_eq!(session.state.lock().error_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_upstream_failures_make_session_evictable() {
        let connector = FakeConnector::new();
        connector.session.fail_next([
            UpstreamError::Transport("reset".into()),
            UpstreamError::Transport("reset".into()),
            UpstreamError::Transport("reset".into()),
        ]);
        let state = test_state(connector, mock_backend(), fast_retry(1));
        let mut harness = Harness::start(state.clone());
        ready(&mut harness).await;

        for _ in 0..3 {
            harness
                .send(Frame::Binary(Bytes::from_static(&[0u8; 320])))
                .await;
            let (code, _) = harness.next_error().await;
            assert_eq!(code, "UPSTREAM_ERROR");
        }

        let session = state.sessions.get(harness.id).unwrap();
        {
            let s = session.state.lock();
            assert!(!s.is_healthy());
            assert_eq!(s.error_count, 3);
            assert!(s.should_evict(Duration::from_secs(3600), None));
        }

        let evicted = state.sessions.sweep(Duration::from_secs(3600), None);
        assert_eq!(evicted.len(), 1);
        assert!(state.sessions.sweep(Duration::from_secs(3600), None).is_empty());

        let (code, message) = harness.next_error().await;
        assert_eq!(code, "CONNECTION_ERROR");
        assert!(message.contains("evicted"));
        harness.task.await.unwrap();
        assert!(!state.registry.is_registered(harness.id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_is_reported_without_eviction() {
        let connector = FakeConnector::new();
        let state = test_state(connector.clone(), mock_backend(), fast_retry(1));
        let mut harness = Harness::start(state.clone());
        ready(&mut harness).await;

        for _ in 0..5 {
            let _ = state
                .upstream_executor
                .execute("upstream.other_session", || async {
                    Err::<(), _>(UpstreamError::Transport("reset".into()))
                })
                .await;
        }
        assert_eq!(state.upstream_executor.breaker().state(), CircuitState::Open);

        for _ in 0..3 {
            harness
                .send(Frame::Binary(Bytes::from_static(&[0u8; 320])))
                .await;
            let (code, _) = harness.next_error().await;
            assert_eq!(code, "CIRCUIT_BREAKER_OPEN");
        }

        {
            let session = state.sessions.get(harness.id).unwrap();
            let s = session.state.lock();
            assert!(s.is_healthy());
            assert_eq!(s.error_count, 3);
        }
        assert!(state.sessions.sweep(Duration::from_secs(3600), None).is_empty());
        assert!(state.registry.is_registered(harness.id));

        harness.send_json(json!({ "type": "ping" })).await;
        assert_eq!(harness.next().await, ServerMessage::Pong { data: None });
        assert!(connector.session.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_device_circuit_is_returned_upstream() {
        let connector = FakeConnector::new();
        let state = test_state(connector.clone(), mock_backend(), fast_retry(3));
        let mut harness = Harness::start(state.clone());
        ready(&mut harness).await;

        for _ in 0..5 {
            let _ = state
                .device_executor
                .execute("device.light_control", || async {
                    Err::<(), _>(DeviceError::NotFound("light.attic".into()))
                })
                .await;
        }
        assert_eq!(state.device_executor.breaker().state(), CircuitState::Open);

        for n in 0..3 {
            connector
                .events
                .send(UpstreamEvent::ActionRequest(ActionRequest {
                    id: format!("call-{n}"),
                    name: "light_control".into(),
                    args: json!({ "entity_id": "light.kitchen", "action": "turn_on" }),
                }))
                .await
                .unwrap();
        }
        connector.events.send(UpstreamEvent::TurnComplete).await.unwrap();
        harness
            .next_where(|m| matches!(m, ServerMessage::TurnComplete { .. }))
            .await;

        let calls = connector.session.calls();
        assert_eq!(calls.len(), 3);
        for call in calls {
            match call {
                Call::ActionResult { result, .. } => {
                    assert_eq!(result["success"], json!(false));
                    assert_eq!(result["code"], json!("CIRCUIT_BREAKER_OPEN"));
                }
                other => panic!("unexpected upstream call: {other:?}"),
            }
        }
        let session = state.sessions.get(harness.id).unwrap();
        let s = session.state.lock();
        assert!(s.is_healthy());
        assert_eq!(s.error_count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_action_retries_then_reports_success_upstream() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut backend = MockBackend::new();
        let counter = calls.clone();
        backend
            .expect_invoke()
            .withf(|action, _| action.to_string() == "light_control")
            .times(3)
            .returning(move |_, _| {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(DeviceError::Timeout)
                } else {
                    Ok(json!({ "state": "on" }))
                }
            });

        let connector = FakeConnector::new();
        let state = test_state(connector.clone(), Arc::new(backend), fast_retry(3));
        let mut harness = Harness::start(state.clone());
        ready(&mut harness).await;

        connector
            .events
            .send(UpstreamEvent::ActionRequest(ActionRequest {
                id: "call-1".into(),
                name: "light_control".into(),
                args: json!({ "entity_id": "light.kitchen", "action": "turn_on" }),
            }))
            .await
            .unwrap();
        connector.events.send(UpstreamEvent::TurnComplete).await.unwrap();

        harness
            .next_where(|m| matches!(m, ServerMessage::TurnComplete { .. }))
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let snapshot = state.device_executor.breaker().snapshot();
        assert_eq!(snapshot.total_successes, 1);
        assert_eq!(snapshot.total_failures, 0);

        let session = state.sessions.get(harness.id).unwrap();
        {
            let s = session.state.lock();
            assert_eq!(s.error_count, 0);
            assert_eq!(s.backend_actions, 1);
        }
        assert_eq!(
            connector.session.calls(),
            vec![Call::ActionResult {
                id: "call-1".into(),
                name: "light_control".into(),
                result: json!({ "success": true, "result": { "state": "on" } }),
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_action_is_returned_as_failure() {
        let mut backend = MockBackend::new();
        backend
            .expect_invoke()
            .times(1)
            .returning(|action, _| Err(DeviceError::UnknownAction(action.to_string())));

        let connector = FakeConnector::new();
        let state = test_state(connector.clone(), Arc::new(backend), fast_retry(3));
        let mut harness = Harness::start(state.clone());
        ready(&mut harness).await;

        connector
            .events
            .send(UpstreamEvent::ActionRequest(ActionRequest {
                id: "call-2".into(),
                name: "open_portal".into(),
                args: json!({}),
            }))
            .await
            .unwrap();
        connector.events.send(UpstreamEvent::TurnComplete).await.unwrap();
        harness
            .next_where(|m| matches!(m, ServerMessage::TurnComplete { .. }))
            .await;

        match connector.session.calls().as_slice() {
            [Call::ActionResult { result, .. }] => {
                assert_eq!(result["success"], json!(false));
                assert_eq!(result["code"], json!("BACKEND_ACTION_ERROR"));
                assert!(result["error"].as_str().unwrap().contains("open_portal"));
            }
            other => panic!("unexpected upstream calls: {other:?}"),
        }
        let session = state.sessions.get(harness.id).unwrap();
        assert_eq!(session.state.lock().error_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_streamed_turn_reports_audio_complete() {
        let connector = FakeConnector::new();
        let state = test_state(connector.clone(), mock_backend(), fast_retry(3));
        let mut harness = Harness::start(state);
        ready(&mut harness).await;

        for event in [
            UpstreamEvent::TextDelta("Turning on".into()),
            UpstreamEvent::AudioDelta(Bytes::from_static(&[1u8; 480])),
            UpstreamEvent::AudioDelta(Bytes::from_static(&[2u8; 240])),
            UpstreamEvent::TurnComplete,
        ] {
            connector.events.send(event).await.unwrap();
        }

        assert_eq!(
            harness.next().await,
            ServerMessage::status(SessionStatus::Generating, "Generating response")
        );
        assert_eq!(
            harness.next().await,
            ServerMessage::TextDelta {
                content: "Turning on".into()
            }
        );
        assert!(matches!(
            harness.next().await,
            ServerMessage::AudioChunk { sample_rate: 24_000, .. }
        ));
        assert!(matches!(harness.next().await, ServerMessage::AudioChunk { .. }));
        assert_eq!(
            harness.next().await,
            ServerMessage::AudioComplete {
                chunks_sent: 2,
                total_size: 720
            }
        );
        assert_eq!(
            harness.next().await,
            ServerMessage::TurnComplete { interrupted: false }
        );
        assert_eq!(
            harness.next().await,
            ServerMessage::status(SessionStatus::Ready, "Ready")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_audio_blocked_while_generating() {
        let connector = FakeConnector::new();
        let state = test_state(connector.clone(), mock_backend(), fast_retry(3));
        let mut harness = Harness::start(state);
        ready(&mut harness).await;

        harness
            .send_json(json!({ "type": "text", "content": "what time is it" }))
            .await;
        harness
            .next_where(|m| matches!(m, ServerMessage::StatusUpdate { .. }))
            .await;

        harness
            .send(Frame::Binary(Bytes::from_static(&[0u8; 160])))
            .await;
        let (code, _) = harness.next_error().await;
        assert_eq!(code, "GENERATION_IN_PROGRESS");
        assert_eq!(connector.session.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_generation_times_out() {
        let connector = FakeConnector::new();
        let state = test_state(connector.clone(), mock_backend(), fast_retry(3));
        let mut harness = Harness::start(state);
        ready(&mut harness).await;

        harness
            .send_json(json!({ "type": "control", "command": "stop_recording" }))
            .await;
        assert_eq!(
            harness.next().await,
            ServerMessage::status(SessionStatus::Generating, "Generating response")
        );
        assert_eq!(
            harness.next().await,
            ServerMessage::status(SessionStatus::TurnTimeout, "Response timed out")
        );
        assert_eq!(connector.session.calls(), vec![Call::EndTurn]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upstream_close_ends_connection() {
        let connector = FakeConnector::new();
        let state = test_state(connector.clone(), mock_backend(), fast_retry(3));
        let mut harness = Harness::start(state.clone());
        ready(&mut harness).await;

        connector.events.send(UpstreamEvent::Closed).await.unwrap();
        let (code, _) = harness.next_error().await;
        assert_eq!(code, "CONNECTION_ERROR");

        harness.task.await.unwrap();
        assert_eq!(connector.session.closes.load(Ordering::SeqCst), 1);
        assert!(state.sessions.is_empty());
        assert!(!state.registry.is_registered(harness.id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_session_closes_gracefully() {
        let connector = FakeConnector::new();
        let state = test_state(connector.clone(), mock_backend(), fast_retry(3));
        let mut harness = Harness::start(state.clone());
        ready(&mut harness).await;

        harness
            .send_json(json!({ "type": "control", "command": "end_session" }))
            .await;
        harness.task.await.unwrap();

        assert_eq!(connector.session.closes.load(Ordering::SeqCst), 1);
        assert!(state.sessions.is_empty());
        assert_eq!(state.registry.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_handshake_failure_aborts_before_session() {
        let connector = FakeConnector::new();
        connector
            .connect_failures
            .lock()
            .push_back(UpstreamError::Auth("bad key".into()));
        let state = test_state(connector.clone(), mock_backend(), fast_retry(3));
        let mut harness = Harness::start(state.clone());

        let (code, _) = harness.next_error().await;
        assert_eq!(code, "SECURITY_ERROR");
        harness.task.await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert!(state.sessions.is_empty());
        assert!(!state.registry.is_registered(harness.id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_retries_are_recorded() {
        let connector = FakeConnector::new();
        connector
            .connect_failures
            .lock()
            .push_back(UpstreamError::Transport("refused".into()));
        let state = test_state(connector.clone(), mock_backend(), fast_retry(3));
        let mut harness = Harness::start(state.clone());
        ready(&mut harness).await;

        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        let session = state.sessions.get(harness.id).unwrap();
        assert_eq!(session.state.lock().connection_retries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_targeted_broadcast() {
        let connector = FakeConnector::new();
        let state = test_state(connector, mock_backend(), fast_retry(3));
        let (peer, mut peer_rx) = state.registry.register();
        let mut harness = Harness::start(state.clone());
        ready(&mut harness).await;

        harness
            .send_json(json!({
                "type": "broadcast_request",
                "message": "dinner is ready",
                "targets": [peer.to_string(), "not-a-connection"],
            }))
            .await;

        assert_eq!(
            harness.next().await,
            ServerMessage::BroadcastConfirmation {
                recipient_count: 1,
                failed_count: 1
            }
        );
        assert_eq!(
            peer_rx.recv().await.unwrap(),
            ServerMessage::Broadcast {
                message: "dinner is ready".into(),
                sender_id: harness.id.to_string(),
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_mostly_failed_is_an_error() {
        let connector = FakeConnector::new();
        let state = test_state(connector, mock_backend(), fast_retry(3));
        let mut harness = Harness::start(state);
        ready(&mut harness).await;

        harness
            .send_json(json!({
                "type": "broadcast_request",
                "message": "anyone?",
                "targets": ["bogus-1", "bogus-2"],
            }))
            .await;
        let (code, _) = harness.next_error().await;
        assert_eq!(code, "BROADCAST_ERROR");
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_info() {
        let connector = FakeConnector::new();
        let state = test_state(connector, mock_backend(), fast_retry(3));
        let mut harness = Harness::start(state);
        ready(&mut harness).await;

        harness
            .send_json(json!({ "type": "connection_info_request" }))
            .await;
        match harness.next().await {
            ServerMessage::ConnectionInfo {
                total_connections,
                your_id,
                message_count,
                ..
            } => {
                assert_eq!(total_connections, 1);
                assert_eq!(your_id, harness.id.to_string());
                assert_eq!(message_count, 1);
            }
            other => panic!("expected connection info, got {other:?}"),
        }
    }
}
