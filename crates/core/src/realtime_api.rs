//! Upstream Streaming Session Contract
//!
//! This module defines what the session layer requires from a real-time
//! conversational service: a connector that performs the handshake and a
//! session handle that accepts audio, text and action results. Events flowing
//! back from the service are delivered through a bounded channel rather than
//! callbacks, so a slow client cannot force unbounded buffering.

use crate::generic_types::{SessionConfig, UpstreamEvent};
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Failures reported by an upstream streaming session.
#[derive(Debug, Clone, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream rejected credentials: {0}")]
    Auth(String),
    #[error("upstream configuration rejected: {0}")]
    Config(String),
    #[error("upstream rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("upstream call timed out")]
    Timeout,
    #[error("upstream connection closed: {0}")]
    Disconnected(String),
    #[error("upstream transport error: {0}")]
    Transport(String),
    #[error("upstream protocol error: {0}")]
    Protocol(String),
}

/// An established upstream session together with its event stream.
pub struct UpstreamConnection {
    pub session: Arc<dyn RealtimeSession>,
    pub events: mpsc::Receiver<UpstreamEvent>,
}

/// Opens upstream streaming sessions.
#[async_trait]
pub trait RealtimeConnector: Send + Sync {
    /// Performs the full handshake. The returned session is ready for input.
    async fn connect(&self, config: &SessionConfig) -> Result<UpstreamConnection, UpstreamError>;
}

/// A live upstream streaming session.
///
/// All methods take `&self` so the receive loop and the event drain of one
/// connection can share the handle.
#[async_trait]
pub trait RealtimeSession: Send + Sync {
    /// Streams one chunk of PCM audio as realtime input.
    async fn send_audio(&self, pcm: Bytes) -> Result<(), UpstreamError>;

    /// Sends a user text turn.
    async fn send_text(&self, text: &str, turn_complete: bool) -> Result<(), UpstreamError>;

    /// Signals that the user finished speaking so the upstream may respond.
    async fn end_audio_turn(&self) -> Result<(), UpstreamError>;

    /// Returns the outcome of a device action the upstream asked for.
    async fn send_action_result(
        &self,
        id: &str,
        name: &str,
        result: Value,
    ) -> Result<(), UpstreamError>;

    /// Closes the session. Closing twice is a no-op.
    async fn close(&self) -> Result<(), UpstreamError>;
}

/// Owns an upstream session and guarantees it is released.
///
/// Call [`UpstreamGuard::close`] on the orderly path. If the guard is dropped
/// without that (error, panic or task cancellation) the close is spawned onto
/// the current runtime instead.
pub struct UpstreamGuard {
    session: Option<Arc<dyn RealtimeSession>>,
}

impl UpstreamGuard {
    pub fn new(session: Arc<dyn RealtimeSession>) -> Self {
        Self {
            session: Some(session),
        }
    }

    /// Closes the session, waiting at most `grace`.
    pub async fn close(mut self, grace: Duration) {
        if let Some(session) = self.session.take() {
            match tokio::time::timeout(grace, session.close()).await {
                Ok(Ok(())) => debug!("Upstream session closed."),
                Ok(Err(e)) => warn!(error = %e, "Upstream session close reported an error."),
                Err(_) => warn!("Upstream session close timed out."),
            }
        }
    }
}

impl Drop for UpstreamGuard {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if let Err(e) = session.close().await {
                            warn!(error = %e, "Deferred upstream close failed.");
                        }
                    });
                }
                Err(_) => warn!("Upstream guard dropped outside a runtime; session not closed."),
            }
        }
    }
}
