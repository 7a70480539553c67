//! Establishes upstream streaming sessions for new connections.

pub mod gemini;

use crate::{error::SessionError, state::AppState};
use casa_core::{generic_types::SessionConfig, realtime_api::UpstreamConnection};
use tracing::info;

/// Sample rate of the PCM audio produced by the upstream session.
pub const UPSTREAM_OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// An upstream session opened through the upstream executor.
pub struct Established {
    pub connection: UpstreamConnection,
    /// Attempts beyond the first that the handshake needed.
    pub retries: u32,
}

/// Performs the upstream handshake inside the retry and circuit-breaker envelope.
pub async fn connect_upstream(state: &AppState) -> Result<Established, SessionError> {
    let config = SessionConfig {
        system_prompt: state.system_prompt.to_string(),
        voice: state.settings.voice.clone(),
        enable_actions: state.settings.enable_actions,
    };
    let connector = state.connector.clone();

    let completed = state
        .upstream_executor
        .execute("upstream.connect", || {
            let connector = connector.clone();
            let config = config.clone();
            async move { connector.connect(&config).await }
        })
        .await?;

    info!(attempts = completed.attempts, "Upstream session established.");
    Ok(Established {
        connection: completed.value,
        retries: completed.attempts.saturating_sub(1),
    })
}
