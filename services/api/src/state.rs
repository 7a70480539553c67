//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds the shared
//! registries, resilience executors and service clients every connection uses.

use crate::config::{AudioPolicy, Config};
use crate::resilience::ResilienceExecutor;
use crate::ws::registry::ConnectionRegistry;
use crate::ws::session_state::SessionStore;
use casa_core::{
    device_backend::DeviceBackend, generic_types::VoiceConfig, realtime_api::RealtimeConnector,
};
use std::sync::Arc;
use std::time::Duration;

/// Per-connection behaviour shared by every session.
#[derive(Clone, Debug)]
pub struct SessionSettings {
    pub voice: VoiceConfig,
    pub enable_actions: bool,
    /// A generating session with no upstream event for this long is reset.
    pub turn_timeout: Duration,
    /// Upper bound on each teardown step while closing.
    pub close_grace: Duration,
    pub audio_policy: AudioPolicy,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            voice: config.voice.clone(),
            enable_actions: config.enable_actions,
            turn_timeout: config.turn_timeout,
            close_grace: Duration::from_secs(5),
            audio_policy: config.audio_policy,
        }
    }
}

/// The shared application state, created once at startup and passed to all handlers.
/// All fields are public to be accessible from other modules.
#[derive(Clone)]
pub struct AppState {
    pub settings: SessionSettings,
    pub registry: Arc<ConnectionRegistry>,
    pub sessions: Arc<SessionStore>,
    /// Guards the upstream handshake and every call on an open upstream session.
    pub upstream_executor: Arc<ResilienceExecutor>,
    /// Guards device action invocations.
    pub device_executor: Arc<ResilienceExecutor>,
    pub connector: Arc<dyn RealtimeConnector>,
    pub device_backend: Arc<dyn DeviceBackend>,
    pub system_prompt: Arc<String>,
}
