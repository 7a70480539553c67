use bytes::Bytes;
use serde_json::Value;

/// Voice rendering options passed to the upstream session at connect time.
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceConfig {
    pub voice_name: String,
    pub language_code: String,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            voice_name: "Aoede".to_string(),
            language_code: "en-US".to_string(),
        }
    }
}

/// Generic configuration for establishing an upstream streaming session.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub system_prompt: String,
    pub voice: VoiceConfig,
    /// Whether device actions are advertised to the upstream session.
    pub enable_actions: bool,
}

/// A device action requested by the upstream session in the middle of a turn.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionRequest {
    /// Upstream-assigned call id, echoed back with the result.
    pub id: String,
    pub name: String,
    pub args: Value,
}

/// Events any upstream streaming session can emit back to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    /// A fragment of generated text.
    TextDelta(String),
    /// A fragment of generated PCM audio.
    AudioDelta(Bytes),
    /// The upstream wants a device action executed before it continues.
    ActionRequest(ActionRequest),
    /// The current generation turn finished normally.
    TurnComplete,
    /// The current generation turn was cut short by the upstream.
    Interrupted,
    /// A non-fatal error reported by the upstream.
    Error(String),
    /// The upstream connection is gone.
    Closed,
}
