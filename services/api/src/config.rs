use crate::resilience::{CircuitBreakerConfig, RetryPolicy};
use casa_core::generic_types::VoiceConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Which device backend executes actions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceBackendKind {
    HomeAssistant { url: String, token: String },
    Mock,
}

/// What happens to client audio and text while a response is being generated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AudioPolicy {
    /// Reject with `GENERATION_IN_PROGRESS`.
    Block,
    /// Forward to the upstream session anyway.
    Allow,
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub log_level: Level,
    pub gemini_api_key: String,
    pub gemini_model: String,
    pub voice: VoiceConfig,
    pub prompts_path: PathBuf,
    pub device_backend: DeviceBackendKind,
    pub enable_actions: bool,
    pub retry: RetryPolicy,
    pub circuit: CircuitBreakerConfig,
    pub call_timeout: Duration,
    pub turn_timeout: Duration,
    pub session_max_age: Duration,
    pub session_max_idle: Option<Duration>,
    pub sweep_interval: Duration,
    pub metadata_retention: Duration,
    pub outbound_queue_capacity: usize,
    pub audio_policy: AudioPolicy,
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T>(name: &str, default: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = var_or(name, default);
    raw.trim()
        .parse::<T>()
        .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("'{raw}': {e}")))
}

fn parse_positive(name: &str, default: &str) -> Result<u64, ConfigError> {
    match parse_var::<u64>(name, default)? {
        0 => Err(ConfigError::InvalidValue(
            name.to_string(),
            "must be greater than zero".to_string(),
        )),
        n => Ok(n),
    }
}

fn minutes(name: &str, value: u64) -> Result<Duration, ConfigError> {
    value
        .checked_mul(60)
        .map(Duration::from_secs)
        .ok_or_else(|| ConfigError::InvalidValue(name.to_string(), "too many minutes".to_string()))
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address = parse_var::<SocketAddr>("BIND_ADDRESS", "0.0.0.0:3000")?;

        let log_level_str = var_or("RUST_LOG", "INFO");
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let gemini_api_key = std::env::var("GEMINI_API_KEY")
            .ok()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ConfigError::MissingVar("GEMINI_API_KEY".to_string()))?;
        let gemini_model = var_or("GEMINI_MODEL", "models/gemini-2.0-flash-exp");

        let defaults = VoiceConfig::default();
        let voice = VoiceConfig {
            voice_name: var_or("VOICE_NAME", &defaults.voice_name),
            language_code: var_or("LANGUAGE_CODE", &defaults.language_code),
        };

        let prompts_path = std::env::var("PROMPTS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./prompts"));

        let device_backend = match var_or("DEVICE_BACKEND", "home_assistant")
            .to_lowercase()
            .as_str()
        {
            "mock" => DeviceBackendKind::Mock,
            "home_assistant" => DeviceBackendKind::HomeAssistant {
                url: std::env::var("HA_URL").map_err(|_| {
                    ConfigError::MissingVar(
                        "HA_URL must be set for the 'home_assistant' backend".to_string(),
                    )
                })?,
                token: std::env::var("HA_TOKEN").map_err(|_| {
                    ConfigError::MissingVar(
                        "HA_TOKEN must be set for the 'home_assistant' backend".to_string(),
                    )
                })?,
            },
            other => {
                return Err(ConfigError::InvalidValue(
                    "DEVICE_BACKEND".to_string(),
                    format!("'{other}' is not one of home_assistant, mock"),
                ));
            }
        };

        let retry = RetryPolicy {
            max_attempts: parse_positive("RETRY_MAX_ATTEMPTS", "3")? as u32,
            base_delay: Duration::from_millis(parse_var("RETRY_BASE_DELAY_MS", "500")?),
            max_delay: Duration::from_millis(parse_var("RETRY_MAX_DELAY_MS", "10000")?),
            backoff_multiplier: parse_var("RETRY_BACKOFF_MULTIPLIER", "2.0")?,
            jitter: parse_var("RETRY_JITTER", "true")?,
        };
        if retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::InvalidValue(
                "RETRY_BACKOFF_MULTIPLIER".to_string(),
                "must be at least 1.0".to_string(),
            ));
        }

        let circuit = CircuitBreakerConfig {
            failure_threshold: parse_positive("CIRCUIT_FAILURE_THRESHOLD", "5")? as u32,
            recovery_timeout: Duration::from_secs(parse_var(
                "CIRCUIT_RECOVERY_TIMEOUT_SECS",
                "30",
            )?),
            half_open_max_calls: parse_positive("CIRCUIT_HALF_OPEN_MAX_CALLS", "3")? as u32,
        };

        let session_max_idle = match std::env::var("SESSION_MAX_IDLE_MINS") {
            Ok(_) => Some(minutes(
                "SESSION_MAX_IDLE_MINS",
                parse_positive("SESSION_MAX_IDLE_MINS", "")?,
            )?),
            Err(_) => None,
        };

        let audio_policy = match var_or("AUDIO_DURING_GENERATION", "block")
            .to_lowercase()
            .as_str()
        {
            "block" => AudioPolicy::Block,
            "allow" => AudioPolicy::Allow,
            other => {
                return Err(ConfigError::InvalidValue(
                    "AUDIO_DURING_GENERATION".to_string(),
                    format!("'{other}' is not one of block, allow"),
                ));
            }
        };

        Ok(Self {
            bind_address,
            log_level,
            gemini_api_key,
            gemini_model,
            voice,
            prompts_path,
            device_backend,
            enable_actions: parse_var("ENABLE_ACTIONS", "true")?,
            retry,
            circuit,
            call_timeout: Duration::from_millis(parse_positive("CALL_TIMEOUT_MS", "10000")?),
            turn_timeout: Duration::from_secs(parse_positive("TURN_TIMEOUT_SECS", "8")?),
            session_max_age: minutes(
                "SESSION_MAX_AGE_MINS",
                parse_positive("SESSION_MAX_AGE_MINS", "30")?,
            )?,
            session_max_idle,
            sweep_interval: Duration::from_secs(parse_positive(
                "SESSION_SWEEP_INTERVAL_SECS",
                "60",
            )?),
            metadata_retention: minutes(
                "CONNECTION_METADATA_RETENTION_MINS",
                parse_var::<u64>("CONNECTION_METADATA_RETENTION_MINS", "60")?,
            )?,
            outbound_queue_capacity: parse_positive("OUTBOUND_QUEUE_CAPACITY", "64")? as usize,
            audio_policy,
        })
    }
}
