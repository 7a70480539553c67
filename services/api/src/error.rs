//! Session Error Taxonomy
//!
//! Every failure a connection can observe is folded into [`SessionError`].
//! Each variant carries a stable wire code and says whether the connection
//! survives it.

use crate::resilience::{Classify, Failure, ResilienceError, RetryClass};
use crate::ws::protocol::{MessageParsingError, ServerMessage};
use casa_core::{device_backend::DeviceError, realtime_api::UpstreamError};
use serde_json::{Value, json};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("could not parse message: {0}")]
    MessageParsing(#[from] MessageParsingError),
    #[error("upstream call failed: {0}")]
    Upstream(UpstreamError),
    #[error("device action failed: {0}")]
    BackendAction(String),
    #[error("service temporarily unavailable, retry in {}s", .retry_in.as_secs())]
    CircuitOpen { retry_in: Duration },
    #[error("security error: {0}")]
    Security(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("a response is still being generated")]
    GenerationInProgress,
    #[error("broadcast failed: {0}")]
    Broadcast(String),
}

impl SessionError {
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::Connection(_) => "CONNECTION_ERROR",
            SessionError::MessageParsing(_) => "MESSAGE_PARSING_ERROR",
            SessionError::Upstream(_) => "UPSTREAM_ERROR",
            SessionError::BackendAction(_) => "BACKEND_ACTION_ERROR",
            SessionError::CircuitOpen { .. } => "CIRCUIT_BREAKER_OPEN",
            SessionError::Security(_) => "SECURITY_ERROR",
            SessionError::Configuration(_) => "CONFIGURATION_ERROR",
            SessionError::GenerationInProgress => "GENERATION_IN_PROGRESS",
            SessionError::Broadcast(_) => "BROADCAST_ERROR",
        }
    }

    /// False when the connection should move to closing.
    pub fn is_recoverable(&self) -> bool {
        match self {
            SessionError::Connection(_)
            | SessionError::Security(_)
            | SessionError::Configuration(_) => false,
            SessionError::Upstream(e) => e.class() == RetryClass::Retriable,
            SessionError::MessageParsing(_)
            | SessionError::BackendAction(_)
            | SessionError::CircuitOpen { .. }
            | SessionError::GenerationInProgress
            | SessionError::Broadcast(_) => true,
        }
    }

    /// Transport-level failures that skip the retry envelope entirely.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            SessionError::Connection(_) | SessionError::Upstream(UpstreamError::Disconnected(_))
        )
    }

    fn details(&self) -> Option<Value> {
        match self {
            SessionError::MessageParsing(e) => Some(json!({ "preview": e.preview })),
            SessionError::CircuitOpen { retry_in } => {
                Some(json!({ "retry_after_secs": retry_in.as_secs_f64().ceil() as u64 }))
            }
            _ => None,
        }
    }

    /// The `error` frame reported to the client.
    pub fn to_message(&self) -> ServerMessage {
        ServerMessage::Error {
            code: self.code().to_string(),
            message: self.to_string(),
            details: self.details(),
        }
    }
}

impl From<UpstreamError> for SessionError {
    fn from(e: UpstreamError) -> Self {
        match e {
            UpstreamError::Auth(msg) => SessionError::Security(msg),
            UpstreamError::Config(msg) => SessionError::Configuration(msg),
            other => SessionError::Upstream(other),
        }
    }
}

impl From<ResilienceError<UpstreamError>> for SessionError {
    fn from(e: ResilienceError<UpstreamError>) -> Self {
        match e {
            ResilienceError::CircuitOpen { retry_in } => SessionError::CircuitOpen { retry_in },
            ResilienceError::Fatal(e) => e.into(),
            ResilienceError::Exhausted { last, .. } => match last {
                Failure::Operation(e) => e.into(),
                Failure::Timeout => SessionError::Upstream(UpstreamError::Timeout),
            },
        }
    }
}

impl From<ResilienceError<DeviceError>> for SessionError {
    fn from(e: ResilienceError<DeviceError>) -> Self {
        match e {
            ResilienceError::CircuitOpen { retry_in } => SessionError::CircuitOpen { retry_in },
            ResilienceError::Fatal(DeviceError::Unauthorized) => {
                SessionError::Security(DeviceError::Unauthorized.to_string())
            }
            other => SessionError::BackendAction(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::protocol;

    #[test]
    fn test_codes_and_recoverability() {
        let parse_err = protocol::parse("nope").unwrap_err();
        let err = SessionError::from(parse_err);
        assert_eq!(err.code(), "MESSAGE_PARSING_ERROR");
        assert!(err.is_recoverable());

        let err = SessionError::from(UpstreamError::Auth("bad key".into()));
        assert_eq!(err.code(), "SECURITY_ERROR");
        assert!(!err.is_recoverable());

        let err = SessionError::from(UpstreamError::Disconnected("eof".into()));
        assert!(err.is_disconnect());
        assert!(!err.is_recoverable());

        let err = SessionError::from(UpstreamError::Transport("reset".into()));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_resilience_errors_map_to_session_errors() {
        let err: SessionError = ResilienceError::<UpstreamError>::CircuitOpen {
            retry_in: Duration::from_millis(1500),
        }
        .into();
        assert_eq!(err.code(), "CIRCUIT_BREAKER_OPEN");
        match err.to_message() {
            ServerMessage::Error { details, .. } => {
                assert_eq!(details, Some(json!({ "retry_after_secs": 2 })));
            }
            other => panic!("unexpected message: {other:?}"),
        }

        let err: SessionError = ResilienceError::Exhausted {
            attempts: 3,
            last: Failure::<UpstreamError>::Timeout,
        }
        .into();
        assert!(matches!(err, SessionError::Upstream(UpstreamError::Timeout)));
    }

    #[test]
    fn test_device_failures_map_to_backend_action() {
        let err: SessionError =
            ResilienceError::Fatal(DeviceError::NotFound("light.attic".into())).into();
        assert_eq!(err.code(), "BACKEND_ACTION_ERROR");
        assert!(err.is_recoverable());
        assert!(err.to_string().contains("light.attic"));

        let err: SessionError = ResilienceError::<DeviceError>::CircuitOpen {
            retry_in: Duration::from_secs(4),
        }
        .into();
        assert_eq!(err.code(), "CIRCUIT_BREAKER_OPEN");
    }
}
