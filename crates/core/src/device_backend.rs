//! Device Backend Contract
//!
//! The session layer executes named device actions through a [`DeviceBackend`].
//! Every failure is reported as a distinct [`DeviceError`] variant so callers
//! can tell a missing entity from an unreachable backend and decide whether
//! retrying makes sense.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{Map, Value, json};
use std::time::Duration;
use tracing::{debug, info};

/// Maximum number of entity ids returned by `list_entities`.
const LIST_LIMIT: usize = 10;

/// Failures of a single device action invocation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DeviceError {
    #[error("unknown action: {0}")]
    UnknownAction(String),
    #[error("entity not found: {0}")]
    NotFound(String),
    #[error("invalid arguments: {0}")]
    Validation(String),
    #[error("backend rejected credentials")]
    Unauthorized,
    #[error("backend rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("backend unreachable: {0}")]
    Unreachable(String),
    #[error("backend returned HTTP {status}: {message}")]
    Server { status: u16, message: String },
    #[error("backend call timed out")]
    Timeout,
}

/// Executes named actions against a device backend.
#[async_trait]
pub trait DeviceBackend: Send + Sync {
    /// Invokes `action` with `args` and returns the backend's result payload.
    async fn invoke(&self, action: &str, args: &Value) -> Result<Value, DeviceError>;
}

/// HTTP method of a planned backend request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// A backend request derived from an action name and its arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
    /// Domain filter applied to a `list_entities` response.
    pub list_domain: Option<String>,
}

/// A `DeviceBackend` backed by the Home Assistant REST API.
pub struct HomeAssistantBackend {
    client: Client,
    base_url: String,
    token: String,
}

impl HomeAssistantBackend {
    /// Creates a backend for the instance at `base_url`.
    ///
    /// # Arguments
    ///
    /// * `base_url` - Root URL of the Home Assistant instance.
    /// * `token` - A long-lived access token.
    /// * `timeout` - Per-request timeout applied by the HTTP client.
    pub fn new(base_url: &str, token: String, timeout: Duration) -> Result<Self, DeviceError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DeviceError::Unreachable(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Maps an action name and its arguments onto a REST request.
    pub fn plan(action: &str, args: &Value) -> Result<PlannedRequest, DeviceError> {
        let args = args
            .as_object()
            .ok_or_else(|| DeviceError::Validation("arguments must be an object".into()))?;

        match action {
            "get_entity_state" | "get_sensor_state" => {
                let entity_id = required_str(args, "entity_id")?;
                Ok(PlannedRequest {
                    method: Method::Get,
                    path: format!("/api/states/{entity_id}"),
                    body: None,
                    list_domain: None,
                })
            }
            "list_entities" => Ok(PlannedRequest {
                method: Method::Get,
                path: "/api/states".to_string(),
                body: None,
                list_domain: args
                    .get("domain")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            }),
            "activate_scene" => {
                let entity_id = required_str(args, "entity_id")?;
                Ok(PlannedRequest {
                    method: Method::Post,
                    path: "/api/services/scene/turn_on".to_string(),
                    body: Some(json!({ "entity_id": entity_id })),
                    list_domain: None,
                })
            }
            _ => {
                let Some(domain) = action.strip_prefix("control_") else {
                    return Err(DeviceError::UnknownAction(action.to_string()));
                };
                if domain.is_empty() {
                    return Err(DeviceError::UnknownAction(action.to_string()));
                }
                required_str(args, "entity_id")?;
                let service = required_str(args, "action")?;
                let mut body = args.clone();
                body.remove("action");
                Ok(PlannedRequest {
                    method: Method::Post,
                    path: format!("/api/services/{domain}/{service}"),
                    body: Some(Value::Object(body)),
                    list_domain: None,
                })
            }
        }
    }
}

#[async_trait]
impl DeviceBackend for HomeAssistantBackend {
    async fn invoke(&self, action: &str, args: &Value) -> Result<Value, DeviceError> {
        let plan = Self::plan(action, args)?;
        let url = format!("{}{}", self.base_url, plan.path);
        debug!(%action, %url, "Invoking Home Assistant action");

        let request = match plan.method {
            Method::Get => self.client.get(&url),
            Method::Post => self
                .client
                .post(&url)
                .json(&plan.body.clone().unwrap_or_else(|| json!({}))),
        };
        let response = request
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let message = response.text().await.unwrap_or_default();
            return Err(map_status(status, retry_after, message, args));
        }

        let payload: Value = response.json().await.map_err(|e| DeviceError::Server {
            status: status.as_u16(),
            message: format!("invalid response body: {e}"),
        })?;

        info!(%action, "Home Assistant action succeeded");
        if action == "list_entities" {
            Ok(summarize_entities(&payload, plan.list_domain.as_deref()))
        } else {
            Ok(payload)
        }
    }
}

/// A `DeviceBackend` for development that acknowledges every known action.
pub struct MockDeviceBackend;

#[async_trait]
impl DeviceBackend for MockDeviceBackend {
    async fn invoke(&self, action: &str, args: &Value) -> Result<Value, DeviceError> {
        HomeAssistantBackend::plan(action, args)?;
        Ok(json!({ "action": action, "args": args, "mock": true }))
    }
}

fn required_str<'a>(args: &'a Map<String, Value>, field: &str) -> Result<&'a str, DeviceError> {
    args.get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| DeviceError::Validation(format!("missing field `{field}`")))
}

fn map_transport_error(e: reqwest::Error) -> DeviceError {
    if e.is_timeout() {
        DeviceError::Timeout
    } else {
        DeviceError::Unreachable(e.to_string())
    }
}

/// Translates a non-success HTTP status into a `DeviceError`.
pub fn map_status(
    status: StatusCode,
    retry_after: Option<Duration>,
    message: String,
    args: &Value,
) -> DeviceError {
    match status.as_u16() {
        401 | 403 => DeviceError::Unauthorized,
        404 => DeviceError::NotFound(
            args.get("entity_id")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
        ),
        400 | 422 => DeviceError::Validation(message),
        429 => DeviceError::RateLimited { retry_after },
        code => DeviceError::Server {
            status: code,
            message,
        },
    }
}

fn summarize_entities(payload: &Value, domain: Option<&str>) -> Value {
    let ids: Vec<&str> = payload
        .as_array()
        .map(|entities| {
            entities
                .iter()
                .filter_map(|e| e.get("entity_id").and_then(Value::as_str))
                .filter(|id| domain.is_none_or(|d| id.starts_with(&format!("{d}."))))
                .collect()
        })
        .unwrap_or_default();
    json!({
        "count": ids.len(),
        "entities": ids.iter().take(LIST_LIMIT).collect::<Vec<_>>(),
    })
}
