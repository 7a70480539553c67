//! Circuit Breaker and Retry Envelope
//!
//! Every call to an external collaborator (the upstream streaming session or
//! the device backend) goes through a [`ResilienceExecutor`]. The executor
//! rejects calls while its circuit is open, retries retriable failures with
//! exponential backoff and optional jitter, races each attempt against a
//! timeout, and records terminal failures into a bounded [`ErrorHistory`].
//!
//! One executor exists per collaborator and is shared across all sessions.

use casa_core::{device_backend::DeviceError, realtime_api::UpstreamError};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Maximum number of terminal failures kept for health reporting.
pub const ERROR_HISTORY_CAPACITY: usize = 1000;

/// Window used by [`ResilienceExecutor::health_status`] to count recent errors.
const RECENT_ERROR_WINDOW: Duration = Duration::from_secs(5 * 60);
const DEGRADED_RECENT_ERRORS: usize = 10;

/// Whether a failed attempt is worth repeating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    Retriable,
    Fatal,
}

/// Classifies collaborator errors for the retry loop.
pub trait Classify {
    fn class(&self) -> RetryClass;

    /// An explicit delay requested by the collaborator, e.g. from a rate limit.
    fn retry_after(&self) -> Option<Duration> {
        None
    }

    /// A stable code for the error history.
    fn code(&self) -> &'static str;

    /// The collaborator went away. Such failures end the caller's session
    /// and are not counted against the shared circuit.
    fn is_disconnect(&self) -> bool {
        false
    }
}

impl Classify for UpstreamError {
    fn class(&self) -> RetryClass {
        match self {
            UpstreamError::Auth(_)
            | UpstreamError::Config(_)
            | UpstreamError::Disconnected(_)
            | UpstreamError::Protocol(_) => RetryClass::Fatal,
            UpstreamError::RateLimited { .. }
            | UpstreamError::Timeout
            | UpstreamError::Transport(_) => RetryClass::Retriable,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            UpstreamError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            UpstreamError::Auth(_) => "SECURITY_ERROR",
            UpstreamError::Config(_) => "CONFIGURATION_ERROR",
            UpstreamError::Disconnected(_) => "CONNECTION_ERROR",
            _ => "UPSTREAM_ERROR",
        }
    }

    fn is_disconnect(&self) -> bool {
        matches!(self, UpstreamError::Disconnected(_))
    }
}

impl Classify for DeviceError {
    fn class(&self) -> RetryClass {
        match self {
            DeviceError::UnknownAction(_)
            | DeviceError::NotFound(_)
            | DeviceError::Validation(_)
            | DeviceError::Unauthorized => RetryClass::Fatal,
            DeviceError::RateLimited { .. }
            | DeviceError::Unreachable(_)
            | DeviceError::Server { .. }
            | DeviceError::Timeout => RetryClass::Retriable,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            DeviceError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            DeviceError::Unauthorized => "SECURITY_ERROR",
            _ => "BACKEND_ACTION_ERROR",
        }
    }
}

/// Backoff parameters for the retry loop.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry that follows failed attempt number `attempt` (0-based).
    ///
    /// A collaborator hint overrides the computed delay when it is longer and
    /// is not capped by `max_delay`.
    pub fn delay_for(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let exp_ms = self.base_delay.as_millis() as f64
            * self
                .backoff_multiplier
                .powi(attempt.min(i32::MAX as u32) as i32);
        let capped_ms = exp_ms.min(self.max_delay.as_millis() as f64);
        let scaled_ms = if self.jitter {
            capped_ms * (0.5 + rand::random::<f64>() * 0.5)
        } else {
            capped_ms
        };
        let computed = Duration::from_millis(scaled_ms.max(0.0).round() as u64);
        match hint {
            Some(hint) => computed.max(hint),
            None => computed,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_calls: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    half_open_in_flight: u32,
    /// Bumped on every state transition so stale probe permits are ignored.
    epoch: u64,
    successes: u64,
    failures: u64,
}

/// Point-in-time view of a circuit breaker.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub half_open_in_flight: u32,
    pub total_successes: u64,
    pub total_failures: u64,
}

/// A Closed/Open/HalfOpen state machine behind a single lock.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

/// Admission to run one guarded call. Report the outcome with
/// [`Permit::success`] or [`Permit::failure`]; dropping an unreported probe
/// returns its half-open slot.
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    epoch: u64,
    settled: bool,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                last_failure_at: None,
                half_open_in_flight: 0,
                epoch: 0,
                successes: 0,
                failures: 0,
            }),
        }
    }

    /// Admits a call or returns how long until the next probe may be tried.
    pub fn try_acquire(&self) -> Result<Permit<'_>, Duration> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(self.permit(false, inner.epoch)),
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|at| at.elapsed())
                    .unwrap_or(self.config.recovery_timeout);
                if elapsed >= self.config.recovery_timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.epoch += 1;
                    inner.half_open_in_flight = 1;
                    info!(circuit = %self.name, "Circuit half-open, admitting probe.");
                    Ok(self.permit(true, inner.epoch))
                } else {
                    Err(self.config.recovery_timeout - elapsed)
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight < self.config.half_open_max_calls {
                    inner.half_open_in_flight += 1;
                    Ok(self.permit(true, inner.epoch))
                } else {
                    Err(Duration::ZERO)
                }
            }
        }
    }

    fn permit(&self, probe: bool, epoch: u64) -> Permit<'_> {
        Permit {
            breaker: self,
            probe,
            epoch,
            settled: false,
        }
    }

    fn on_success(&self, probe: bool, epoch: u64) {
        let mut inner = self.inner.lock();
        inner.successes += 1;
        match inner.state {
            CircuitState::HalfOpen if probe && epoch == inner.epoch => {
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
                inner.half_open_in_flight = 0;
                inner.epoch += 1;
                info!(circuit = %self.name, "Circuit closed after successful probe.");
            }
            CircuitState::Closed => {
                inner.failure_count = inner.failure_count.saturating_sub(1);
            }
            _ => {}
        }
    }

    fn on_failure(&self, probe: bool, epoch: u64) {
        let mut inner = self.inner.lock();
        inner.failures += 1;
        match inner.state {
            CircuitState::Closed if !probe => {
                inner.failure_count += 1;
                inner.last_failure = Some(Instant::now());
                inner.last_failure_at = Some(Utc::now());
                if inner.failure_count >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.epoch += 1;
                    error!(
                        circuit = %self.name,
                        failures = inner.failure_count,
                        "Circuit opened."
                    );
                }
            }
            CircuitState::HalfOpen if probe && epoch == inner.epoch => {
                inner.state = CircuitState::Open;
                inner.failure_count += 1;
                inner.last_failure = Some(Instant::now());
                inner.last_failure_at = Some(Utc::now());
                inner.half_open_in_flight = 0;
                inner.epoch += 1;
                warn!(circuit = %self.name, "Probe failed, circuit re-opened.");
            }
            _ => {}
        }
    }

    fn on_abandoned(&self, epoch: u64) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen && epoch == inner.epoch {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.inner.lock();
        CircuitSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            last_failure_at: inner.last_failure_at,
            half_open_in_flight: inner.half_open_in_flight,
            total_successes: inner.successes,
            total_failures: inner.failures,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Forces the breaker back to Closed with a clean failure count.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.last_failure = None;
        inner.last_failure_at = None;
        inner.half_open_in_flight = 0;
        inner.epoch += 1;
        info!(circuit = %self.name, "Circuit manually reset.");
    }
}

impl Permit<'_> {
    pub fn success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.probe, self.epoch);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.probe, self.epoch);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.breaker.on_abandoned(self.epoch);
        }
    }
}

/// One terminal failure as kept in the history.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    #[serde(skip)]
    pub at: Instant,
    pub timestamp: DateTime<Utc>,
    pub operation: String,
    pub code: &'static str,
    pub message: String,
}

#[derive(Default)]
struct HistoryInner {
    records: VecDeque<ErrorRecord>,
    counts: HashMap<&'static str, u64>,
}

/// A bounded rolling log of terminal failures with per-code counters.
pub struct ErrorHistory {
    capacity: usize,
    inner: Mutex<HistoryInner>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorStatistics {
    pub total_errors: u64,
    pub recent_errors: usize,
    pub by_code: HashMap<String, u64>,
    pub latest: Vec<ErrorRecord>,
}

impl ErrorHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(HistoryInner::default()),
        }
    }

    pub fn record(&self, operation: &str, code: &'static str, message: String) {
        let mut inner = self.inner.lock();
        *inner.counts.entry(code).or_insert(0) += 1;
        if inner.records.len() == self.capacity {
            inner.records.pop_front();
        }
        inner.records.push_back(ErrorRecord {
            at: Instant::now(),
            timestamp: Utc::now(),
            operation: operation.to_string(),
            code,
            message,
        });
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of records younger than `window`.
    pub fn recent(&self, window: Duration) -> usize {
        let inner = self.inner.lock();
        inner
            .records
            .iter()
            .rev()
            .take_while(|r| r.at.elapsed() <= window)
            .count()
    }

    pub fn statistics(&self) -> ErrorStatistics {
        let recent_errors = self.recent(RECENT_ERROR_WINDOW);
        let inner = self.inner.lock();
        ErrorStatistics {
            total_errors: inner.counts.values().sum(),
            recent_errors,
            by_code: inner
                .counts
                .iter()
                .map(|(code, n)| (code.to_string(), *n))
                .collect(),
            latest: inner.records.iter().rev().take(10).cloned().collect(),
        }
    }
}

/// The attempt-level failure kept when retries run out.
#[derive(Debug)]
pub enum Failure<E> {
    Operation(E),
    Timeout,
}

impl<E: fmt::Display> fmt::Display for Failure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Operation(e) => e.fmt(f),
            Failure::Timeout => f.write_str("call timed out"),
        }
    }
}

impl<E: Classify> Failure<E> {
    fn class(&self) -> RetryClass {
        match self {
            Failure::Operation(e) => e.class(),
            Failure::Timeout => RetryClass::Retriable,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Failure::Operation(e) => e.retry_after(),
            Failure::Timeout => None,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Failure::Operation(e) => e.code(),
            Failure::Timeout => "TIMEOUT",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResilienceError<E> {
    #[error("circuit open, retry in {retry_in:?}")]
    CircuitOpen { retry_in: Duration },
    #[error("retries exhausted after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: Failure<E> },
    #[error("non-retriable failure: {0}")]
    Fatal(E),
}

/// A successful guarded call and how many attempts it took.
#[derive(Debug)]
pub struct Completed<T> {
    pub value: T,
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

pub struct ResilienceExecutor {
    name: String,
    policy: RetryPolicy,
    call_timeout: Duration,
    breaker: CircuitBreaker,
    history: ErrorHistory,
}

impl ResilienceExecutor {
    pub fn new(
        name: impl Into<String>,
        policy: RetryPolicy,
        breaker: CircuitBreakerConfig,
        call_timeout: Duration,
    ) -> Self {
        let name = name.into();
        Self {
            breaker: CircuitBreaker::new(name.clone(), breaker),
            name,
            policy,
            call_timeout,
            history: ErrorHistory::new(ERROR_HISTORY_CAPACITY),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn history(&self) -> &ErrorHistory {
        &self.history
    }

    /// Runs `op` inside the circuit breaker and retry loop.
    ///
    /// Each attempt is raced against the configured call timeout; a timeout
    /// counts as a retriable failure. Exactly one outcome is recorded against
    /// the breaker per call, whatever the number of attempts.
    pub async fn execute<T, E, F, Fut>(
        &self,
        operation: &str,
        mut op: F,
    ) -> Result<Completed<T>, ResilienceError<E>>
    where
        E: Classify + fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = match self.breaker.try_acquire() {
            Ok(permit) => permit,
            Err(retry_in) => {
                debug!(executor = %self.name, %operation, "Circuit open, failing fast.");
                self.history.record(
                    operation,
                    "CIRCUIT_BREAKER_OPEN",
                    format!("circuit open, retry in {retry_in:?}"),
                );
                return Err(ResilienceError::CircuitOpen { retry_in });
            }
        };

        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let failure = match tokio::time::timeout(self.call_timeout, op()).await {
                Ok(Ok(value)) => {
                    permit.success();
                    if attempt > 1 {
                        info!(executor = %self.name, %operation, attempt, "Call succeeded after retry.");
                    }
                    return Ok(Completed {
                        value,
                        attempts: attempt,
                    });
                }
                Ok(Err(e)) if e.is_disconnect() => {
                    debug!(executor = %self.name, %operation, error = %e, "Collaborator disconnected.");
                    drop(permit);
                    return Err(ResilienceError::Fatal(e));
                }
                Ok(Err(e)) => Failure::Operation(e),
                Err(_) => Failure::Timeout,
            };

            if failure.class() == RetryClass::Fatal {
                permit.failure();
                self.history
                    .record(operation, failure.code(), failure.to_string());
                warn!(executor = %self.name, %operation, error = %failure, "Non-retriable failure.");
                return Err(match failure {
                    Failure::Operation(e) => ResilienceError::Fatal(e),
                    Failure::Timeout => ResilienceError::Exhausted {
                        attempts: attempt,
                        last: Failure::Timeout,
                    },
                });
            }

            if attempt >= max_attempts {
                permit.failure();
                self.history
                    .record(operation, failure.code(), failure.to_string());
                error!(
                    executor = %self.name,
                    %operation,
                    attempts = attempt,
                    error = %failure,
                    "Retries exhausted."
                );
                return Err(ResilienceError::Exhausted {
                    attempts: attempt,
                    last: failure,
                });
            }

            let delay = self.policy.delay_for(attempt - 1, failure.retry_after());
            warn!(
                executor = %self.name,
                %operation,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "Retrying after failure."
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// `critical` while open, `degraded` while probing or after a burst of
    /// recent errors, otherwise `healthy`.
    pub fn health_status(&self) -> HealthStatus {
        match self.breaker.state() {
            CircuitState::Open => HealthStatus::Critical,
            CircuitState::HalfOpen => HealthStatus::Degraded,
            CircuitState::Closed => {
                if self.history.recent(RECENT_ERROR_WINDOW) > DEGRADED_RECENT_ERRORS {
                    HealthStatus::Degraded
                } else {
                    HealthStatus::Healthy
                }
            }
        }
    }

    pub fn error_statistics(&self) -> ErrorStatistics {
        self.history.statistics()
    }
}
