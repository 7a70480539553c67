//! Per-session metrics, health scoring and eviction.
//!
//! A [`SessionState`] is owned by one orchestrator but written from both of
//! its tasks (the receive loop and the upstream event drain), so it lives
//! behind a lock scoped to that single session. The [`SessionStore`] maps
//! connection ids to those locks and is the only place sessions are destroyed.

use super::registry::{ConnectionId, ConnectionRegistry};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Consecutive failures after which a session is permanently unhealthy.
pub const UNHEALTHY_AFTER_FAILURES: u32 = 3;
const SLOW_RESPONSE_SECS: f64 = 5.0;

#[derive(Debug, Clone)]
pub struct SessionState {
    created: Instant,
    last_activity: Instant,
    pub created_at: DateTime<Utc>,
    pub audio_chunks_processed: u64,
    pub total_audio_bytes: u64,
    pub backend_actions: u64,
    pub error_count: u64,
    pub connection_retries: u64,
    pub last_error: Option<String>,
    total_response_time: Duration,
    response_count: u64,
    consecutive_failures: u32,
    healthy: bool,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionState {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            created: now,
            last_activity: now,
            created_at: Utc::now(),
            audio_chunks_processed: 0,
            total_audio_bytes: 0,
            backend_actions: 0,
            error_count: 0,
            connection_retries: 0,
            last_error: None,
            total_response_time: Duration::ZERO,
            response_count: 0,
            consecutive_failures: 0,
            healthy: true,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn record_audio_chunk(&mut self, size: usize) {
        self.audio_chunks_processed += 1;
        self.total_audio_bytes += size as u64;
    }

    pub fn record_backend_action(&mut self) {
        self.backend_actions += 1;
    }

    pub fn record_response_time(&mut self, elapsed: Duration) {
        self.total_response_time += elapsed;
        self.response_count += 1;
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        self.error_count += 1;
        self.last_error = Some(message.into());
        self.consecutive_failures += 1;
        if self.consecutive_failures >= UNHEALTHY_AFTER_FAILURES && self.healthy {
            self.healthy = false;
            warn!(
                failures = self.consecutive_failures,
                "Session marked unhealthy."
            );
        }
    }

    /// A call refused by an open circuit. Counted, but it does not advance the
    /// consecutive-failure streak.
    pub fn record_rejection(&mut self, message: impl Into<String>) {
        self.error_count += 1;
        self.last_error = Some(message.into());
    }

    pub fn record_connection_retry(&mut self) {
        self.connection_retries += 1;
    }

    /// A successful upstream exchange clears the consecutive-failure streak.
    /// An unhealthy session stays unhealthy.
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    pub fn average_response_time(&self) -> Duration {
        if self.response_count == 0 {
            Duration::ZERO
        } else {
            self.total_response_time
                .div_f64(self.response_count as f64)
        }
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    pub fn idle(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// A score in `[0, 1]` derived from error rate, retries and latency.
    pub fn health_score(&self) -> f64 {
        if !self.healthy {
            return 0.0;
        }
        let mut score = 1.0;
        if self.audio_chunks_processed > 0 {
            let error_rate = self.error_count as f64 / self.audio_chunks_processed as f64;
            score -= (error_rate * 0.5).min(0.4);
        }
        if self.connection_retries > 0 {
            score -= (self.connection_retries as f64 * 0.1).min(0.3);
        }
        let avg = self.average_response_time().as_secs_f64();
        if avg > SLOW_RESPONSE_SECS {
            score -= ((avg - SLOW_RESPONSE_SECS) * 0.05).min(0.3);
        }
        f64::clamp(score, 0.0, 1.0)
    }

    /// The reason this session should be evicted, if any. `max_idle`
    /// defaults to half of `max_age`.
    pub fn eviction_reason(
        &self,
        max_age: Duration,
        max_idle: Option<Duration>,
    ) -> Option<EvictionReason> {
        let max_idle = max_idle.unwrap_or(max_age / 2);
        if !self.healthy {
            Some(EvictionReason::Unhealthy)
        } else if self.age() > max_age {
            Some(EvictionReason::MaxAge)
        } else if self.idle() > max_idle {
            Some(EvictionReason::Idle)
        } else {
            None
        }
    }

    pub fn should_evict(&self, max_age: Duration, max_idle: Option<Duration>) -> bool {
        self.eviction_reason(max_age, max_idle).is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionReason {
    MaxAge,
    Idle,
    Unhealthy,
    Forced,
}

/// Shared handle to one session: its state and the token that ends it.
#[derive(Clone)]
pub struct SessionHandle {
    pub state: Arc<Mutex<SessionState>>,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HealthBuckets {
    pub excellent: usize,
    pub good: usize,
    pub fair: usize,
    pub poor: usize,
    pub critical: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallHealth {
    Excellent,
    Good,
    Fair,
    Poor,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub total_sessions: usize,
    pub healthy_sessions: usize,
    pub unhealthy_sessions: usize,
    pub average_health_score: f64,
    pub sessions_by_health: HealthBuckets,
    pub overall_health: OverallHealth,
    pub alerts: Vec<String>,
}

#[derive(Default)]
pub struct SessionStore {
    sessions: DashMap<ConnectionId, SessionHandle>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: ConnectionId, state: SessionState) -> SessionHandle {
        let handle = SessionHandle {
            state: Arc::new(Mutex::new(state)),
            cancel: CancellationToken::new(),
        };
        self.sessions.insert(id, handle.clone());
        handle
    }

    pub fn get(&self, id: ConnectionId) -> Option<SessionHandle> {
        self.sessions.get(&id).map(|h| h.clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Destroys a session and signals its orchestrator to close. Removing an
    /// absent session is a no-op that returns `false`.
    pub fn remove(&self, id: ConnectionId) -> bool {
        match self.sessions.remove(&id) {
            Some((_, handle)) => {
                handle.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Evicts every session that should no longer live.
    pub fn sweep(
        &self,
        max_age: Duration,
        max_idle: Option<Duration>,
    ) -> Vec<(ConnectionId, EvictionReason)> {
        let candidates: Vec<(ConnectionId, EvictionReason)> = self
            .sessions
            .iter()
            .filter_map(|entry| {
                entry
                    .value()
                    .state
                    .lock()
                    .eviction_reason(max_age, max_idle)
                    .map(|reason| (*entry.key(), reason))
            })
            .collect();

        candidates
            .into_iter()
            .filter(|(id, reason)| {
                let removed = self.remove(*id);
                if removed {
                    info!(connection_id = %id, ?reason, "Session evicted.");
                }
                removed
            })
            .collect()
    }

    pub fn force_evict_unhealthy(&self) -> Vec<ConnectionId> {
        let unhealthy: Vec<ConnectionId> = self
            .sessions
            .iter()
            .filter(|entry| !entry.value().state.lock().is_healthy())
            .map(|entry| *entry.key())
            .collect();
        unhealthy
            .into_iter()
            .filter(|id| {
                let removed = self.remove(*id);
                if removed {
                    info!(connection_id = %id, reason = ?EvictionReason::Forced, "Session evicted.");
                }
                removed
            })
            .collect()
    }

    pub fn health_report(&self) -> HealthReport {
        let snapshots: Vec<SessionState> = self
            .sessions
            .iter()
            .map(|entry| entry.value().state.lock().clone())
            .collect();

        let total = snapshots.len();
        if total == 0 {
            return HealthReport {
                total_sessions: 0,
                healthy_sessions: 0,
                unhealthy_sessions: 0,
                average_health_score: 1.0,
                sessions_by_health: HealthBuckets::default(),
                overall_health: OverallHealth::Excellent,
                alerts: Vec::new(),
            };
        }

        let mut buckets = HealthBuckets::default();
        let mut score_sum = 0.0;
        let mut healthy = 0;
        let mut errors = 0;
        let mut chunks = 0;
        let mut retries = 0;
        let mut response_secs = 0.0;
        for state in &snapshots {
            let score = state.health_score();
            score_sum += score;
            match score {
                s if s > 0.8 => buckets.excellent += 1,
                s if s > 0.6 => buckets.good += 1,
                s if s > 0.4 => buckets.fair += 1,
                s if s > 0.2 => buckets.poor += 1,
                _ => buckets.critical += 1,
            }
            if state.is_healthy() {
                healthy += 1;
            }
            errors += state.error_count;
            chunks += state.audio_chunks_processed;
            retries += state.connection_retries;
            response_secs += state.average_response_time().as_secs_f64();
        }

        let average = score_sum / total as f64;
        let healthy_ratio = healthy as f64 / total as f64;
        let overall_health = match (average, healthy_ratio) {
            (a, r) if a >= 0.8 && r >= 0.9 => OverallHealth::Excellent,
            (a, r) if a >= 0.6 && r >= 0.7 => OverallHealth::Good,
            (a, r) if a >= 0.4 && r >= 0.5 => OverallHealth::Fair,
            (a, r) if a >= 0.2 && r >= 0.3 => OverallHealth::Poor,
            _ => OverallHealth::Critical,
        };

        let mut alerts = Vec::new();
        let unhealthy = total - healthy;
        if unhealthy > 0 {
            alerts.push(format!("{unhealthy} unhealthy sessions detected"));
        }
        if errors as f64 > chunks as f64 * 0.1 {
            alerts.push("High error rate detected across sessions".to_string());
        }
        if retries > total as u64 * 2 {
            alerts.push("Frequent connection retries detected".to_string());
        }
        if response_secs / total as f64 > SLOW_RESPONSE_SECS {
            alerts.push("Slow average response times detected".to_string());
        }
        if buckets.critical > 0 {
            alerts.push(format!("{} sessions in critical state", buckets.critical));
        }

        HealthReport {
            total_sessions: total,
            healthy_sessions: healthy,
            unhealthy_sessions: unhealthy,
            average_health_score: average,
            sessions_by_health: buckets,
            overall_health,
            alerts,
        }
    }
}

/// Timing of the periodic sweep.
#[derive(Debug, Clone)]
pub struct EvictionPolicy {
    pub max_age: Duration,
    pub max_idle: Option<Duration>,
    pub interval: Duration,
    pub metadata_retention: Duration,
}

/// Spawns the process-wide eviction task. It also reaps stale connection
/// metadata, and stops when `shutdown` is cancelled.
pub fn spawn_eviction_sweep(
    sessions: Arc<SessionStore>,
    registry: Arc<ConnectionRegistry>,
    policy: EvictionPolicy,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(policy.interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let evicted = sessions.sweep(policy.max_age, policy.max_idle);
                    let reaped = registry.reap_metadata(policy.metadata_retention);
                    if !evicted.is_empty() || reaped > 0 {
                        info!(
                            evicted = evicted.len(),
                            reaped,
                            remaining = sessions.len(),
                            "Eviction sweep finished."
                        );
                    }
                }
            }
        }
        info!("Eviction sweep stopped.");
    })
}
