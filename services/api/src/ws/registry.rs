//! Connection Registry
//!
//! Tracks every live client connection by a generated [`ConnectionId`]. A
//! connection is represented here only by the sending half of its bounded
//! outbound queue; the connection's own writer task drains that queue onto
//! the socket, so per-connection ordering is the queue order.
//!
//! Metadata outlives the connection for a retention window so diagnostics can
//! still see recently closed connections.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::protocol::ServerMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ConnectionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionMeta {
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub message_count: u64,
    pub messages_sent: u64,
    pub disconnected_at: Option<DateTime<Utc>>,
    disconnected: Option<Instant>,
}

/// What a client learns about its own connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionInfo {
    pub total_connections: usize,
    pub connected_at: DateTime<Utc>,
    pub message_count: u64,
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastOutcome {
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryStatistics {
    pub active_connections: usize,
    pub tracked_connections: usize,
    pub inactive_connections: usize,
    pub total_messages_received: u64,
    pub total_messages_sent: u64,
}

pub struct ConnectionRegistry {
    live: DashMap<ConnectionId, mpsc::Sender<ServerMessage>>,
    meta: DashMap<ConnectionId, ConnectionMeta>,
    queue_capacity: usize,
    send_timeout: Duration,
}

impl ConnectionRegistry {
    pub fn new(queue_capacity: usize, send_timeout: Duration) -> Self {
        Self {
            live: DashMap::new(),
            meta: DashMap::new(),
            queue_capacity: queue_capacity.max(1),
            send_timeout,
        }
    }

    /// Registers a new connection and returns the receiving end of its
    /// outbound queue. The connection is visible to broadcasts immediately.
    pub fn register(&self) -> (ConnectionId, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let id = ConnectionId::new();
        let now = Utc::now();
        self.meta.insert(
            id,
            ConnectionMeta {
                connected_at: now,
                last_activity: now,
                message_count: 0,
                messages_sent: 0,
                disconnected_at: None,
                disconnected: None,
            },
        );
        self.live.insert(id, tx);
        info!(connection_id = %id, total = self.live.len(), "Connection registered.");
        (id, rx)
    }

    /// Removes a connection from the live set. Returns `true` only for the
    /// call that actually removed it.
    pub fn unregister(&self, id: ConnectionId) -> bool {
        if self.live.remove(&id).is_none() {
            return false;
        }
        if let Some(mut meta) = self.meta.get_mut(&id) {
            meta.disconnected_at = Some(Utc::now());
            meta.disconnected = Some(Instant::now());
        }
        info!(connection_id = %id, total = self.live.len(), "Connection unregistered.");
        true
    }

    pub fn is_registered(&self, id: ConnectionId) -> bool {
        self.live.contains_key(&id)
    }

    pub fn count(&self) -> usize {
        self.live.len()
    }

    /// Queues `message` for one connection.
    ///
    /// An unknown id yields `false`. A closed or persistently full queue
    /// unregisters the connection and yields `false`.
    pub async fn send_to(&self, id: ConnectionId, message: ServerMessage) -> bool {
        let Some(tx) = self.live.get(&id).map(|entry| entry.value().clone()) else {
            debug!(connection_id = %id, "Send to unknown connection.");
            return false;
        };

        match tx.send_timeout(message, self.send_timeout).await {
            Ok(()) => {
                if !self.live.contains_key(&id) {
                    return false;
                }
                if let Some(mut meta) = self.meta.get_mut(&id) {
                    meta.messages_sent += 1;
                }
                true
            }
            Err(e) => {
                warn!(connection_id = %id, error = %e, "Outbound queue unavailable, dropping connection.");
                self.unregister(id);
                false
            }
        }
    }

    /// Sends to every live connection not in `exclude`, concurrently.
    pub async fn broadcast(
        &self,
        message: &ServerMessage,
        exclude: &HashSet<ConnectionId>,
    ) -> BroadcastOutcome {
        let targets: Vec<ConnectionId> = self
            .live
            .iter()
            .map(|entry| *entry.key())
            .filter(|id| !exclude.contains(id))
            .collect();
        self.send_all(message, &targets).await
    }

    /// Sends to the listed connections only. Unknown ids count as failures.
    pub async fn send_to_targets(
        &self,
        message: &ServerMessage,
        targets: &[ConnectionId],
    ) -> BroadcastOutcome {
        self.send_all(message, targets).await
    }

    async fn send_all(&self, message: &ServerMessage, targets: &[ConnectionId]) -> BroadcastOutcome {
        let results = join_all(
            targets
                .iter()
                .map(|id| self.send_to(*id, message.clone())),
        )
        .await;
        let delivered = results.iter().filter(|ok| **ok).count();
        let outcome = BroadcastOutcome {
            delivered,
            failed: results.len() - delivered,
        };
        debug!(
            delivered = outcome.delivered,
            failed = outcome.failed,
            "Broadcast finished."
        );
        outcome
    }

    /// Counts an inbound message and refreshes the activity timestamp.
    pub fn record_inbound(&self, id: ConnectionId) {
        if let Some(mut meta) = self.meta.get_mut(&id) {
            meta.message_count += 1;
            meta.last_activity = Utc::now();
        }
    }

    pub fn connection_info(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        if !self.is_registered(id) {
            return None;
        }
        let meta = self.meta.get(&id)?;
        Some(ConnectionInfo {
            total_connections: self.live.len(),
            connected_at: meta.connected_at,
            message_count: meta.message_count,
            last_activity: meta.last_activity,
        })
    }

    pub fn metadata(&self, id: ConnectionId) -> Option<ConnectionMeta> {
        self.meta.get(&id).map(|meta| meta.clone())
    }

    /// Drops metadata of connections closed longer than `retention` ago.
    pub fn reap_metadata(&self, retention: Duration) -> usize {
        let before = self.meta.len();
        self.meta.retain(|_, meta| {
            meta.disconnected
                .is_none_or(|closed| closed.elapsed() <= retention)
        });
        let reaped = before.saturating_sub(self.meta.len());
        if reaped > 0 {
            info!(reaped, "Reaped connection metadata.");
        }
        reaped
    }

    pub fn statistics(&self) -> RegistryStatistics {
        let mut received = 0;
        let mut sent = 0;
        for meta in self.meta.iter() {
            received += meta.message_count;
            sent += meta.messages_sent;
        }
        let active = self.live.len();
        let tracked = self.meta.len();
        RegistryStatistics {
            active_connections: active,
            tracked_connections: tracked,
            inactive_connections: tracked.saturating_sub(active),
            total_messages_received: received,
            total_messages_sent: sent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ConnectionRegistry {
        ConnectionRegistry::new(8, Duration::from_millis(100))
    }

    fn pong() -> ServerMessage {
        ServerMessage::Pong { data: None }
    }

    #[tokio::test]
    async fn test_send_to_unknown_is_false() {
        let registry = registry();
        assert!(!registry.send_to(ConnectionId::new(), pong()).await);
    }

    #[tokio::test]
    async fn test_send_to_delivers_in_order() {
        let registry = registry();
        let (id, mut rx) = registry.register();
        assert!(registry.send_to(id, pong()).await);
        assert!(
            registry
                .send_to(id, ServerMessage::TurnComplete { interrupted: false })
                .await
        );
        assert_eq!(rx.recv().await, Some(pong()));
        assert_eq!(
            rx.recv().await,
            Some(ServerMessage::TurnComplete { interrupted: false })
        );
        assert_eq!(registry.metadata(id).unwrap().messages_sent, 2);
    }

    #[tokio::test]
    async fn test_failed_send_unregisters_once() {
        let registry = registry();
        let (id, rx) = registry.register();
        drop(rx);
        assert!(!registry.send_to(id, pong()).await);
        assert!(!registry.is_registered(id));
        assert!(!registry.unregister(id));
        assert!(!registry.send_to(id, pong()).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_times_out_and_unregisters() {
        let registry = ConnectionRegistry::new(1, Duration::from_millis(50));
        let (id, _rx) = registry.register();
        assert!(registry.send_to(id, pong()).await);
        assert!(!registry.send_to(id, pong()).await);
        assert!(!registry.is_registered(id));
    }

    #[tokio::test]
    async fn test_broadcast_drops_dead_connections() {
        let registry = registry();
        let mut alive = Vec::new();
        let mut dead = Vec::new();
        for i in 0..5 {
            let (id, rx) = registry.register();
            if i % 2 == 1 {
                dead.push(id);
                drop(rx);
            } else {
                alive.push((id, rx));
            }
        }

        let outcome = registry.broadcast(&pong(), &HashSet::new()).await;
        assert_eq!(outcome, BroadcastOutcome { delivered: 3, failed: 2 });
        for id in dead {
            assert!(!registry.is_registered(id));
        }
        for (_, rx) in alive.iter_mut() {
            assert_eq!(rx.recv().await, Some(pong()));
        }
        assert_eq!(registry.count(), 3);
    }

    #[tokio::test]
    async fn test_broadcast_respects_exclusions_and_targets() {
        let registry = registry();
        let (a, _ra) = registry.register();
        let (b, mut rb) = registry.register();

        let outcome = registry.broadcast(&pong(), &HashSet::from([a])).await;
        assert_eq!(outcome.delivered, 1);
        assert_eq!(rb.recv().await, Some(pong()));

        let outcome = registry
            .send_to_targets(&pong(), &[b, ConnectionId::new()])
            .await;
        assert_eq!(outcome, BroadcastOutcome { delivered: 1, failed: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_metadata_retained_then_reaped() {
        let registry = registry();
        let (id, _rx) = registry.register();
        registry.record_inbound(id);
        registry.unregister(id);

        let stats = registry.statistics();
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.inactive_connections, 1);
        assert_eq!(stats.total_messages_received, 1);
        assert!(registry.connection_info(id).is_none());

        assert_eq!(registry.reap_metadata(Duration::from_secs(60)), 0);
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(registry.reap_metadata(Duration::from_secs(60)), 1);
        assert!(registry.metadata(id).is_none());
    }

    #[test]
    fn test_connection_id_round_trips_through_string() {
        let id = ConnectionId::new();
        assert_eq!(id.to_string().parse::<ConnectionId>().unwrap(), id);
        assert!("nope".parse::<ConnectionId>().is_err());
    }
}
