//! Broadcast fabric for cross-process session fan-out
//!
//! Every server process sharing a watch session subscribes to that
//! session's channel and re-broadcasts inbound events to its own local
//! connections. Redis pub/sub backs multi-process deployments, with an
//! in-memory fallback for single-instance mode when Redis is unavailable.
//! Delivery is at-least-once and order-preserving per publisher; the
//! publishing process receives its own events too.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::messages::SessionEvent;

/// Channel capacity for broadcast channels
const BROADCAST_CAPACITY: usize = 256;

/// Redis channel prefix for session events
const CHANNEL_PREFIX: &str = "watch:session:";

/// Session broadcast fabric with Redis + in-memory fallback
#[derive(Clone)]
pub struct SessionPubSub {
    inner: Arc<SessionPubSubInner>,
}

enum SessionPubSubInner {
    /// Redis-backed pub/sub for multi-process deployments
    Redis(RedisFabric),
    /// In-memory pub/sub for single-process mode
    InMemory(InMemoryFabric),
}

impl SessionPubSub {
    /// Create a new fabric backed by Redis
    pub fn new_with_redis(client: redis::Client) -> Self {
        Self {
            inner: Arc::new(SessionPubSubInner::Redis(RedisFabric::new(client))),
        }
    }

    /// Create a new in-memory fabric (single process mode)
    pub fn new_in_memory() -> Self {
        Self {
            inner: Arc::new(SessionPubSubInner::InMemory(InMemoryFabric::new())),
        }
    }

    /// Try to create with Redis, fall back to in-memory
    pub async fn try_with_redis(redis_url: &str) -> Self {
        match redis::Client::open(redis_url) {
            Ok(client) => {
                // Test connection
                match client.get_multiplexed_async_connection().await {
                    Ok(mut conn) => {
                        let pong: Result<String, _> =
                            redis::cmd("PING").query_async(&mut conn).await;
                        if pong.is_ok() {
                            tracing::info!("Redis pub/sub connected for session fan-out");
                            return Self::new_with_redis(client);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Redis pub/sub connection failed");
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Redis client creation failed for pub/sub");
            }
        }

        tracing::warn!("Using in-memory pub/sub (single process mode only)");
        Self::new_in_memory()
    }

    /// Publish an event on a session's channel
    pub async fn publish(&self, session_id: Uuid, event: SessionEvent) {
        match &*self.inner {
            SessionPubSubInner::Redis(redis) => redis.publish(session_id, event).await,
            SessionPubSubInner::InMemory(memory) => memory.publish(session_id, event),
        }
    }

    /// Subscribe to a session's channel
    pub fn subscribe(&self, session_id: Uuid) -> broadcast::Receiver<SessionEvent> {
        match &*self.inner {
            SessionPubSubInner::Redis(redis) => redis.subscribe(session_id),
            SessionPubSubInner::InMemory(memory) => memory.subscribe(session_id),
        }
    }

    /// Drop the channel for a session that no longer has local members
    pub fn unsubscribe(&self, session_id: Uuid) {
        match &*self.inner {
            // The per-session filter task exits once its receivers are gone
            SessionPubSubInner::Redis(_) => {}
            SessionPubSubInner::InMemory(memory) => memory.unsubscribe(session_id),
        }
    }

    /// Check if we're using Redis (multi-process capable)
    pub fn is_redis_backed(&self) -> bool {
        matches!(&*self.inner, SessionPubSubInner::Redis(_))
    }

    /// Whether the Redis listener has given up reconnecting.
    ///
    /// A degraded fabric still delivers local publishes but drops every
    /// event from other processes; readiness reports it so the process
    /// gets rotated out.
    pub fn is_degraded(&self) -> bool {
        match &*self.inner {
            SessionPubSubInner::Redis(redis) => redis.degraded.load(Ordering::Acquire),
            SessionPubSubInner::InMemory(_) => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn degrade_for_tests(&self) {
        if let SessionPubSubInner::Redis(redis) = &*self.inner {
            redis.degraded.store(true, Ordering::Release);
        }
    }
}

/// Redis-backed fabric implementation
struct RedisFabric {
    client: redis::Client,
    /// Local broadcast for redistribution to local subscribers
    local_sender: broadcast::Sender<(Uuid, SessionEvent)>,
    /// Set when the listener exhausts its reconnect attempts
    degraded: Arc<AtomicBool>,
}

impl RedisFabric {
    fn new(client: redis::Client) -> Self {
        let (local_sender, _) = broadcast::channel(BROADCAST_CAPACITY);

        let fabric = Self {
            client,
            local_sender,
            degraded: Arc::new(AtomicBool::new(false)),
        };

        // Background task listening for Redis pub/sub messages
        fabric.start_listener();

        fabric
    }

    fn start_listener(&self) {
        let client = self.client.clone();
        let sender = self.local_sender.clone();
        let degraded = Arc::clone(&self.degraded);

        tokio::spawn(async move {
            const MAX_RECONNECT_DELAY_SECS: u64 = 60;
            const MAX_RECONNECT_ATTEMPTS: u32 = 100;

            let mut attempts = 0u32;
            let mut delay_secs = 1u64;

            loop {
                match Self::run_listener(&client, &sender).await {
                    Ok(()) => {
                        tracing::warn!("Redis pub/sub listener disconnected, reconnecting...");
                        // Reset backoff and attempt counter on clean disconnect
                        attempts = 0;
                        delay_secs = 1;
                    }
                    Err(e) => {
                        attempts += 1;
                        if attempts >= MAX_RECONNECT_ATTEMPTS {
                            tracing::error!(
                                "Redis pub/sub max reconnect attempts ({}) exceeded, giving up",
                                MAX_RECONNECT_ATTEMPTS
                            );
                            // Cross-process events are lost from here on;
                            // readiness reports the fabric as degraded.
                            degraded.store(true, Ordering::Release);
                            break;
                        }
                        tracing::error!(
                            error = %e,
                            attempt = attempts,
                            delay_secs = delay_secs,
                            "Redis pub/sub listener error, reconnecting..."
                        );
                    }
                }

                tokio::time::sleep(tokio::time::Duration::from_secs(delay_secs)).await;
                delay_secs = (delay_secs * 2).min(MAX_RECONNECT_DELAY_SECS);
            }
        });
    }

    async fn run_listener(
        client: &redis::Client,
        sender: &broadcast::Sender<(Uuid, SessionEvent)>,
    ) -> Result<(), redis::RedisError> {
        use futures_util::StreamExt;

        let conn = client.get_async_connection().await?;
        let mut pubsub = conn.into_pubsub();

        pubsub.psubscribe(format!("{CHANNEL_PREFIX}*")).await?;

        let mut stream = pubsub.on_message();

        while let Some(msg) = stream.next().await {
            let channel: String = msg.get_channel_name().to_string();
            let payload: Vec<u8> = msg.get_payload_bytes().to_vec();

            // Channel format: watch:session:{session_id}
            if let Some(session_id_str) = channel.strip_prefix(CHANNEL_PREFIX) {
                if let Ok(session_id) = Uuid::parse_str(session_id_str) {
                    match serde_json::from_slice::<SessionEvent>(&payload) {
                        Ok(event) => {
                            // Broadcast to local subscribers
                            let _ = sender.send((session_id, event));
                        }
                        Err(e) => {
                            tracing::warn!(
                                error = %e,
                                session_id = %session_id,
                                "Discarding undecodable fabric event"
                            );
                        }
                    }
                }
            }
        }

        Ok(())
    }

    async fn publish(&self, session_id: Uuid, event: SessionEvent) {
        let channel = format!("{CHANNEL_PREFIX}{session_id}");

        match serde_json::to_string(&event) {
            Ok(payload) => {
                match self.client.get_multiplexed_async_connection().await {
                    Ok(mut conn) => {
                        let result: Result<(), _> = redis::cmd("PUBLISH")
                            .arg(&channel)
                            .arg(&payload)
                            .query_async(&mut conn)
                            .await;

                        if let Err(e) = result {
                            tracing::error!(error = %e, "Failed to publish to Redis");
                            // Fall back to local broadcast
                            let _ = self.local_sender.send((session_id, event));
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to get Redis connection for publish");
                        // Fall back to local broadcast
                        let _ = self.local_sender.send((session_id, event));
                    }
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize session event");
            }
        }
    }

    fn subscribe(&self, session_id: Uuid) -> broadcast::Receiver<SessionEvent> {
        // Filtered receiver that only gets events for this session
        let (tx, rx) = broadcast::channel(BROADCAST_CAPACITY);
        let mut global_rx = self.local_sender.subscribe();

        tokio::spawn(async move {
            while let Ok((event_session_id, event)) = global_rx.recv().await {
                if event_session_id == session_id && tx.send(event).is_err() {
                    // No more receivers, stop filtering
                    break;
                }
            }
        });

        rx
    }
}

/// In-memory fabric implementation for single-process mode
struct InMemoryFabric {
    /// Per-session broadcast channels
    channels: dashmap::DashMap<Uuid, broadcast::Sender<SessionEvent>>,
}

impl InMemoryFabric {
    fn new() -> Self {
        Self {
            channels: dashmap::DashMap::new(),
        }
    }

    fn publish(&self, session_id: Uuid, event: SessionEvent) {
        if let Some(sender) = self.channels.get(&session_id) {
            // Ignore send errors (no receivers)
            let _ = sender.send(event);
        }
    }

    fn subscribe(&self, session_id: Uuid) -> broadcast::Receiver<SessionEvent> {
        let sender = self
            .channels
            .entry(session_id)
            .or_insert_with(|| broadcast::channel(BROADCAST_CAPACITY).0);
        sender.subscribe()
    }

    fn unsubscribe(&self, session_id: Uuid) {
        self.channels.remove(&session_id);
    }
}
