//! WebSocket upgrade handler
//!
//! Accepts socket upgrades, enforces the connection cap, and runs the
//! read loop for each connection. Authentication happens later, on the
//! first `join_session` message, so the upgrade itself only needs a free
//! connection slot.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Extension,
    },
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::error::ApiError;
use crate::services::auth::AuthService;
use crate::services::membership::MembershipVerifier;

use super::connection::{ConnectionHandle, ConnectionId, ConnectionLimiter};
use super::messages::{ClientMessage, ServerMessage};
use super::pubsub::SessionPubSub;
use super::registry::SessionRegistry;
use super::session::SessionHandler;

/// Tunables for established connections
#[derive(Debug, Clone)]
pub struct WsSettings {
    /// Connections with no inbound frame for this long are closed
    pub idle_timeout: Duration,

    /// Interval between server-initiated pings. Watch-only members send no
    /// frames of their own; their automatic pong replies are the inbound
    /// activity that keeps the idle window open.
    pub ping_interval: Duration,
}

impl WsSettings {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            idle_timeout,
            ping_interval: idle_timeout / 3,
        }
    }
}

/// WebSocket upgrade handler
///
/// Rejects with 503 before upgrading when the process is at its
/// connection cap.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Extension(registry): Extension<SessionRegistry>,
    Extension(pubsub): Extension<SessionPubSub>,
    Extension(auth): Extension<AuthService>,
    Extension(membership): Extension<Arc<dyn MembershipVerifier>>,
    Extension(limiter): Extension<ConnectionLimiter>,
    Extension(settings): Extension<WsSettings>,
) -> Response {
    let permit = match limiter.try_acquire() {
        Some(permit) => permit,
        None => {
            tracing::warn!(
                active = limiter.active(),
                "Rejecting WebSocket upgrade, connection limit reached"
            );
            return ApiError::ServiceBusy("connection limit reached".to_string()).into_response();
        }
    };

    ws.on_upgrade(move |socket| async move {
        handle_socket(socket, registry, pubsub, auth, membership, settings).await;
        drop(permit);
    })
}

/// Handle an established WebSocket connection
async fn handle_socket(
    socket: WebSocket,
    registry: SessionRegistry,
    pubsub: SessionPubSub,
    auth: AuthService,
    membership: Arc<dyn MembershipVerifier>,
    settings: WsSettings,
) {
    let connection_id = ConnectionId::new();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let connection = ConnectionHandle::new(connection_id, tx);

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Greeting carries the transient connection ID so clients can
    // correlate logs with the server's.
    let greeting = ServerMessage::Connected { connection_id };
    if let Ok(json) = serde_json::to_string(&greeting) {
        if ws_sender.send(Message::Text(json)).await.is_err() {
            tracing::debug!(connection_id = %connection_id, "Socket closed before greeting");
            return;
        }
    }

    let mut handler = SessionHandler::new(
        connection,
        registry,
        pubsub,
        auth,
        membership,
    );

    // Forward outbound messages (state syncs and relayed events) to the
    // socket, interleaved with keepalive pings. Runs until the channel or
    // the socket drops.
    let ping_interval = settings.ping_interval;
    let mut send_task = tokio::spawn(async move {
        let mut ping = tokio::time::interval(ping_interval);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Interval fires immediately; skip the tick at connect time
        ping.tick().await;

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    match serde_json::to_string(&msg) {
                        Ok(json) => {
                            if ws_sender.send(Message::Text(json)).await.is_err() {
                                tracing::debug!(connection_id = %connection_id, "WebSocket send failed");
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to serialize outbound message");
                        }
                    }
                }
                _ = ping.tick() => {
                    if ws_sender.send(Message::Ping(Vec::new())).await.is_err() {
                        tracing::debug!(connection_id = %connection_id, "WebSocket ping failed");
                        break;
                    }
                }
            }
        }
    });

    loop {
        let frame = match tokio::time::timeout(settings.idle_timeout, ws_receiver.next()).await {
            Ok(frame) => frame,
            Err(_) => {
                tracing::info!(connection_id = %connection_id, "Closing idle connection");
                break;
            }
        };

        match frame {
            Some(Ok(Message::Text(text))) => {
                let msg = match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(msg) => msg,
                    Err(e) => {
                        tracing::debug!(
                            error = %e,
                            connection_id = %connection_id,
                            "Dropping unparseable client message"
                        );
                        continue;
                    }
                };
                // Join failures close the socket without an error frame.
                if let Err(e) = handler.handle_message(msg).await {
                    e.log();
                    tracing::warn!(
                        connection_id = %connection_id,
                        "Closing connection after failed join"
                    );
                    break;
                }
            }
            Some(Ok(Message::Binary(_))) => {
                tracing::debug!(connection_id = %connection_id, "Ignoring binary message");
            }
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                // Keepalives are handled by axum
            }
            Some(Ok(Message::Close(_))) | None => {
                tracing::debug!(connection_id = %connection_id, "WebSocket closed by peer");
                break;
            }
            Some(Err(e)) => {
                tracing::debug!(error = %e, connection_id = %connection_id, "WebSocket error");
                break;
            }
        }
    }

    send_task.abort();
    let _ = (&mut send_task).await;
    handler.on_close();

    tracing::info!(connection_id = %connection_id, "WebSocket connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::{routing::get, Router};
    use std::net::SocketAddr;
    use tokio::time::timeout;
    use tokio_tungstenite::{connect_async, tungstenite};
    use uuid::Uuid;

    use crate::error::ApiResult;
    use crate::models::GroupRole;
    use crate::services::auth::AuthConfig;

    struct NoMembership;

    #[async_trait]
    impl MembershipVerifier for NoMembership {
        async fn authorize(&self, _: Uuid, _: Uuid) -> ApiResult<Option<GroupRole>> {
            Ok(None)
        }
    }

    async fn spawn_server(settings: WsSettings) -> SocketAddr {
        let pubsub = SessionPubSub::new_in_memory();
        let registry = SessionRegistry::new(pubsub.clone());
        let auth = AuthService::new(AuthConfig::new("unit-test-secret".to_string()));
        let membership: Arc<dyn MembershipVerifier> = Arc::new(NoMembership);
        let limiter = ConnectionLimiter::new(16);

        let app = Router::new()
            .route("/ws", get(ws_handler))
            .layer(Extension(registry))
            .layer(Extension(pubsub))
            .layer(Extension(auth))
            .layer(Extension(membership))
            .layer(Extension(limiter))
            .layer(Extension(settings));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind ephemeral port");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        addr
    }

    #[test]
    fn test_greeting_wire_format() {
        let id = ConnectionId::new();
        let json = serde_json::to_string(&ServerMessage::Connected { connection_id: id })
            .expect("serializes");
        let expected = format!(r#"{{"type":"connected","connection_id":"{}"}}"#, id);
        assert_eq!(json, expected);
    }

    #[test]
    fn test_settings_derive_ping_interval() {
        let settings = WsSettings::new(Duration::from_secs(300));
        assert_eq!(settings.idle_timeout, Duration::from_secs(300));
        assert_eq!(settings.ping_interval, Duration::from_secs(100));
    }

    #[tokio::test]
    async fn test_silent_connection_closed_after_idle_timeout() {
        // Ping interval longer than the test so no pong traffic arrives
        let addr = spawn_server(WsSettings {
            idle_timeout: Duration::from_millis(200),
            ping_interval: Duration::from_secs(30),
        })
        .await;

        let (mut ws, _) = connect_async(format!("ws://{addr}/ws"))
            .await
            .expect("connect");

        let greeting = ws.next().await.expect("greeting frame").expect("greeting");
        assert!(matches!(greeting, tungstenite::Message::Text(_)));

        // Send nothing; the server must close the socket on its own
        let closed = timeout(Duration::from_secs(3), async {
            loop {
                match ws.next().await {
                    None | Some(Ok(tungstenite::Message::Close(_))) | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        })
        .await;
        assert!(closed.is_ok(), "idle connection was not closed");
    }

    #[tokio::test]
    async fn test_pings_keep_watch_only_connection_alive() {
        // Several ping rounds fit inside each idle window
        let addr = spawn_server(WsSettings {
            idle_timeout: Duration::from_millis(500),
            ping_interval: Duration::from_millis(100),
        })
        .await;

        let (mut ws, _) = connect_async(format!("ws://{addr}/ws"))
            .await
            .expect("connect");

        // Read without ever writing, like a member who only watches. The
        // client answers server pings automatically while polling.
        let deadline = tokio::time::Instant::now() + Duration::from_millis(1500);
        let mut pings = 0;
        while tokio::time::Instant::now() < deadline {
            match timeout(Duration::from_millis(300), ws.next()).await {
                Ok(Some(Ok(tungstenite::Message::Ping(_)))) => pings += 1,
                Ok(Some(Ok(_))) => {}
                Ok(Some(Err(e))) => panic!("connection errored while watching: {e}"),
                Ok(None) => panic!("connection closed despite keepalive pings"),
                Err(_) => {}
            }
        }
        assert!(pings >= 3, "expected periodic pings, got {pings}");
    }
}
