//! Per-connection message dispatch
//!
//! One `SessionHandler` per live socket. It owns the connection's
//! authentication state (user identity, joined session, cached role) and
//! routes inbound control messages.
//!
//! Failure policy is deliberately asymmetric: a failed join closes the
//! socket with no explanation (an unauthenticated connection has no
//! legitimate use), while denied or malformed steady-state messages are
//! silently dropped so a buggy or hostile client cannot disturb the rest
//! of the room.

use std::sync::Arc;

use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::models::GroupRole;
use crate::services::auth::AuthService;
use crate::services::membership::MembershipVerifier;

use super::connection::ConnectionHandle;
use super::messages::{ClientMessage, PlaybackCommand, ServerMessage, SessionEvent};
use super::pubsub::SessionPubSub;
use super::registry::SessionRegistry;

/// Handles inbound messages for a single connection
pub struct SessionHandler {
    connection: ConnectionHandle,
    registry: SessionRegistry,
    pubsub: SessionPubSub,
    auth: AuthService,
    membership: Arc<dyn MembershipVerifier>,

    /// Authenticated user, set by the first successful join
    user_id: Option<Uuid>,
    /// Session this connection is currently a member of
    session_id: Option<Uuid>,
    /// Role within the session's group, cached for the membership lifetime
    role: Option<GroupRole>,
}

impl SessionHandler {
    /// Create a handler for a freshly accepted connection
    pub fn new(
        connection: ConnectionHandle,
        registry: SessionRegistry,
        pubsub: SessionPubSub,
        auth: AuthService,
        membership: Arc<dyn MembershipVerifier>,
    ) -> Self {
        Self {
            connection,
            registry,
            pubsub,
            auth,
            membership,
            user_id: None,
            session_id: None,
            role: None,
        }
    }

    /// Dispatch an inbound client message.
    ///
    /// An `Err` is fatal to the connection (only join failures produce
    /// one); the caller closes the socket without sending anything.
    pub async fn handle_message(&mut self, message: ClientMessage) -> ApiResult<()> {
        match message {
            ClientMessage::JoinSession { session_id, token } => {
                self.handle_join(session_id, &token).await
            }
            ClientMessage::LeaveSession { session_id, token } => {
                self.handle_leave(session_id, &token);
                Ok(())
            }
            ClientMessage::Play {
                session_id,
                timestamp,
            } => {
                self.handle_control(PlaybackCommand::Play, session_id, timestamp)
                    .await;
                Ok(())
            }
            ClientMessage::Pause {
                session_id,
                timestamp,
            } => {
                self.handle_control(PlaybackCommand::Pause, session_id, timestamp)
                    .await;
                Ok(())
            }
            ClientMessage::Seek {
                session_id,
                timestamp,
            } => {
                self.handle_control(PlaybackCommand::Seek, session_id, timestamp)
                    .await;
                Ok(())
            }
        }
    }

    /// Authenticate, authorize and register a session join.
    ///
    /// On success the connection immediately receives one state-sync
    /// message so late joiners see the current play/pause position without
    /// waiting for the next control event.
    async fn handle_join(&mut self, session_id: Uuid, token: &str) -> ApiResult<()> {
        let claims = self.auth.verify_token(token)?;

        let role = self
            .membership
            .authorize(session_id, claims.sub)
            .await?
            .ok_or_else(|| ApiError::Forbidden("no membership for session".into()))?;

        // A connection belongs to at most one session; joining another
        // implicitly leaves the previous one.
        if let Some(previous) = self.session_id.take() {
            if previous != session_id {
                self.registry.leave(previous, self.connection.id);
            }
        }

        self.user_id = Some(claims.sub);
        self.role = Some(role);
        self.session_id = Some(session_id);

        self.registry.join(session_id, self.connection.clone());

        let state = self.registry.current_playback(session_id);
        let _ = self.connection.send(ServerMessage::state_sync(&state));

        tracing::info!(
            user_id = %claims.sub,
            session_id = %session_id,
            connection_id = %self.connection.id,
            role = %role,
            "User joined watch session"
        );

        Ok(())
    }

    /// Deregister from a session, but only for the identity that joined.
    ///
    /// A token for a different user (stale or forged) is silently ignored
    /// so it cannot evict someone else's connection.
    fn handle_leave(&mut self, session_id: Uuid, token: &str) {
        let claims = match self.auth.verify_token(token) {
            Ok(claims) => claims,
            Err(e) => {
                tracing::debug!(error = %e, "Dropping leave with unverifiable token");
                return;
            }
        };

        if self.user_id != Some(claims.sub) {
            tracing::debug!(
                connection_id = %self.connection.id,
                "Dropping leave for a different user"
            );
            return;
        }

        self.registry.leave(session_id, self.connection.id);
        if self.session_id == Some(session_id) {
            self.session_id = None;
            self.role = None;
        }

        tracing::info!(
            user_id = %claims.sub,
            session_id = %session_id,
            "User left watch session"
        );
    }

    /// Validate and publish a playback control event.
    ///
    /// Requires the caller to be joined to the target session with a
    /// playback-control role; everything else is dropped without a reply.
    async fn handle_control(&self, kind: PlaybackCommand, session_id: Uuid, timestamp: u64) {
        let authorized = self.session_id == Some(session_id)
            && self.role.is_some_and(|role| role.can_control_playback());

        if !authorized {
            tracing::debug!(
                connection_id = %self.connection.id,
                session_id = %session_id,
                kind = %kind,
                "Dropping unauthorized playback command"
            );
            return;
        }

        let event = SessionEvent {
            kind,
            timestamp,
            sender: self.connection.id,
        };
        self.pubsub.publish(session_id, event).await;
    }

    /// Release session membership when the socket goes away.
    ///
    /// Idempotent: closing twice, or closing a connection that never
    /// joined, is a no-op.
    pub fn on_close(&mut self) {
        if let Some(session_id) = self.session_id.take() {
            self.registry.leave(session_id, self.connection.id);
            self.role = None;
            tracing::info!(
                connection_id = %self.connection.id,
                session_id = %session_id,
                "Disconnected connection removed from session"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use rstest::rstest;
    use std::collections::HashMap;
    use tokio::sync::mpsc;
    use tokio::time::{sleep, Duration};

    use crate::services::auth::AuthConfig;
    use crate::ws::connection::ConnectionId;

    /// Fixed membership table standing in for the external database
    struct StaticMembership {
        roles: HashMap<(Uuid, Uuid), GroupRole>,
    }

    impl StaticMembership {
        fn new(entries: &[(Uuid, Uuid, GroupRole)]) -> Arc<Self> {
            Arc::new(Self {
                roles: entries
                    .iter()
                    .map(|(session, user, role)| ((*session, *user), *role))
                    .collect(),
            })
        }
    }

    #[async_trait]
    impl MembershipVerifier for StaticMembership {
        async fn authorize(
            &self,
            session_id: Uuid,
            user_id: Uuid,
        ) -> ApiResult<Option<GroupRole>> {
            Ok(self.roles.get(&(session_id, user_id)).copied())
        }
    }

    struct TestEnv {
        registry: SessionRegistry,
        pubsub: SessionPubSub,
        auth: AuthService,
        membership: Arc<StaticMembership>,
    }

    impl TestEnv {
        fn new(entries: &[(Uuid, Uuid, GroupRole)]) -> Self {
            let pubsub = SessionPubSub::new_in_memory();
            Self {
                registry: SessionRegistry::new(pubsub.clone()),
                pubsub,
                auth: AuthService::new(AuthConfig::new("unit-test-secret".to_string())),
                membership: StaticMembership::new(entries),
            }
        }

        fn handler(&self) -> (SessionHandler, mpsc::UnboundedReceiver<ServerMessage>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let connection = ConnectionHandle::new(ConnectionId::new(), tx);
            let handler = SessionHandler::new(
                connection,
                self.registry.clone(),
                self.pubsub.clone(),
                self.auth.clone(),
                self.membership.clone(),
            );
            (handler, rx)
        }

        fn token_for(&self, user_id: Uuid) -> String {
            self.auth.issue_token_for_tests(user_id)
        }
    }

    fn join_msg(session_id: Uuid, token: &str) -> ClientMessage {
        ClientMessage::JoinSession {
            session_id,
            token: token.to_string(),
        }
    }

    #[tokio::test]
    async fn test_join_sends_exactly_one_state_sync() {
        let session_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        let env = TestEnv::new(&[(session_id, user_id, GroupRole::Member)]);
        let (mut handler, mut rx) = env.handler();

        handler
            .handle_message(join_msg(session_id, &env.token_for(user_id)))
            .await
            .unwrap();

        // Fresh session: paused at zero, no delivery metadata
        assert_matches!(
            rx.try_recv().unwrap(),
            ServerMessage::Pause {
                timestamp: 0,
                metadata: None
            }
        );
        assert!(rx.try_recv().is_err());
        assert_eq!(env.registry.member_count(session_id), 1);
    }

    #[tokio::test]
    async fn test_join_with_bad_token_is_fatal() {
        let session_id = Uuid::new_v4();
        let env = TestEnv::new(&[]);
        let (mut handler, mut rx) = env.handler();

        let result = handler
            .handle_message(join_msg(session_id, "garbage-token"))
            .await;

        assert_matches!(result, Err(ApiError::InvalidToken(_)));
        // Fail closed: nothing sent, nothing registered
        assert!(rx.try_recv().is_err());
        assert_eq!(env.registry.member_count(session_id), 0);
    }

    #[tokio::test]
    async fn test_join_without_membership_is_fatal() {
        let session_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        // Session exists for someone else; the caller has no role
        let env = TestEnv::new(&[(session_id, Uuid::new_v4(), GroupRole::Admin)]);
        let (mut handler, mut rx) = env.handler();

        let result = handler
            .handle_message(join_msg(session_id, &env.token_for(user_id)))
            .await;

        assert_matches!(result, Err(ApiError::Forbidden(_)));
        assert!(rx.try_recv().is_err());
        assert_eq!(env.registry.member_count(session_id), 0);
    }

    #[rstest]
    #[case::member(GroupRole::Member, false)]
    #[case::admin(GroupRole::Admin, true)]
    #[case::owner(GroupRole::Owner, true)]
    #[tokio::test]
    async fn test_playback_control_by_role(#[case] role: GroupRole, #[case] relayed: bool) {
        let session_id = Uuid::new_v4();
        let sender_id = Uuid::new_v4();
        let other_id = Uuid::new_v4();
        let env = TestEnv::new(&[
            (session_id, sender_id, role),
            (session_id, other_id, GroupRole::Member),
        ]);

        let (mut sender, mut sender_rx) = env.handler();
        let (mut other, mut other_rx) = env.handler();

        sender
            .handle_message(join_msg(session_id, &env.token_for(sender_id)))
            .await
            .unwrap();
        other
            .handle_message(join_msg(session_id, &env.token_for(other_id)))
            .await
            .unwrap();

        // Drain the state syncs
        sender_rx.try_recv().unwrap();
        other_rx.try_recv().unwrap();

        sender
            .handle_message(ClientMessage::Pause {
                session_id,
                timestamp: 120,
            })
            .await
            .unwrap();

        sleep(Duration::from_millis(50)).await;

        if relayed {
            assert_matches!(
                other_rx.try_recv().unwrap(),
                ServerMessage::Pause {
                    timestamp: 120,
                    metadata: Some(_)
                }
            );
        } else {
            assert!(other_rx.try_recv().is_err());
        }
        // The sender never hears its own command back
        assert!(sender_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_late_joiner_receives_recorded_state() {
        let session_id = Uuid::new_v4();
        let admin_id = Uuid::new_v4();
        let member_id = Uuid::new_v4();
        let late_id = Uuid::new_v4();
        let env = TestEnv::new(&[
            (session_id, admin_id, GroupRole::Admin),
            (session_id, member_id, GroupRole::Member),
            (session_id, late_id, GroupRole::Member),
        ]);

        let (mut admin, _admin_rx) = env.handler();
        let (mut member, mut member_rx) = env.handler();

        admin
            .handle_message(join_msg(session_id, &env.token_for(admin_id)))
            .await
            .unwrap();
        member
            .handle_message(join_msg(session_id, &env.token_for(member_id)))
            .await
            .unwrap();
        member_rx.try_recv().unwrap(); // state sync

        admin
            .handle_message(ClientMessage::Pause {
                session_id,
                timestamp: 120,
            })
            .await
            .unwrap();
        sleep(Duration::from_millis(50)).await;

        assert_matches!(
            member_rx.try_recv().unwrap(),
            ServerMessage::Pause {
                timestamp: 120,
                metadata: Some(_)
            }
        );

        // A third member joining now syncs straight to pause@120
        let (mut late, mut late_rx) = env.handler();
        late.handle_message(join_msg(session_id, &env.token_for(late_id)))
            .await
            .unwrap();

        assert_matches!(
            late_rx.try_recv().unwrap(),
            ServerMessage::Pause {
                timestamp: 120,
                metadata: None
            }
        );
    }

    #[tokio::test]
    async fn test_control_for_other_session_is_dropped() {
        let session_id = Uuid::new_v4();
        let other_session = Uuid::new_v4();
        let admin_id = Uuid::new_v4();
        let env = TestEnv::new(&[
            (session_id, admin_id, GroupRole::Admin),
            (other_session, admin_id, GroupRole::Admin),
        ]);

        let (mut admin, _rx) = env.handler();
        admin
            .handle_message(join_msg(session_id, &env.token_for(admin_id)))
            .await
            .unwrap();

        // Admin of the other session too, but not joined to it
        let mut other_rx = env.pubsub.subscribe(other_session);
        admin
            .handle_message(ClientMessage::Play {
                session_id: other_session,
                timestamp: 10,
            })
            .await
            .unwrap();

        sleep(Duration::from_millis(20)).await;
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_never_joined_connection_cannot_broadcast() {
        let session_id = Uuid::new_v4();
        let env = TestEnv::new(&[]);
        let (mut handler, _rx) = env.handler();

        let mut fabric_rx = env.pubsub.subscribe(session_id);
        handler
            .handle_message(ClientMessage::Play {
                session_id,
                timestamp: 1,
            })
            .await
            .unwrap();

        sleep(Duration::from_millis(20)).await;
        assert!(fabric_rx.try_recv().is_err());
        assert_eq!(env.registry.member_count(session_id), 0);
    }

    #[tokio::test]
    async fn test_forged_leave_does_not_evict() {
        let session_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        let attacker_id = Uuid::new_v4();
        let env = TestEnv::new(&[(session_id, user_id, GroupRole::Member)]);

        let (mut handler, _rx) = env.handler();
        handler
            .handle_message(join_msg(session_id, &env.token_for(user_id)))
            .await
            .unwrap();
        assert_eq!(env.registry.member_count(session_id), 1);

        // Valid token, wrong identity: silently ignored
        handler
            .handle_message(ClientMessage::LeaveSession {
                session_id,
                token: env.token_for(attacker_id),
            })
            .await
            .unwrap();
        assert_eq!(env.registry.member_count(session_id), 1);

        // Unverifiable token: also ignored
        handler
            .handle_message(ClientMessage::LeaveSession {
                session_id,
                token: "garbage".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(env.registry.member_count(session_id), 1);
    }

    #[tokio::test]
    async fn test_leave_with_matching_identity_deregisters() {
        let session_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        let env = TestEnv::new(&[(session_id, user_id, GroupRole::Admin)]);

        let (mut handler, _rx) = env.handler();
        handler
            .handle_message(join_msg(session_id, &env.token_for(user_id)))
            .await
            .unwrap();

        handler
            .handle_message(ClientMessage::LeaveSession {
                session_id,
                token: env.token_for(user_id),
            })
            .await
            .unwrap();
        assert_eq!(env.registry.member_count(session_id), 0);

        // Role was cleared with the membership: control is now dropped
        let mut fabric_rx = env.pubsub.subscribe(session_id);
        handler
            .handle_message(ClientMessage::Play {
                session_id,
                timestamp: 5,
            })
            .await
            .unwrap();
        sleep(Duration::from_millis(20)).await;
        assert!(fabric_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_joining_second_session_leaves_first() {
        let session_a = Uuid::new_v4();
        let session_b = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        let env = TestEnv::new(&[
            (session_a, user_id, GroupRole::Member),
            (session_b, user_id, GroupRole::Member),
        ]);

        let (mut handler, _rx) = env.handler();
        handler
            .handle_message(join_msg(session_a, &env.token_for(user_id)))
            .await
            .unwrap();
        handler
            .handle_message(join_msg(session_b, &env.token_for(user_id)))
            .await
            .unwrap();

        // At most one session per connection
        assert_eq!(env.registry.member_count(session_a), 0);
        assert_eq!(env.registry.member_count(session_b), 1);
    }

    #[tokio::test]
    async fn test_on_close_is_idempotent() {
        let session_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        let env = TestEnv::new(&[(session_id, user_id, GroupRole::Member)]);

        let (mut handler, _rx) = env.handler();
        handler
            .handle_message(join_msg(session_id, &env.token_for(user_id)))
            .await
            .unwrap();
        assert_eq!(env.registry.member_count(session_id), 1);

        handler.on_close();
        assert_eq!(env.registry.member_count(session_id), 0);
        handler.on_close();
        assert_eq!(env.registry.member_count(session_id), 0);
    }

    #[tokio::test]
    async fn test_on_close_before_join_is_noop() {
        let env = TestEnv::new(&[]);
        let (mut handler, _rx) = env.handler();
        handler.on_close();
        assert_eq!(env.registry.session_count(), 0);
    }
}
