//! Message Engine (§4.E): the dispatch table keyed by `messageType` and the handlers for
//! login, registration, logout, send-message, heartbeat, and the explicit read receipt.
//!
//! Every handler returns the frame(s) to write back to the *originating* socket; delivery to
//! a different user's socket goes through `ConnectionHub::send_to_user` directly. Heartbeats
//! and admission-gated sends are distinguished explicitly rather than by a generic priority
//! field, matching §4.E's "heartbeats bypass backpressure" rule.

use std::sync::Arc;
use std::time::Duration;

use fc_common::{ChatMessage, DeliveryStatus, ErrorKind, FailureInfo, FailureType, MessageType};
use fc_registry::{ClientRegistry, SharedClientState};
use fc_robustness::{CircuitBreakerRegistry, FailureRecoveryRegistry};
use fc_session::SessionManager;
use fc_stats::StatsRegistry;
use serde_json::json;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use crate::connection::ConnectionHub;
use crate::crypto;
use crate::db::{ChatRepository, DbError};
use crate::ordering::DeliveryOrderer;
use crate::wire::{encode_frame, FrameError};
use fc_backpressure::BackpressureController;

const DB_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("authentication error: {0}")]
    Auth(String),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Protocol(_) | EngineError::Frame(_) => ErrorKind::ClientProtocolError,
            EngineError::Auth(_) => ErrorKind::AuthError,
        }
    }
}

/// Internal lifecycle notifications consumed by the Lifecycle orchestrator and the stats
/// layer; not written to any socket directly.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    UserOnline(u64),
    UserOffline(u64),
}

pub struct EngineConfig {
    pub login_signing_key: Vec<u8>,
    pub group_key_salt: String,
}

pub struct MessageEngine {
    registry: Arc<ClientRegistry>,
    sessions: Arc<SessionManager>,
    repo: Arc<dyn ChatRepository>,
    backpressure: Arc<BackpressureController>,
    breakers: Arc<CircuitBreakerRegistry>,
    recovery: Arc<FailureRecoveryRegistry>,
    stats: Arc<StatsRegistry>,
    orderer: Arc<DeliveryOrderer>,
    hub: Arc<ConnectionHub>,
    events: broadcast::Sender<EngineEvent>,
    config: EngineConfig,
}

impl MessageEngine {
    pub fn new(
        registry: Arc<ClientRegistry>,
        sessions: Arc<SessionManager>,
        repo: Arc<dyn ChatRepository>,
        backpressure: Arc<BackpressureController>,
        breakers: Arc<CircuitBreakerRegistry>,
        recovery: Arc<FailureRecoveryRegistry>,
        stats: Arc<StatsRegistry>,
        orderer: Arc<DeliveryOrderer>,
        hub: Arc<ConnectionHub>,
        config: EngineConfig,
    ) -> Self {
        let (events, _rx) = broadcast::channel(1024);
        Self { registry, sessions, repo, backpressure, breakers, recovery, stats, orderer, hub, events, config }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Number of per-user delivery-ordering workers currently alive; exposed for operational
    /// introspection only.
    pub fn active_delivery_groups(&self) -> usize {
        self.orderer.active_groups()
    }

    /// Dispatches one parsed frame for `socket_id`, returning the reply frame (if any) to
    /// write back to the same connection. Errors are turned into an `ERROR` reply frame by
    /// the caller rather than propagated, so one bad frame never tears down the socket.
    pub async fn dispatch(&self, socket_id: u64, state: &SharedClientState, msg: fc_common::Message) -> Option<Vec<u8>> {
        if msg.heartbeat_flag {
            return self.handle_heartbeat().await.ok();
        }
        let message_type = MessageType::from_code(msg.message_type);
        let result = match message_type {
            MessageType::LoginRequest => self.handle_login(socket_id, state, msg.body).await,
            MessageType::RegisterRequest => self.handle_register(msg.body).await,
            MessageType::LogoutRequest => self.handle_logout(state).await,
            MessageType::SendMessage => self.handle_send_message(state, msg.body).await,
            MessageType::MessageRead => self.handle_read_receipt(msg.body).await,
            MessageType::Heartbeat => self.handle_heartbeat().await,
            other => {
                warn!(?other, "no handler registered for message type");
                Err(EngineError::Protocol(format!("unsupported message type {}", msg.message_type)))
            }
        };
        match result {
            Ok(frame) => Some(frame),
            Err(err) => {
                warn!(error = %err, "dispatch failed, replying with an error frame");
                encode_error_frame(&err).ok()
            }
        }
    }

    async fn handle_login(&self, socket_id: u64, state: &SharedClientState, body: serde_json::Value) -> Result<Vec<u8>, EngineError> {
        let username_or_email = body
            .get("username_or_email")
            .and_then(|v| v.as_str())
            .ok_or_else(|| EngineError::Protocol("login requires username_or_email".into()))?;
        let password = body
            .get("password")
            .and_then(|v| v.as_str())
            .ok_or_else(|| EngineError::Protocol("login requires password".into()))?;
        let alg = body.get("alg").and_then(|v| v.as_str()).unwrap_or("hmac-sha256");
        let signature = body.get("signature").and_then(|v| v.as_str());

        if let Some(signature) = signature {
            let payload = format!("{}:{}", username_or_email, password);
            let ok = crypto::verify_login_signature(alg, payload.as_bytes(), signature, &self.config.login_signing_key)
                .map_err(|e| EngineError::Auth(e.to_string()))?;
            if !ok {
                self.stats.record_auth_failure();
                return Err(EngineError::Auth("signature verification failed".into()));
            }
        }

        let user = tokio::time::timeout(DB_QUERY_TIMEOUT, self.repo.find_user_by_username(username_or_email))
            .await
            .map_err(|_| EngineError::Auth("database timed out during login".into()))?
            .map_err(|e| EngineError::Auth(e.to_string()))?;

        let Some(user) = user else {
            self.stats.record_auth_failure();
            return Err(EngineError::Auth("unknown username or password".into()));
        };
        if password != user.password_hash {
            self.stats.record_auth_failure();
            return Err(EngineError::Auth("unknown username or password".into()));
        }

        let token = self.sessions.create(user.user_id, "unknown-device".to_string(), "unknown-ip".to_string(), None);
        self.registry.bind_user(socket_id, user.user_id);
        {
            let mut guard = state.write();
            guard.user_id = Some(user.user_id);
            guard.session_token = Some(token.clone());
        }
        let _ = self.events.send(EngineEvent::UserOnline(user.user_id));
        info!(user_id = user.user_id, "login succeeded");

        encode_frame(
            false,
            MessageType::LoginResponse.code(),
            &json!({"user_id": user.user_id, "username": user.username, "token": token}),
        )
        .map_err(EngineError::from)
    }

    async fn handle_register(&self, body: serde_json::Value) -> Result<Vec<u8>, EngineError> {
        let username = body
            .get("username")
            .and_then(|v| v.as_str())
            .ok_or_else(|| EngineError::Protocol("register requires username".into()))?;
        let password_hash = body
            .get("password_hash")
            .and_then(|v| v.as_str())
            .ok_or_else(|| EngineError::Protocol("register requires password_hash".into()))?;

        let result = tokio::time::timeout(DB_QUERY_TIMEOUT, self.repo.register_user(username, password_hash))
            .await
            .map_err(|_| EngineError::Protocol("database timed out during registration".into()))?;

        match result {
            Ok(user_id) => {
                encode_frame(false, MessageType::LoginResponse.code(), &json!({"user_id": user_id, "username": username}))
                    .map_err(EngineError::from)
            }
            Err(DbError::DuplicateUsername(name)) => Err(EngineError::Protocol(format!("username {name} is already taken"))),
            Err(e) => Err(EngineError::Protocol(e.to_string())),
        }
    }

    async fn handle_logout(&self, state: &SharedClientState) -> Result<Vec<u8>, EngineError> {
        let (user_id, token) = {
            let guard = state.read();
            (guard.user_id, guard.session_token.clone())
        };
        if let Some(token) = token {
            self.sessions.remove(&token);
        }
        if let Some(user_id) = user_id {
            let _ = self.events.send(EngineEvent::UserOffline(user_id));
        }
        {
            let mut guard = state.write();
            guard.user_id = None;
            guard.session_token = None;
        }
        encode_frame(false, MessageType::LogoutRequest.code(), &json!({"ok": true})).map_err(EngineError::from)
    }

    async fn handle_send_message(&self, state: &SharedClientState, body: serde_json::Value) -> Result<Vec<u8>, EngineError> {
        let sender = {
            let guard = state.read();
            guard
                .user_id
                .ok_or_else(|| EngineError::Auth("send-message requires an authenticated connection".into()))?
        };

        if !self.backpressure.can_enqueue() {
            return Err(EngineError::Protocol("server is shedding load, message dropped".into()));
        }

        let message_id = body
            .get("message_id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| EngineError::Protocol("send-message requires a valid message_id".into()))?;
        let receiver = body
            .get("receiver")
            .and_then(|v| v.as_str())
            .ok_or_else(|| EngineError::Protocol("send-message requires receiver".into()))?
            .to_string();
        let content = body
            .get("content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| EngineError::Protocol("send-message requires content".into()))?
            .to_string();
        let message_type = body.get("message_type").and_then(|v| v.as_str()).unwrap_or("text").to_string();

        let receiver_user = tokio::time::timeout(DB_QUERY_TIMEOUT, self.repo.find_user_by_username(&receiver))
            .await
            .map_err(|_| EngineError::Protocol("database timed out resolving receiver".into()))?
            .map_err(|e| EngineError::Protocol(e.to_string()))?
            .ok_or_else(|| EngineError::Protocol(format!("unknown receiver {receiver}")))?;

        self.backpressure.record_arrival();
        let chat_message = ChatMessage {
            message_id,
            sender: sender.to_string(),
            receiver: receiver.clone(),
            content,
            message_type,
            timestamp: crate::db::now_timestamp_millis(),
            status: DeliveryStatus::Pending,
        };

        if !self.breakers.allow_request("database") {
            self.backpressure.record_drain();
            return Err(EngineError::Protocol("database is unavailable".into()));
        }

        let repo = self.repo.clone();
        let hub = self.hub.clone();
        let registry = self.registry.clone();
        let backpressure = self.backpressure.clone();
        let breakers = self.breakers.clone();
        let recovery = self.recovery.clone();
        let receiver_user_id = receiver_user.user_id;
        let group_key = hex::encode(crypto::derive_group_key(receiver_user_id, &self.config.group_key_salt));

        self.orderer.submit(
            &group_key,
            Box::pin(async move {
                let persisted = tokio::time::timeout(DB_QUERY_TIMEOUT, repo.insert_message(&chat_message)).await;
                match persisted {
                    Ok(Ok(())) => {
                        breakers.record_success("database");
                    }
                    Ok(Err(DbError::DuplicateMessage(_))) => {
                        // already delivered on a prior attempt; ack but don't re-forward
                        breakers.record_success("database");
                        backpressure.record_drain();
                        return;
                    }
                    Ok(Err(e)) => {
                        breakers.record_failure("database");
                        let outcome = recovery.report_failure(&FailureInfo {
                            failure_type: FailureType::DatabaseFailure,
                            component: "database".into(),
                            description: e.to_string(),
                            timestamp: chrono::Utc::now(),
                            severity: 5,
                            context: std::collections::HashMap::new(),
                        });
                        if outcome.emergency {
                            warn!("database failures have escalated to emergency severity");
                        }
                        backpressure.record_drain();
                        return;
                    }
                    Err(_) => {
                        breakers.record_failure("database");
                        backpressure.record_drain();
                        return;
                    }
                }
                if let Some(receiver_state) = registry.get_by_user(receiver_user_id) {
                    let (online, socket_id) = {
                        let guard = receiver_state.read();
                        (guard.is_authenticated(), guard.socket_id)
                    };
                    if online {
                        if let Ok(frame) = encode_frame(
                            false,
                            MessageType::MessageReceived.code(),
                            &json!({
                                "message_id": chat_message.message_id,
                                "sender": chat_message.sender,
                                "content": chat_message.content,
                                "message_type": chat_message.message_type,
                                "timestamp": chat_message.timestamp,
                            }),
                        ) {
                            if hub.send_to_socket(socket_id, frame).await {
                                let _ = repo.mark_status(chat_message.message_id, DeliveryStatus::Delivered).await;
                            }
                        }
                    }
                }
                backpressure.record_drain();
            }),
        );

        self.stats.record_message_sent();
        encode_frame(
            false,
            MessageType::SendMessage.code(),
            &json!({"message_id": message_id, "status": "accepted"}),
        )
        .map_err(EngineError::from)
    }

    async fn handle_read_receipt(&self, body: serde_json::Value) -> Result<Vec<u8>, EngineError> {
        let message_id = body
            .get("message_id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| EngineError::Protocol("read receipt requires a valid message_id".into()))?;
        tokio::time::timeout(DB_QUERY_TIMEOUT, self.repo.mark_status(message_id, DeliveryStatus::Read))
            .await
            .map_err(|_| EngineError::Protocol("database timed out marking message read".into()))?
            .map_err(|e| EngineError::Protocol(e.to_string()))?;
        encode_frame(false, MessageType::MessageRead.code(), &json!({"message_id": message_id, "status": "read"})).map_err(EngineError::from)
    }

    /// Called once per connection teardown (§4.D): drops this connection's session token and
    /// fires `UserOffline` if the connection was authenticated. Other sessions/devices for the
    /// same user are left untouched.
    pub async fn handle_disconnect(&self, state: &SharedClientState) {
        let (user_id, token) = {
            let guard = state.read();
            (guard.user_id, guard.session_token.clone())
        };
        if let Some(token) = token {
            self.sessions.remove(&token);
        }
        if let Some(user_id) = user_id {
            let _ = self.events.send(EngineEvent::UserOffline(user_id));
        }
    }

    async fn handle_heartbeat(&self) -> Result<Vec<u8>, EngineError> {
        encode_frame(true, MessageType::HeartbeatResponse.code(), &json!({"ts": fc_common::now_millis()})).map_err(EngineError::from)
    }
}

fn encode_error_frame(err: &EngineError) -> Result<Vec<u8>, FrameError> {
    encode_frame(
        false,
        MessageType::Error.code(),
        &json!({"kind": format!("{:?}", err.kind()), "message": err.to_string()}),
    )
}
