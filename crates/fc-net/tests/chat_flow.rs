//! End-to-end coverage of the dispatch table against a real in-memory SQLite repository and
//! the actual registry/session/backpressure/ordering components wired together the way
//! `ChatServer::start` wires them, minus the TCP accept loop itself.

use std::sync::Arc;
use std::time::Duration;

use fc_backpressure::{BackpressureConfig, BackpressureController};
use fc_net::{ConnectionHub, SqliteChatRepository};
use fc_net::dispatch::{EngineConfig, MessageEngine};
use fc_net::ordering::DeliveryOrderer;
use fc_net::wire::FrameDecoder;
use fc_registry::ClientRegistry;
use fc_robustness::{CircuitBreakerConfig, CircuitBreakerRegistry, FailureRecoveryRegistry};
use fc_session::SessionManager;
use fc_stats::StatsRegistry;
use serde_json::{json, Value};
use tokio::sync::mpsc;

struct Harness {
    engine: Arc<MessageEngine>,
    registry: Arc<ClientRegistry>,
    hub: Arc<ConnectionHub>,
    repo: Arc<SqliteChatRepository>,
}

async fn build_harness(max_queue_size: u64) -> Harness {
    let repo = Arc::new(SqliteChatRepository::connect("sqlite::memory:").await.unwrap());
    let registry = Arc::new(ClientRegistry::new());
    let sessions = Arc::new(SessionManager::with_default_ttl(Duration::from_secs(3600)));
    let backpressure = Arc::new(BackpressureController::new(BackpressureConfig { max_queue_size }));
    let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default()));
    let recovery = Arc::new(FailureRecoveryRegistry::new());
    let stats = Arc::new(StatsRegistry::new());
    let orderer = Arc::new(DeliveryOrderer::new(Duration::from_secs(300)));
    let hub = Arc::new(ConnectionHub::new());
    let engine = Arc::new(MessageEngine::new(
        registry.clone(),
        sessions,
        repo.clone(),
        backpressure,
        breakers,
        recovery,
        stats,
        orderer,
        hub.clone(),
        EngineConfig { login_signing_key: b"test-signing-key".to_vec(), group_key_salt: "test-salt".to_string() },
    ));
    Harness { engine, registry, hub, repo }
}

/// Registers a socket in the registry and wires its outbound channel into the hub, returning
/// the shared client state plus the receiving half so the test can read what the engine wrote
/// back to this connection's own socket.
fn connect(h: &Harness, socket_id: u64) -> (fc_registry::SharedClientState, mpsc::Receiver<Vec<u8>>) {
    let state = h.registry.insert(socket_id).unwrap();
    let (tx, rx) = mpsc::channel(16);
    h.hub.register(socket_id, tx);
    (state, rx)
}

fn decode_one(bytes: &[u8]) -> (u16, Value) {
    let mut decoder = FrameDecoder::new();
    decoder.feed(bytes);
    let msg = decoder.try_decode().unwrap().unwrap();
    (msg.message_type, msg.body)
}

async fn login(h: &Harness, socket_id: u64, state: &fc_registry::SharedClientState, username: &str, password_hash: &str) -> Value {
    let body = json!({"username_or_email": username, "password": password_hash});
    let reply = h
        .engine
        .dispatch(socket_id, state, fc_common::Message { heartbeat_flag: false, message_type: fc_common::MessageType::LoginRequest.code(), body })
        .await
        .expect("login produces a reply frame");
    let (message_type, body) = decode_one(&reply);
    assert_eq!(message_type, fc_common::MessageType::LoginResponse.code());
    body
}

#[tokio::test]
async fn happy_path_login_returns_token_and_user_id() {
    let h = build_harness(10_000).await;
    h.repo.register_user("alice", "hash-alice").await.unwrap();
    let (state, _rx) = connect(&h, 1);

    let body = login(&h, 1, &state, "alice", "hash-alice").await;
    let token = body["token"].as_str().expect("login response carries a token");
    assert_eq!(token.len(), 32);
    assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    assert_eq!(body["user_id"].as_u64(), Some(1));
    assert_eq!(state.read().user_id, Some(1));
}

#[tokio::test]
async fn login_with_wrong_password_records_auth_failure_and_replies_with_error() {
    let h = build_harness(10_000).await;
    h.repo.register_user("alice", "hash-alice").await.unwrap();
    let (state, _rx) = connect(&h, 1);

    let body = json!({"username_or_email": "alice", "password": "wrong-hash"});
    let reply = h
        .engine
        .dispatch(1, &state, fc_common::Message { heartbeat_flag: false, message_type: fc_common::MessageType::LoginRequest.code(), body })
        .await
        .unwrap();
    let (message_type, _) = decode_one(&reply);
    assert_eq!(message_type, fc_common::MessageType::Error.code());
    assert!(state.read().user_id.is_none());
}

#[tokio::test]
async fn message_cross_delivery_reaches_online_receiver() {
    let h = build_harness(10_000).await;
    h.repo.register_user("alice", "hash-alice").await.unwrap();
    h.repo.register_user("bob", "hash-bob").await.unwrap();

    let (alice_state, _alice_rx) = connect(&h, 1);
    let (bob_state, mut bob_rx) = connect(&h, 2);
    login(&h, 1, &alice_state, "alice", "hash-alice").await;
    login(&h, 2, &bob_state, "bob", "hash-bob").await;

    let message_id = uuid::Uuid::new_v4().to_string();
    let send_body = json!({
        "message_id": message_id,
        "receiver": "bob",
        "content": "hi",
        "message_type": "text",
    });
    let reply = h
        .engine
        .dispatch(1, &alice_state, fc_common::Message { heartbeat_flag: false, message_type: fc_common::MessageType::SendMessage.code(), body: send_body })
        .await
        .unwrap();
    let (ack_type, ack_body) = decode_one(&reply);
    assert_eq!(ack_type, fc_common::MessageType::SendMessage.code());
    assert_eq!(ack_body["status"], "accepted");

    let delivered = tokio::time::timeout(Duration::from_secs(1), bob_rx.recv()).await.expect("bob receives within timeout").expect("bob's channel stays open");
    let (delivered_type, delivered_body) = decode_one(&delivered);
    assert_eq!(delivered_type, fc_common::MessageType::MessageReceived.code());
    assert_eq!(delivered_body["sender"], "alice");
    assert_eq!(delivered_body["content"], "hi");

    // give the ordered worker a moment to persist the delivered status after the hub write
    tokio::time::sleep(Duration::from_millis(50)).await;
    let pending = h.repo.pending_for_user("bob", 10).await.unwrap();
    assert!(pending.is_empty(), "delivered message must not still be pending");
}

#[tokio::test]
async fn duplicate_message_id_is_delivered_only_once() {
    let h = build_harness(10_000).await;
    h.repo.register_user("alice", "hash-alice").await.unwrap();
    h.repo.register_user("bob", "hash-bob").await.unwrap();

    let (alice_state, _alice_rx) = connect(&h, 1);
    let (bob_state, mut bob_rx) = connect(&h, 2);
    login(&h, 1, &alice_state, "alice", "hash-alice").await;
    login(&h, 2, &bob_state, "bob", "hash-bob").await;

    let message_id = uuid::Uuid::new_v4().to_string();
    let send_body = json!({
        "message_id": message_id,
        "receiver": "bob",
        "content": "hi",
        "message_type": "text",
    });

    for _ in 0..2 {
        h.engine
            .dispatch(1, &alice_state, fc_common::Message {
                heartbeat_flag: false,
                message_type: fc_common::MessageType::SendMessage.code(),
                body: send_body.clone(),
            })
            .await
            .unwrap();
    }

    let first = tokio::time::timeout(Duration::from_secs(1), bob_rx.recv()).await.expect("bob receives within timeout").expect("bob's channel stays open");
    let (first_type, _) = decode_one(&first);
    assert_eq!(first_type, fc_common::MessageType::MessageReceived.code());

    let second = tokio::time::timeout(Duration::from_millis(200), bob_rx.recv()).await;
    assert!(second.is_err(), "a duplicate message_id must not be forwarded a second time");
}

#[tokio::test]
async fn send_message_requires_authentication() {
    let h = build_harness(10_000).await;
    let (state, _rx) = connect(&h, 1);

    let send_body = json!({"message_id": uuid::Uuid::new_v4().to_string(), "receiver": "bob", "content": "hi"});
    let reply = h
        .engine
        .dispatch(1, &state, fc_common::Message { heartbeat_flag: false, message_type: fc_common::MessageType::SendMessage.code(), body: send_body })
        .await
        .unwrap();
    let (message_type, _) = decode_one(&reply);
    assert_eq!(message_type, fc_common::MessageType::Error.code());
}

#[tokio::test]
async fn backpressure_shedding_rejects_sends_but_heartbeats_still_pass() {
    let h = build_harness(0).await;
    h.repo.register_user("alice", "hash-alice").await.unwrap();
    let (state, _rx) = connect(&h, 1);
    login(&h, 1, &state, "alice", "hash-alice").await;

    let send_body = json!({"message_id": uuid::Uuid::new_v4().to_string(), "receiver": "alice", "content": "hi"});
    let reply = h
        .engine
        .dispatch(1, &state, fc_common::Message { heartbeat_flag: false, message_type: fc_common::MessageType::SendMessage.code(), body: send_body })
        .await
        .unwrap();
    let (message_type, _) = decode_one(&reply);
    assert_eq!(message_type, fc_common::MessageType::Error.code());

    let heartbeat = h
        .engine
        .dispatch(1, &state, fc_common::Message { heartbeat_flag: true, message_type: 0, body: json!({}) })
        .await
        .unwrap();
    let (heartbeat_type, _) = decode_one(&heartbeat);
    assert_eq!(heartbeat_type, fc_common::MessageType::HeartbeatResponse.code());
}

#[tokio::test]
async fn logout_clears_session_and_disconnect_is_idempotent() {
    let h = build_harness(10_000).await;
    h.repo.register_user("alice", "hash-alice").await.unwrap();
    let (state, _rx) = connect(&h, 1);
    login(&h, 1, &state, "alice", "hash-alice").await;
    assert!(h.registry.is_online(1));

    let reply = h
        .engine
        .dispatch(1, &state, fc_common::Message { heartbeat_flag: false, message_type: fc_common::MessageType::LogoutRequest.code(), body: json!({}) })
        .await
        .unwrap();
    let (message_type, _) = decode_one(&reply);
    assert_eq!(message_type, fc_common::MessageType::LogoutRequest.code());
    assert!(state.read().user_id.is_none());

    // a second disconnect for the same (now-logged-out) state must not panic or double-fire
    h.engine.handle_disconnect(&state).await;
}
