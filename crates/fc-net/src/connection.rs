//! Connection Manager (§4.D): the TLS accept loop, one driving task per connection (so each
//! socket has exactly one reader for its whole lifetime), the idle sweeper, and the
//! `ConnectionHub` that lets the Message Engine push a frame to any connected socket by id or
//! by user id.

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use fc_common::{SocketId, CLEANUP_INTERVAL, HEARTBEAT_TIMEOUT};
use fc_registry::ClientRegistry;
use fc_stats::StatsRegistry;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig as TlsServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::dispatch::{EngineEvent, MessageEngine};
use crate::wire::FrameDecoder;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to read TLS certificate/key material: {0}")]
    Io(#[from] io::Error),
    #[error("TLS configuration error: {0}")]
    Tls(String),
}

/// Loads a server certificate chain and private key from PEM files and builds a
/// `TlsAcceptor`. SSL handshake failures at accept time are reported but not fatal to the
/// accept loop (§4.D): a bad client never takes the listener down with it.
pub fn load_tls_acceptor(cert_path: &Path, key_path: &Path, key_password: Option<&str>) -> Result<TlsAcceptor, ConnectionError> {
    let cert_bytes = std::fs::read(cert_path)?;
    let key_bytes = std::fs::read(key_path)?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_bytes.as_slice())
        .collect::<Result<_, _>>()
        .map_err(|e| ConnectionError::Tls(e.to_string()))?;
    let parsed_key = rustls_pemfile::private_key(&mut key_bytes.as_slice()).map_err(|e| ConnectionError::Tls(e.to_string()))?;
    let key: PrivateKeyDer<'static> = match (parsed_key, key_password) {
        (Some(key), _) => key,
        (None, Some(_)) => {
            return Err(ConnectionError::Tls(
                "key file could not be parsed as an unencrypted PEM key; password-protected key files are not supported".to_string(),
            ))
        }
        (None, None) => return Err(ConnectionError::Tls("no private key found in key file".to_string())),
    };

    let config = TlsServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ConnectionError::Tls(e.to_string()))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Outbound frame delivery to any connected socket, independent of the identity layer
/// (`ClientRegistry`/`SessionManager`) so the Message Engine can push to a connection it
/// didn't just read from.
#[derive(Default)]
pub struct ConnectionHub {
    senders: DashMap<SocketId, mpsc::Sender<Vec<u8>>>,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, socket_id: SocketId, tx: mpsc::Sender<Vec<u8>>) {
        self.senders.insert(socket_id, tx);
    }

    pub fn unregister(&self, socket_id: SocketId) {
        self.senders.remove(&socket_id);
    }

    /// Returns `false` if the socket is gone or its write buffer is closed; callers treat
    /// that as "leave the message pending" rather than an error.
    pub async fn send_to_socket(&self, socket_id: SocketId, frame: Vec<u8>) -> bool {
        let Some(tx) = self.senders.get(&socket_id).map(|e| e.value().clone()) else {
            return false;
        };
        tx.send(frame).await.is_ok()
    }

    pub fn connected_count(&self) -> usize {
        self.senders.len()
    }
}

pub struct ConnectionManagerConfig {
    pub read_idle_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for ConnectionManagerConfig {
    fn default() -> Self {
        Self { read_idle_timeout: HEARTBEAT_TIMEOUT, sweep_interval: CLEANUP_INTERVAL }
    }
}

/// Runs the accept loop until `shutdown_rx` fires. Spawns one task per accepted connection;
/// each task owns its socket for the connection's entire lifetime (§4.D: "single reader per
/// socket").
pub async fn run_accept_loop(
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    engine: Arc<MessageEngine>,
    hub: Arc<ConnectionHub>,
    registry: Arc<ClientRegistry>,
    stats: Arc<StatsRegistry>,
    config: Arc<ConnectionManagerConfig>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let next_socket_id = Arc::new(AtomicU64::new(1));
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let socket_id = next_socket_id.fetch_add(1, Ordering::Relaxed);
                let engine = engine.clone();
                let hub = hub.clone();
                let registry = registry.clone();
                let stats = stats.clone();
                let config = config.clone();
                let tls = tls.clone();
                debug!(%peer, socket_id, "accepted connection");
                tokio::spawn(async move {
                    match tls {
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(tls_stream) => {
                                drive_connection(tls_stream, socket_id, engine, hub, registry, stats, config).await;
                            }
                            Err(e) => {
                                warn!(socket_id, error = %e, "TLS handshake failed");
                            }
                        },
                        None => {
                            drive_connection(stream, socket_id, engine, hub, registry, stats, config).await;
                        }
                    }
                });
            }
            _ = shutdown_rx.recv() => {
                info!("connection manager accept loop shutting down");
                break;
            }
        }
    }
}

async fn drive_connection<S>(
    stream: S,
    socket_id: SocketId,
    engine: Arc<MessageEngine>,
    hub: Arc<ConnectionHub>,
    registry: Arc<ClientRegistry>,
    stats: Arc<StatsRegistry>,
    config: Arc<ConnectionManagerConfig>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let state = match registry.insert(socket_id) {
        Ok(state) => state,
        Err(e) => {
            warn!(socket_id, error = %e, "duplicate socket id, dropping connection");
            return;
        }
    };
    stats.record_connection_accepted();

    let (mut read_half, mut write_half) = tokio::io::split(stream);
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(256);
    hub.register(socket_id, tx);

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if write_half.write_all(&frame).await.is_err() {
                break;
            }
        }
    });

    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 8192];
    loop {
        let read_result = tokio::time::timeout(config.read_idle_timeout, read_half.read(&mut buf)).await;
        let n = match read_result {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                debug!(socket_id, error = %e, "connection read error");
                break;
            }
            Err(_) => {
                debug!(socket_id, "connection idle timeout");
                break;
            }
        };
        decoder.feed(&buf[..n]);
        loop {
            match decoder.try_decode() {
                Ok(Some(msg)) => {
                    state.write().touch();
                    stats.record_message_received();
                    if let Some(reply) = engine.dispatch(socket_id, &state, msg).await {
                        if !hub.send_to_socket(socket_id, reply).await {
                            break;
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(socket_id, error = %e, "frame decode error, closing connection");
                    return cleanup_connection(socket_id, &registry, &hub, &stats, &engine, writer_task).await;
                }
            }
        }
    }
    cleanup_connection(socket_id, &registry, &hub, &stats, &engine, writer_task).await
}

async fn cleanup_connection(
    socket_id: SocketId,
    registry: &Arc<ClientRegistry>,
    hub: &Arc<ConnectionHub>,
    stats: &Arc<StatsRegistry>,
    engine: &Arc<MessageEngine>,
    writer_task: tokio::task::JoinHandle<()>,
) {
    hub.unregister(socket_id);
    if let Some(state) = registry.remove(socket_id) {
        engine.handle_disconnect(&state).await;
    }
    stats.record_connection_closed();
    writer_task.abort();
    debug!(socket_id, "connection cleaned up");
}

/// Every `ConnectionManagerConfig::sweep_interval`, force-closes connections whose
/// `last_activity` is older than `read_idle_timeout` as a backstop behind the per-read
/// timeout (§4.D cleanup sweep).
pub async fn spawn_idle_sweeper(hub: Arc<ConnectionHub>, registry: Arc<ClientRegistry>, config: Arc<ConnectionManagerConfig>) {
    let mut ticker = tokio::time::interval(config.sweep_interval);
    loop {
        ticker.tick().await;
        let mut swept = 0;
        for state in registry.snapshot() {
            let (socket_id, idle) = {
                let guard = state.read();
                (guard.socket_id, guard.is_idle(config.read_idle_timeout))
            };
            if idle {
                hub.unregister(socket_id);
                registry.remove(socket_id);
                swept += 1;
            }
        }
        if swept > 0 {
            debug!(count = swept, "idle sweeper closed stale connections");
        }
    }
}

/// Logs presence transitions; a richer consumer (e.g. a contacts/presence fan-out) would
/// subscribe the same way, but that machinery is out of scope here (§1 non-goal).
pub fn log_presence_events(engine: &MessageEngine) {
    let mut rx = engine.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            match event {
                EngineEvent::UserOnline(user_id) => debug!(user_id, "user online"),
                EngineEvent::UserOffline(user_id) => debug!(user_id, "user offline"),
            }
        }
    });
}
