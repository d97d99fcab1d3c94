//! Shared domain types for the chat server core.
//!
//! This crate has no async runtime dependencies of its own beyond `tokio::time::Instant`-free
//! timestamps; it exists so that every other crate in the workspace can share one definition
//! of `Message`, `ClientState`, `SessionInfo`, cache metadata, and the error taxonomy.

pub mod logging;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Upper bound on a frame body, enforced at the point a frame is read (§6).
pub const MAX_FRAME_BODY_BYTES: u32 = 16 * 1024 * 1024;

/// Default idle timeout before a connection is considered dead (§4.D).
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);

/// Idle-connection sweep interval (§4.D).
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

// ---------------------------------------------------------------------------
// Wire / message types
// ---------------------------------------------------------------------------

/// A parsed frame: the 7-byte header fields plus the decoded JSON body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub heartbeat_flag: bool,
    pub message_type: u16,
    pub body: serde_json::Value,
}

/// Well-known message type codes from the registry (§6). Non-exhaustive by design —
/// unrecognized codes are routed to a generic handler that replies with `ERROR`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    LoginRequest,
    LoginResponse,
    LogoutRequest,
    RegisterRequest,
    SendMessage,
    MessageReceived,
    MessageDelivered,
    MessageRead,
    UserOnline,
    UserOffline,
    Heartbeat,
    HeartbeatResponse,
    Error,
    Unknown(u16),
}

impl MessageType {
    pub fn code(self) -> u16 {
        match self {
            MessageType::LoginRequest => 0x0001,
            MessageType::LoginResponse => 0x0002,
            MessageType::LogoutRequest => 0x0003,
            MessageType::RegisterRequest => 0x0005,
            MessageType::SendMessage => 0x0101,
            MessageType::MessageReceived => 0x0102,
            MessageType::MessageDelivered => 0x0103,
            MessageType::MessageRead => 0x0104,
            MessageType::UserOnline => 0x0201,
            MessageType::UserOffline => 0x0202,
            MessageType::Heartbeat => 0x0F01,
            MessageType::HeartbeatResponse => 0x0F02,
            MessageType::Error => 0x0FFF,
            MessageType::Unknown(code) => code,
        }
    }

    pub fn from_code(code: u16) -> Self {
        match code {
            0x0001 => MessageType::LoginRequest,
            0x0002 => MessageType::LoginResponse,
            0x0003 => MessageType::LogoutRequest,
            0x0005 => MessageType::RegisterRequest,
            0x0101 => MessageType::SendMessage,
            0x0102 => MessageType::MessageReceived,
            0x0103 => MessageType::MessageDelivered,
            0x0104 => MessageType::MessageRead,
            0x0201 => MessageType::UserOnline,
            0x0202 => MessageType::UserOffline,
            0x0F01 => MessageType::Heartbeat,
            0x0F02 => MessageType::HeartbeatResponse,
            0x0FFF => MessageType::Error,
            other => MessageType::Unknown(other),
        }
    }
}

/// Delivery state machine for a persisted chat message (§4.E, §9 open question 3).
/// `Read` is only ever entered by an explicit client acknowledgment; the engine never infers
/// it from delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Read,
}

/// A persisted chat message row (send-message handler, §4.E).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub message_id: Uuid,
    pub sender: String,
    pub receiver: String,
    pub content: String,
    pub message_type: String,
    pub timestamp: i64,
    pub status: DeliveryStatus,
}

// ---------------------------------------------------------------------------
// Client / connection state
// ---------------------------------------------------------------------------

/// Opaque handle to whatever transport carries bytes for one client connection.
/// The concrete implementation (TLS stream) lives in `fc-net`; this crate only needs an
/// identity and a way to know the handle is still writable.
pub type SocketId = u64;

/// Per-connection state (§3). `last_activity` is read by the idle sweeper and written on
/// every successful frame read or heartbeat.
#[derive(Debug, Clone)]
pub struct ClientState {
    pub socket_id: SocketId,
    pub user_id: Option<u64>,
    pub session_token: Option<String>,
    pub last_activity: Instant,
}

impl ClientState {
    pub fn new(socket_id: SocketId) -> Self {
        Self {
            socket_id,
            user_id: None,
            session_token: None,
            last_activity: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.last_activity.elapsed() > timeout
    }

    pub fn is_authenticated(&self) -> bool {
        self.user_id.is_some()
    }
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

/// A session token's bound metadata (§3). `valid` is a soft flag; the authoritative check is
/// always `expires_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub user_id: u64,
    pub device_info: String,
    pub ip_address: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub last_active: chrono::DateTime<chrono::Utc>,
    pub expires_at: chrono::DateTime<chrono::Utc>,
    pub valid: bool,
}

impl SessionInfo {
    pub fn is_expired(&self) -> bool {
        chrono::Utc::now() >= self.expires_at
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CacheLevel {
    L1,
    L2,
    L3,
}

/// Bookkeeping attached to every cached item (§3). `access_count` and `hotness` are
/// monotonically non-decreasing for the lifetime of an entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub last_accessed: chrono::DateTime<chrono::Utc>,
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
    pub access_count: u64,
    pub hotness: u64,
    pub size: u64,
    pub category: Option<String>,
    pub level: CacheLevel,
    pub priority: u8,
}

impl CacheMetadata {
    pub fn new(ttl: Option<Duration>, category: Option<String>, priority: u8, size: u64, level: CacheLevel) -> Self {
        let now = chrono::Utc::now();
        Self {
            created_at: now,
            last_accessed: now,
            expires_at: ttl.and_then(|d| chrono::Duration::from_std(d).ok()).map(|d| now + d),
            access_count: 0,
            hotness: 0,
            size,
            category,
            level,
            priority,
        }
    }

    pub fn is_expired(&self) -> bool {
        matches!(self.expires_at, Some(exp) if chrono::Utc::now() >= exp)
    }

    pub fn record_access(&mut self) {
        self.last_accessed = chrono::Utc::now();
        self.access_count += 1;
        self.hotness += 1;
    }
}

/// A value plus its cache bookkeeping (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheItem<T> {
    pub data: T,
    pub metadata: CacheMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionStrategy {
    Lru,
    Lfu,
    Random,
    Fifo,
    Ttl,
}

/// Per-level and global cache counters (§4.F).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheLevelStats {
    pub hits: u64,
    pub misses: u64,
    pub size: u64,
    pub count: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheMetricsSnapshot {
    pub l1: CacheLevelStats,
    pub l2: CacheLevelStats,
    pub l3: CacheLevelStats,
    pub total_requests: u64,
    pub average_latency_us: f64,
    pub max_latency_us: u64,
    pub evictions: u64,
    pub promotions: u64,
    pub demotions: u64,
}

impl CacheMetricsSnapshot {
    pub fn hit_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        let hits = self.l1.hits + self.l2.hits + self.l3.hits;
        hits as f64 / self.total_requests as f64
    }
}

// ---------------------------------------------------------------------------
// Preloader
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TaskPriority {
    Low,
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PreloadTaskType {
    Immediate,
    Scheduled,
    Conditional,
    Batch,
    Adaptive,
}

/// Metadata for a single preloader task; the `loader`/`condition` closures live alongside
/// this struct in `fc-cache` (they are not `Serialize`).
#[derive(Debug, Clone)]
pub struct PreloadTaskMeta {
    pub id: String,
    pub key: String,
    pub scheduled_time: Option<Instant>,
    pub task_type: PreloadTaskType,
    pub priority: TaskPriority,
    pub ttl: Option<Duration>,
    pub max_retries: u32,
    pub retry_count: u32,
}

// ---------------------------------------------------------------------------
// Access stats / strategy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AccessRecord {
    pub ts: Instant,
    pub key: String,
    pub category: Option<String>,
    pub level: CacheLevel,
    pub hit: bool,
    pub latency_us: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessPattern {
    Sequential,
    Temporal,
    Burst,
    Periodic,
    Random,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecommendedStrategy {
    Lru,
    Lfu,
    Arc,
    Clock,
}

impl From<AccessPattern> for RecommendedStrategy {
    fn from(p: AccessPattern) -> Self {
        match p {
            AccessPattern::Sequential => RecommendedStrategy::Lru,
            AccessPattern::Burst => RecommendedStrategy::Lfu,
            AccessPattern::Random => RecommendedStrategy::Arc,
            AccessPattern::Temporal => RecommendedStrategy::Lru,
            AccessPattern::Periodic => RecommendedStrategy::Clock,
        }
    }
}

// ---------------------------------------------------------------------------
// Failures / warnings / health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureType {
    DatabaseFailure,
    NetworkFailure,
    ThreadPoolFailure,
    MemoryExhaustion,
    SslHandshakeFailure,
    MessageQueueOverflow,
    ComponentCrash,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureInfo {
    pub failure_type: FailureType,
    pub component: String,
    pub description: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub severity: u8,
    pub context: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningSeverity {
    Info,
    Warn,
    Error,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningCategory {
    Routing,
    Processing,
    Configuration,
    RateLimiting,
    DependencyConnectivity,
    PoolCapacity,
    PoolHealth,
    Resource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Warning {
    pub id: String,
    pub category: WarningCategory,
    pub severity: WarningSeverity,
    pub message: String,
    pub context: HashMap<String, String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub acknowledged: bool,
}

impl Warning {
    pub fn new(category: WarningCategory, severity: WarningSeverity, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            category,
            severity,
            message: message.into(),
            context: HashMap::new(),
            created_at: chrono::Utc::now(),
            acknowledged: false,
        }
    }

    pub fn age_minutes(&self) -> i64 {
        (chrono::Utc::now() - self.created_at).num_minutes()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Degraded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStats {
    pub name: String,
    pub min: u32,
    pub max: u32,
    pub active: u32,
    pub queued: u32,
    pub failed_tasks: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackpressureLevel {
    Normal,
    Warning,
    Critical,
    Emergency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum CircuitBreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitBreakerState,
    pub consecutive_failures: u64,
    pub consecutive_successes: u64,
}

/// Aggregate view for liveness/readiness probes (§3, ambient ops endpoint of §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub pools: Vec<PoolStats>,
    pub cache: CacheMetricsSnapshot,
    pub backpressure: BackpressureLevel,
    pub circuit_breakers: Vec<CircuitBreakerStats>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Degradation levels driven by the Performance Degradation Manager (§4.I).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationLevel {
    Normal,
    Light,
    Moderate,
    Heavy,
    Emergency,
}

// ---------------------------------------------------------------------------
// Error taxonomy (§7)
// ---------------------------------------------------------------------------

/// The six error kinds of §7. Every crate-local error type should classify into exactly one
/// of these at the point it crosses into the engine so protocol-frame conversion is total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ClientProtocolError,
    AuthError,
    TransientDependencyError,
    ResourceExhaustion,
    InvariantViolation,
    Fatal,
}

#[derive(thiserror::Error, Debug)]
pub enum CoreError {
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("authentication error: {0}")]
    Auth(String),
    #[error("transient dependency error: {0}")]
    Transient(String),
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("invariant violation: {0}")]
    Invariant(String),
    #[error("fatal error: {0}")]
    Fatal(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Protocol(_) | CoreError::Serialization(_) => ErrorKind::ClientProtocolError,
            CoreError::Auth(_) => ErrorKind::AuthError,
            CoreError::Transient(_) => ErrorKind::TransientDependencyError,
            CoreError::ResourceExhausted(_) => ErrorKind::ResourceExhaustion,
            CoreError::Invariant(_) => ErrorKind::InvariantViolation,
            CoreError::Fatal(_) => ErrorKind::Fatal,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// Milliseconds since the Unix epoch, matching the wire format's `timestamp` fields (§6).
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_round_trips_through_code() {
        for mt in [
            MessageType::LoginRequest,
            MessageType::SendMessage,
            MessageType::Heartbeat,
            MessageType::Error,
        ] {
            assert_eq!(MessageType::from_code(mt.code()).code(), mt.code());
        }
    }

    #[test]
    fn unknown_message_type_preserves_code() {
        assert_eq!(MessageType::from_code(0xABCD).code(), 0xABCD);
    }

    #[test]
    fn cache_metadata_access_is_monotonic() {
        let mut meta = CacheMetadata::new(None, None, 50, 10, CacheLevel::L1);
        assert_eq!(meta.access_count, 0);
        meta.record_access();
        meta.record_access();
        assert_eq!(meta.access_count, 2);
        assert_eq!(meta.hotness, 2);
    }

    #[test]
    fn metadata_without_ttl_never_expires() {
        let meta = CacheMetadata::new(None, None, 50, 0, CacheLevel::L1);
        assert!(!meta.is_expired());
    }

    #[test]
    fn warning_age_starts_at_zero_minutes() {
        let w = Warning::new(WarningCategory::Routing, WarningSeverity::Warn, "test");
        assert_eq!(w.age_minutes(), 0);
    }

    #[test]
    fn error_kind_classification_matches_taxonomy() {
        assert_eq!(CoreError::Auth("bad".into()).kind(), ErrorKind::AuthError);
        assert_eq!(CoreError::Fatal("boom".into()).kind(), ErrorKind::Fatal);
    }
}
