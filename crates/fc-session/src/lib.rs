//! Session Manager (§4.C): token issuance, validation, expiry, and a periodic sweeper.
//!
//! Two indexes — `token -> SessionInfo` and `user_id -> set<token>` — are kept behind one
//! mutex for insert/remove so they can never diverge (the invariant from §3); `validate`
//! takes the read-mostly fast path through the concurrent forward map and only touches the
//! mutex when a session turns out to be expired and needs eager removal.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::{DashMap, DashSet};
use fc_common::SessionInfo;
use parking_lot::Mutex;
use rand::RngCore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

const TOKEN_BYTES: usize = 16; // -> 32 hex chars
const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Emitted by the background sweeper and by eager expiry during `validate`.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    SessionExpired(String),
}

pub struct SessionManager {
    forward: DashMap<String, SessionInfo>,
    reverse: DashMap<u64, DashSet<String>>,
    index_lock: Mutex<()>,
    events: broadcast::Sender<SessionEvent>,
    default_ttl: ChronoDuration,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::with_default_ttl(Duration::from_secs(24 * 60 * 60))
    }

    pub fn with_default_ttl(default_ttl: Duration) -> Self {
        let (tx, _rx) = broadcast::channel(256);
        Self {
            forward: DashMap::new(),
            reverse: DashMap::new(),
            index_lock: Mutex::new(()),
            events: tx,
            default_ttl: ChronoDuration::from_std(default_ttl).unwrap_or(ChronoDuration::hours(24)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// `create(userId, device, ip, ttl=24h) -> token` (§4.C). Token is a 32-hex-char string
    /// drawn from a cryptographic RNG.
    pub fn create(&self, user_id: u64, device_info: String, ip_address: String, ttl: Option<Duration>) -> String {
        let token = generate_token();
        let now = Utc::now();
        let ttl = ttl
            .map(|d| ChronoDuration::from_std(d).unwrap_or(self.default_ttl))
            .unwrap_or(self.default_ttl);
        let info = SessionInfo {
            user_id,
            device_info,
            ip_address,
            created_at: now,
            last_active: now,
            expires_at: now + ttl,
            valid: true,
        };

        let _guard = self.index_lock.lock();
        self.forward.insert(token.clone(), info);
        self.reverse.entry(user_id).or_default().insert(token.clone());
        token
    }

    /// `validate(token) -> Option<userId>`. Eagerly deletes and returns `None` if expired;
    /// otherwise refreshes `lastActive`.
    pub fn validate(&self, token: &str) -> Option<u64> {
        let expired = {
            let entry = self.forward.get(token)?;
            entry.is_expired()
        };
        if expired {
            self.remove(token);
            let _ = self.events.send(SessionEvent::SessionExpired(token.to_string()));
            return None;
        }
        let mut entry = self.forward.get_mut(token)?;
        entry.last_active = Utc::now();
        Some(entry.user_id)
    }

    pub fn remove(&self, token: &str) {
        let _guard = self.index_lock.lock();
        if let Some((_, info)) = self.forward.remove(token) {
            if let Some(set) = self.reverse.get(&info.user_id) {
                set.remove(token);
            }
        }
    }

    pub fn remove_user_sessions(&self, user_id: u64) {
        let _guard = self.index_lock.lock();
        if let Some((_, tokens)) = self.reverse.remove(&user_id) {
            for token in tokens.iter() {
                self.forward.remove(token.key());
            }
        }
    }

    pub fn user_token_count(&self, user_id: u64) -> usize {
        self.reverse.get(&user_id).map(|s| s.len()).unwrap_or(0)
    }

    /// Runs the §4.C background sweeper: every 5 minutes, deletes all tokens whose
    /// `expiresAt < now` and emits `SessionExpired` for each.
    pub fn spawn_sweeper(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tick.tick().await;
                this.sweep();
            }
        });
    }

    fn sweep(&self) {
        let now: DateTime<Utc> = Utc::now();
        let expired: Vec<String> = self
            .forward
            .iter()
            .filter(|e| e.value().expires_at < now)
            .map(|e| e.key().clone())
            .collect();
        if expired.is_empty() {
            return;
        }
        info!(count = expired.len(), "sweeping expired sessions");
        for token in expired {
            self.remove(&token);
            let _ = self.events.send(SessionEvent::SessionExpired(token));
        }
        debug!("session sweep complete");
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_validate_round_trips() {
        let mgr = SessionManager::new();
        let token = mgr.create(7, "device".into(), "127.0.0.1".into(), None);
        assert_eq!(token.len(), 32);
        assert_eq!(mgr.validate(&token), Some(7));
    }

    #[test]
    fn expired_session_is_removed_eagerly() {
        let mgr = SessionManager::new();
        let token = mgr.create(7, "device".into(), "127.0.0.1".into(), Some(Duration::from_millis(0)));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(mgr.validate(&token), None);
        assert_eq!(mgr.user_token_count(7), 0);
    }

    #[test]
    fn remove_clears_reverse_index() {
        let mgr = SessionManager::new();
        let token = mgr.create(7, "device".into(), "127.0.0.1".into(), None);
        mgr.remove(&token);
        assert_eq!(mgr.validate(&token), None);
        assert_eq!(mgr.user_token_count(7), 0);
    }

    #[test]
    fn remove_user_sessions_drops_all_tokens() {
        let mgr = SessionManager::new();
        let a = mgr.create(7, "d1".into(), "ip".into(), None);
        let b = mgr.create(7, "d2".into(), "ip".into(), None);
        mgr.remove_user_sessions(7);
        assert_eq!(mgr.validate(&a), None);
        assert_eq!(mgr.validate(&b), None);
    }

    #[tokio::test]
    async fn session_at_exact_expiry_is_treated_as_expired() {
        let mgr = SessionManager::new();
        let token = mgr.create(1, "d".into(), "ip".into(), Some(Duration::from_millis(1)));
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(mgr.validate(&token), None);
    }
}
