//! Lock-free Client Registry (§4.B): two logical maps, `socket_id -> ClientState` and
//! `user_id -> ClientState`, backed by sharded concurrent maps so reads never block writes
//! and vice versa.
//!
//! Both maps store the same `Arc<RwLock<ClientState>>` for a connected client; binding a
//! user id (on successful login) inserts into the second map without touching the first.

use dashmap::DashMap;
use fc_common::{ClientState, SocketId};
use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;

pub type SharedClientState = Arc<RwLock<ClientState>>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("socket {0} is already registered")]
    AlreadyPresent(SocketId),
}

#[derive(Default)]
pub struct ClientRegistry {
    by_socket: DashMap<SocketId, SharedClientState>,
    by_user: DashMap<u64, SharedClientState>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a newly-accepted connection. Rejects a duplicate socket id rather than
    /// silently overwriting it.
    pub fn insert(&self, socket_id: SocketId) -> Result<SharedClientState, RegistryError> {
        if self.by_socket.contains_key(&socket_id) {
            return Err(RegistryError::AlreadyPresent(socket_id));
        }
        let state = Arc::new(RwLock::new(ClientState::new(socket_id)));
        self.by_socket.insert(socket_id, state.clone());
        Ok(state)
    }

    /// Binds a user id to an already-registered connection (post-login, §4.E) and indexes it
    /// under the user map so cross-delivery can look clients up by user id.
    pub fn bind_user(&self, socket_id: SocketId, user_id: u64) {
        if let Some(entry) = self.by_socket.get(&socket_id) {
            let state = entry.value().clone();
            state.write().user_id = Some(user_id);
            self.by_user.insert(user_id, state);
        }
    }

    /// Removes a connection from both maps. Idempotent: removing an absent socket is a no-op.
    pub fn remove(&self, socket_id: SocketId) -> Option<SharedClientState> {
        let removed = self.by_socket.remove(&socket_id).map(|(_, v)| v);
        if let Some(state) = &removed {
            let user_id = state.read().user_id;
            if let Some(user_id) = user_id {
                // only drop the user-index entry if it still points at this same connection;
                // a reconnect may already have replaced it.
                if let Some(entry) = self.by_user.get(&user_id) {
                    if Arc::ptr_eq(entry.value(), state) {
                        drop(entry);
                        self.by_user.remove(&user_id);
                    }
                }
            }
        }
        removed
    }

    pub fn get(&self, socket_id: SocketId) -> Option<SharedClientState> {
        self.by_socket.get(&socket_id).map(|e| e.value().clone())
    }

    pub fn get_by_user(&self, user_id: u64) -> Option<SharedClientState> {
        self.by_user.get(&user_id).map(|e| e.value().clone())
    }

    pub fn is_online(&self, user_id: u64) -> bool {
        self.by_user.contains_key(&user_id)
    }

    /// A consistent snapshot of all connections present when iteration started; entries
    /// removed mid-snapshot are simply absent from the returned vector, never duplicated.
    pub fn snapshot(&self) -> Vec<SharedClientState> {
        self.by_socket.iter().map(|e| e.value().clone()).collect()
    }

    pub fn for_each(&self, mut f: impl FnMut(&SharedClientState)) {
        for entry in self.by_socket.iter() {
            f(entry.value());
        }
    }

    pub fn len(&self) -> usize {
        self.by_socket.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_socket.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_insert_is_rejected() {
        let registry = ClientRegistry::new();
        registry.insert(1).unwrap();
        assert_eq!(registry.insert(1), Err(RegistryError::AlreadyPresent(1)));
    }

    #[test]
    fn bind_user_indexes_under_both_maps() {
        let registry = ClientRegistry::new();
        registry.insert(1).unwrap();
        registry.bind_user(1, 42);
        assert!(registry.get_by_user(42).is_some());
        assert!(registry.is_online(42));
    }

    #[test]
    fn remove_clears_both_indexes() {
        let registry = ClientRegistry::new();
        registry.insert(1).unwrap();
        registry.bind_user(1, 42);
        registry.remove(1);
        assert!(registry.get(1).is_none());
        assert!(registry.get_by_user(42).is_none());
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = ClientRegistry::new();
        registry.insert(1).unwrap();
        assert!(registry.remove(1).is_some());
        assert!(registry.remove(1).is_none());
    }

    #[test]
    fn snapshot_reflects_current_membership() {
        let registry = ClientRegistry::new();
        registry.insert(1).unwrap();
        registry.insert(2).unwrap();
        assert_eq!(registry.snapshot().len(), 2);
        registry.remove(1);
        assert_eq!(registry.snapshot().len(), 1);
    }
}
