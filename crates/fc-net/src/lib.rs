//! Connection Manager, Message Engine, wire codec, and server Lifecycle: the networking and
//! orchestration layer that wires the concurrency/caching core crates into a running server.

pub mod connection;
pub mod crypto;
pub mod db;
pub mod dispatch;
pub mod lifecycle;
pub mod ordering;
pub mod wire;

pub use connection::{ConnectionError, ConnectionHub, ConnectionManagerConfig};
pub use db::{ChatRepository, DbError, SqliteChatRepository, UserRecord};
pub use dispatch::{EngineConfig, EngineError, EngineEvent, MessageEngine};
pub use lifecycle::{ChatServer, LifecycleError};
pub use ordering::DeliveryOrderer;
pub use wire::{FrameDecoder, FrameError};
