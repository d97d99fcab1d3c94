//! Persistence (§6: "Persisted state layout"). `ChatRepository` is the named
//! prepared-statement surface the Message Engine calls through; `SqliteChatRepository` is the
//! one reference implementation, over an embeddable SQL engine suitable for tests and
//! single-node deployments. Every borrow from the pool is expected to complete within the
//! Database pool's configured `max_wait_time` — callers apply that timeout, not this module.
//!
//! Grounded on fc-outbox's `repository.rs`/`sqlite.rs` split: a trait matching the domain's
//! named operations, with a `sqlx::SqlitePool`-backed implementation that parses rows by
//! column name.

use async_trait::async_trait;
use chrono::Utc;
use fc_common::{ChatMessage, DeliveryStatus};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sql(#[from] sqlx::Error),
    #[error("message {0} already exists")]
    DuplicateMessage(Uuid),
    #[error("no such user: {0}")]
    UnknownUser(String),
    #[error("username {0} is already taken")]
    DuplicateUsername(String),
}

#[derive(Debug, Clone)]
pub struct UserRecord {
    pub user_id: u64,
    pub username: String,
    pub password_hash: String,
}

/// Named operations the Message Engine needs from durable storage. Each method is one
/// prepared statement; none leak SQL to callers.
#[async_trait]
pub trait ChatRepository: Send + Sync {
    async fn find_user_by_username(&self, username: &str) -> Result<Option<UserRecord>, DbError>;
    async fn register_user(&self, username: &str, password_hash: &str) -> Result<u64, DbError>;

    /// Inserts a new message. A caller-supplied `message_id` that already exists is rejected
    /// via the primary-key constraint rather than silently overwritten, making resubmission
    /// after a dropped acknowledgment idempotent (§4.E).
    async fn insert_message(&self, message: &ChatMessage) -> Result<(), DbError>;
    async fn mark_status(&self, message_id: Uuid, status: DeliveryStatus) -> Result<(), DbError>;
    async fn pending_for_user(&self, receiver: &str, limit: u32) -> Result<Vec<ChatMessage>, DbError>;
}

pub struct SqliteChatRepository {
    pool: SqlitePool,
}

impl SqliteChatRepository {
    pub async fn connect(url: &str) -> Result<Self, DbError> {
        let pool = SqlitePool::connect(url).await?;
        let repo = Self { pool };
        repo.migrate().await?;
        Ok(repo)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn migrate(&self) -> Result<(), DbError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS users (
                user_id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS messages (
                message_id TEXT PRIMARY KEY,
                sender TEXT NOT NULL,
                receiver TEXT NOT NULL,
                content TEXT NOT NULL,
                message_type TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                status TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS messages_receiver_idx ON messages(receiver, status)")
            .execute(&self.pool)
            .await?;
        debug!("chat repository schema ready");
        Ok(())
    }

    fn parse_message(row: &SqliteRow) -> Result<ChatMessage, DbError> {
        let message_id: String = row.try_get("message_id")?;
        let status: String = row.try_get("status")?;
        Ok(ChatMessage {
            message_id: Uuid::parse_str(&message_id).unwrap_or_default(),
            sender: row.try_get("sender")?,
            receiver: row.try_get("receiver")?,
            content: row.try_get("content")?,
            message_type: row.try_get("message_type")?,
            timestamp: row.try_get("timestamp")?,
            status: status_from_str(&status),
        })
    }
}

fn status_as_str(status: DeliveryStatus) -> &'static str {
    match status {
        DeliveryStatus::Pending => "pending",
        DeliveryStatus::Delivered => "delivered",
        DeliveryStatus::Read => "read",
    }
}

fn status_from_str(s: &str) -> DeliveryStatus {
    match s {
        "delivered" => DeliveryStatus::Delivered,
        "read" => DeliveryStatus::Read,
        _ => DeliveryStatus::Pending,
    }
}

#[async_trait]
impl ChatRepository for SqliteChatRepository {
    async fn find_user_by_username(&self, username: &str) -> Result<Option<UserRecord>, DbError> {
        let row = sqlx::query("SELECT user_id, username, password_hash FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(row) => Some(UserRecord {
                user_id: row.try_get::<i64, _>("user_id")? as u64,
                username: row.try_get("username")?,
                password_hash: row.try_get("password_hash")?,
            }),
            None => None,
        })
    }

    async fn register_user(&self, username: &str, password_hash: &str) -> Result<u64, DbError> {
        let result = sqlx::query("INSERT INTO users (username, password_hash) VALUES (?, ?)")
            .bind(username)
            .bind(password_hash)
            .execute(&self.pool)
            .await;
        match result {
            Ok(r) => Ok(r.last_insert_rowid() as u64),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(DbError::DuplicateUsername(username.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn insert_message(&self, message: &ChatMessage) -> Result<(), DbError> {
        let result = sqlx::query(
            "INSERT INTO messages (message_id, sender, receiver, content, message_type, timestamp, status)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(message.message_id.to_string())
        .bind(&message.sender)
        .bind(&message.receiver)
        .bind(&message.content)
        .bind(&message.message_type)
        .bind(message.timestamp)
        .bind(status_as_str(message.status))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(DbError::DuplicateMessage(message.message_id)),
            Err(e) => Err(e.into()),
        }
    }

    async fn mark_status(&self, message_id: Uuid, status: DeliveryStatus) -> Result<(), DbError> {
        sqlx::query("UPDATE messages SET status = ? WHERE message_id = ?")
            .bind(status_as_str(status))
            .bind(message_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn pending_for_user(&self, receiver: &str, limit: u32) -> Result<Vec<ChatMessage>, DbError> {
        let rows = sqlx::query(
            "SELECT message_id, sender, receiver, content, message_type, timestamp, status
             FROM messages WHERE receiver = ? AND status = 'pending' ORDER BY timestamp ASC LIMIT ?",
        )
        .bind(receiver)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::parse_message).collect()
    }
}

pub fn now_timestamp_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_repo() -> SqliteChatRepository {
        SqliteChatRepository::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn register_then_find_user_round_trips() {
        let repo = test_repo().await;
        let id = repo.register_user("alice", "hash").await.unwrap();
        let found = repo.find_user_by_username("alice").await.unwrap().unwrap();
        assert_eq!(found.user_id, id);
    }

    #[tokio::test]
    async fn duplicate_message_id_is_rejected() {
        let repo = test_repo().await;
        let msg = ChatMessage {
            message_id: Uuid::new_v4(),
            sender: "a".into(),
            receiver: "b".into(),
            content: "hi".into(),
            message_type: "text".into(),
            timestamp: now_timestamp_millis(),
            status: DeliveryStatus::Pending,
        };
        repo.insert_message(&msg).await.unwrap();
        let err = repo.insert_message(&msg).await.unwrap_err();
        assert!(matches!(err, DbError::DuplicateMessage(_)));
    }

    #[tokio::test]
    async fn duplicate_username_is_rejected() {
        let repo = test_repo().await;
        repo.register_user("bob", "hash").await.unwrap();
        let err = repo.register_user("bob", "other-hash").await.unwrap_err();
        assert!(matches!(err, DbError::DuplicateUsername(_)));
    }

    #[tokio::test]
    async fn pending_for_user_excludes_delivered() {
        let repo = test_repo().await;
        let msg = ChatMessage {
            message_id: Uuid::new_v4(),
            sender: "a".into(),
            receiver: "b".into(),
            content: "hi".into(),
            message_type: "text".into(),
            timestamp: now_timestamp_millis(),
            status: DeliveryStatus::Pending,
        };
        repo.insert_message(&msg).await.unwrap();
        assert_eq!(repo.pending_for_user("b", 10).await.unwrap().len(), 1);
        repo.mark_status(msg.message_id, DeliveryStatus::Delivered).await.unwrap();
        assert_eq!(repo.pending_for_user("b", 10).await.unwrap().len(), 0);
    }
}
