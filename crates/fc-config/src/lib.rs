//! Layered configuration for the chat server core.
//!
//! Defaults are compiled in; an optional TOML file overrides them; environment variables
//! override the file. Section names and keys follow the flat naming convention of the
//! external configuration surface (`Server.*`, `Security.*`, `Database.*`, `Cache.*`,
//! `Logging.*`).

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    ValidationError(String),
}

/// Root application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub security: SecurityConfig,
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub logging: LoggingConfig,
    pub secrets: SecretsConfig,
    pub data_dir: String,
    pub dev_mode: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            security: SecurityConfig::default(),
            database: DatabaseConfig::default(),
            cache: CacheConfig::default(),
            logging: LoggingConfig::default(),
            secrets: SecretsConfig::default(),
            data_dir: "./data".to_string(),
            dev_mode: false,
        }
    }
}

/// `Server.*` (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
    pub thread_pool_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9443,
            max_connections: 10_000,
            thread_pool_size: 8,
        }
    }
}

/// `Security.*` (§6). TLS is mandatory for the accept loop (§4.D); `ssl_enabled` exists to
/// let development profiles run in plaintext, never production.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub ssl_enabled: bool,
    pub cert_file: String,
    pub key_file: String,
    pub key_password: String,
    pub admin_username: String,
    pub admin_password_hash: String,
    pub session_timeout_secs: u64,
    pub max_login_attempts: u32,
    pub lockout_duration_secs: u64,
    /// Salt mixed into the per-user delivery-ordering group key (`sha256(user_id || salt)`,
    /// §9 open question 1). Stable across restarts as long as this value doesn't change.
    pub group_key_salt: String,
    /// HMAC-SHA256 key used by `verifySignature` for the login payload (§9 open question 2).
    pub login_signing_key: String,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            ssl_enabled: true,
            cert_file: "./certs/server.crt".to_string(),
            key_file: "./certs/server.key".to_string(),
            key_password: String::new(),
            admin_username: String::new(),
            admin_password_hash: String::new(),
            session_timeout_secs: 24 * 60 * 60,
            max_login_attempts: 5,
            lockout_duration_secs: 15 * 60,
            group_key_salt: String::new(),
            login_signing_key: String::new(),
        }
    }
}

/// `Database.*` (§6). Schema is external (§1 non-goal); this only configures the connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    #[serde(rename = "type")]
    pub db_type: String,
    pub host: String,
    pub port: u16,
    pub name: String,
    pub username: String,
    pub password: String,
    pub pool_size: u32,
    pub max_wait_time_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            db_type: "sqlite".to_string(),
            host: "localhost".to_string(),
            port: 5432,
            name: "./data/chat.db".to_string(),
            username: String::new(),
            password: String::new(),
            pool_size: 10,
            max_wait_time_secs: 5,
        }
    }
}

/// `Cache.*` (§6): global settings plus the three nested level configs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub default_ttl_secs: u64,
    pub cleanup_interval_secs: u64,
    pub promotion_threshold: u64,
    pub demotion_threshold_secs: u64,
    pub l1: L1CacheConfig,
    pub l2: L2CacheConfig,
    pub l3: L3CacheConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 3600,
            cleanup_interval_secs: 300,
            promotion_threshold: 10,
            demotion_threshold_secs: 100,
            l1: L1CacheConfig::default(),
            l2: L2CacheConfig::default(),
            l3: L3CacheConfig::default(),
        }
    }
}

/// `Cache.L1.*`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct L1CacheConfig {
    pub max_items: usize,
    pub max_size_bytes: u64,
    pub strategy: String,
}

impl Default for L1CacheConfig {
    fn default() -> Self {
        Self {
            max_items: 100_000,
            max_size_bytes: 256 * 1024 * 1024,
            strategy: "lru".to_string(),
        }
    }
}

/// `Cache.L2.*`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct L2CacheConfig {
    pub max_items: usize,
    pub max_size_bytes: u64,
    pub strategy: String,
    pub storage_path: String,
}

impl Default for L2CacheConfig {
    fn default() -> Self {
        Self {
            max_items: 1_000_000,
            max_size_bytes: 4 * 1024 * 1024 * 1024,
            strategy: "lru".to_string(),
            storage_path: "./data/cache/l2".to_string(),
        }
    }
}

/// `Cache.L3.*`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct L3CacheConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub password: String,
    pub database: u8,
    pub max_connections: u32,
}

impl Default for L3CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "localhost".to_string(),
            port: 6379,
            password: String::new(),
            database: 0,
            max_connections: 16,
        }
    }
}

/// `Logging.*`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub file: String,
    pub max_file_size_mb: u64,
    pub max_files: u32,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            file: String::new(),
            max_file_size_mb: 100,
            max_files: 10,
        }
    }
}

/// Secret backend selection, same shape as the teacher's multi-backend secrets service
/// (§1 ambient stack) — used to resolve `Security.key_password` and `Database.password` when
/// they are references (`vault://...`, `aws-sm://...`) rather than literal values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretsConfig {
    pub provider: String,
    pub encryption_key: String,
    pub aws_region: String,
    pub vault_addr: String,
    pub vault_path: String,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            provider: "env".to_string(),
            encryption_key: String::new(),
            aws_region: String::new(),
            vault_addr: String::new(),
            vault_path: "secret/data/chat-server".to_string(),
        }
    }
}

impl AppConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn load() -> Result<Self, ConfigError> {
        ConfigLoader::new().load()
    }

    pub fn example_toml() -> String {
        r#"# Chat server configuration.
# Environment variables override these settings.

[server]
host = "0.0.0.0"
port = 9443
max_connections = 10000
thread_pool_size = 8

[security]
ssl_enabled = true
cert_file = "./certs/server.crt"
key_file = "./certs/server.key"
session_timeout_secs = 86400
max_login_attempts = 5
lockout_duration_secs = 900

[database]
type = "sqlite"
name = "./data/chat.db"
pool_size = 10
max_wait_time_secs = 5

[cache]
default_ttl_secs = 3600
cleanup_interval_secs = 300
promotion_threshold = 10
demotion_threshold_secs = 100

[cache.l1]
max_items = 100000
max_size_bytes = 268435456
strategy = "lru"

[cache.l2]
max_items = 1000000
max_size_bytes = 4294967296
strategy = "lru"
storage_path = "./data/cache/l2"

[cache.l3]
enabled = false
host = "localhost"
port = 6379
database = 0
max_connections = 16

[logging]
level = "info"
format = "text"
max_file_size_mb = 100
max_files = 10

[secrets]
provider = "env"

data_dir = "./data"
dev_mode = false
"#
        .to_string()
    }
}
