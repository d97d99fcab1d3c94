//! Configuration loader with file and environment variable support.

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::info;

const CONFIG_PATHS: &[&str] = &[
    "config.toml",
    "server.toml",
    "chat-server.toml",
    "./config/config.toml",
    "/etc/chat-server/config.toml",
];

pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        self.apply_env_overrides(&mut config);
        Ok(config)
    }

    /// The config file this loader would read from (or has already read from), for callers
    /// that want to watch it for changes after the initial `load`.
    pub fn resolved_path(&self) -> Option<PathBuf> {
        self.find_config_file()
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = env::var("CHAT_SERVER_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        for path in CONFIG_PATHS {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    fn apply_env_overrides(&self, config: &mut AppConfig) {
        if let Ok(val) = env::var("SERVER_HOST") {
            config.server.host = val;
        }
        if let Ok(val) = env::var("SERVER_PORT") {
            if let Ok(port) = val.parse() {
                config.server.port = port;
            }
        }
        if let Ok(val) = env::var("SERVER_MAX_CONNECTIONS") {
            if let Ok(n) = val.parse() {
                config.server.max_connections = n;
            }
        }
        if let Ok(val) = env::var("SERVER_THREAD_POOL_SIZE") {
            if let Ok(n) = val.parse() {
                config.server.thread_pool_size = n;
            }
        }

        if let Ok(val) = env::var("SECURITY_SSL_ENABLED") {
            config.security.ssl_enabled = val.parse().unwrap_or(true);
        }
        if let Ok(val) = env::var("SECURITY_CERT_FILE") {
            config.security.cert_file = val;
        }
        if let Ok(val) = env::var("SECURITY_KEY_FILE") {
            config.security.key_file = val;
        }
        if let Ok(val) = env::var("SECURITY_KEY_PASSWORD") {
            config.security.key_password = val;
        }
        if let Ok(val) = env::var("SECURITY_SESSION_TIMEOUT") {
            if let Ok(n) = val.parse() {
                config.security.session_timeout_secs = n;
            }
        }
        if let Ok(val) = env::var("SECURITY_MAX_LOGIN_ATTEMPTS") {
            if let Ok(n) = val.parse() {
                config.security.max_login_attempts = n;
            }
        }

        if let Ok(val) = env::var("DATABASE_TYPE") {
            config.database.db_type = val;
        }
        if let Ok(val) = env::var("DATABASE_HOST") {
            config.database.host = val;
        }
        if let Ok(val) = env::var("DATABASE_PORT") {
            if let Ok(n) = val.parse() {
                config.database.port = n;
            }
        }
        if let Ok(val) = env::var("DATABASE_NAME") {
            config.database.name = val;
        }
        if let Ok(val) = env::var("DATABASE_USERNAME") {
            config.database.username = val;
        }
        if let Ok(val) = env::var("DATABASE_PASSWORD") {
            config.database.password = val;
        }
        if let Ok(val) = env::var("DATABASE_POOL_SIZE") {
            if let Ok(n) = val.parse() {
                config.database.pool_size = n;
            }
        }

        if let Ok(val) = env::var("CACHE_DEFAULT_TTL_SECS") {
            if let Ok(n) = val.parse() {
                config.cache.default_ttl_secs = n;
            }
        }
        if let Ok(val) = env::var("CACHE_CLEANUP_INTERVAL_SECS") {
            if let Ok(n) = val.parse() {
                config.cache.cleanup_interval_secs = n;
            }
        }
        if let Ok(val) = env::var("CACHE_L1_MAX_ITEMS") {
            if let Ok(n) = val.parse() {
                config.cache.l1.max_items = n;
            }
        }
        if let Ok(val) = env::var("CACHE_L1_STRATEGY") {
            config.cache.l1.strategy = val;
        }
        if let Ok(val) = env::var("CACHE_L2_STORAGE_PATH") {
            config.cache.l2.storage_path = val;
        }
        if let Ok(val) = env::var("CACHE_L3_ENABLED") {
            config.cache.l3.enabled = val.parse().unwrap_or(false);
        }
        if let Ok(val) = env::var("CACHE_L3_HOST") {
            config.cache.l3.host = val;
        }
        if let Ok(val) = env::var("CACHE_L3_PORT") {
            if let Ok(n) = val.parse() {
                config.cache.l3.port = n;
            }
        }
        if let Ok(val) = env::var("CACHE_L3_PASSWORD") {
            config.cache.l3.password = val;
        }

        if let Ok(val) = env::var("LOGGING_LEVEL") {
            config.logging.level = val;
        }
        if let Ok(val) = env::var("LOGGING_FORMAT") {
            config.logging.format = val;
        }
        if let Ok(val) = env::var("LOGGING_FILE") {
            config.logging.file = val;
        }

        if let Ok(val) = env::var("SECRETS_PROVIDER") {
            config.secrets.provider = val;
        }
        if let Ok(val) = env::var("SECRETS_ENCRYPTION_KEY") {
            config.secrets.encryption_key = val;
        }
        if let Ok(val) = env::var("SECRETS_VAULT_ADDR") {
            config.secrets.vault_addr = val;
        }

        if let Ok(val) = env::var("CHAT_SERVER_DATA_DIR") {
            config.data_dir = val;
        }
        if let Ok(val) = env::var("CHAT_SERVER_DEV_MODE") {
            config.dev_mode = val.parse().unwrap_or(false);
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load_without_a_file() {
        let loader = ConfigLoader::with_path("/nonexistent/path/config.toml");
        let config = loader.load().expect("defaults should always load");
        assert_eq!(config.server.port, 9443);
        assert_eq!(config.cache.l1.strategy, "lru");
    }
}
