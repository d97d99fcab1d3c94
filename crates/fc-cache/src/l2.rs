//! L2: local persistent store (§4.F). One file per key at
//! `<root>/<hh>/<md5(key).hex>.cache`, written atomically via a temp-file-then-rename so a
//! concurrent reader never observes a partial write.

use fc_common::{CacheItem, CacheLevelStats};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

const RECORD_VERSION: u8 = 1;

pub struct L2Store {
    root: PathBuf,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl L2Store {
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root, hits: AtomicU64::new(0), misses: AtomicU64::new(0) })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let digest = format!("{:x}", md5::compute(key.as_bytes()));
        let shard = &digest[..2];
        self.root.join(shard).join(format!("{digest}.cache"))
    }

    pub fn set(&self, key: &str, item: &CacheItem<serde_json::Value>) -> bool {
        let path = self.path_for(key);
        let dir = match path.parent() {
            Some(d) => d,
            None => return false,
        };
        if std::fs::create_dir_all(dir).is_err() {
            return false;
        }
        let record = serde_json::json!({
            "version": RECORD_VERSION,
            "key": key,
            "item": item,
        });
        let bytes = match serde_json::to_vec(&record) {
            Ok(b) => b,
            Err(_) => return false,
        };
        let tmp = dir.join(format!(".tmp-{}", uuid::Uuid::new_v4()));
        if std::fs::write(&tmp, &bytes).is_err() {
            let _ = std::fs::remove_file(&tmp);
            return false;
        }
        std::fs::rename(&tmp, &path).is_ok()
    }

    pub fn get(&self, key: &str) -> Option<CacheItem<serde_json::Value>> {
        let path = self.path_for(key);
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(_) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        let parsed: serde_json::Value = match serde_json::from_slice(&bytes) {
            Ok(v) => v,
            Err(_) => {
                // corrupt record: treat as absent and unlink
                let _ = std::fs::remove_file(&path);
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        let stored_key = parsed.get("key").and_then(|v| v.as_str());
        if stored_key != Some(key) {
            let _ = std::fs::remove_file(&path);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let item: Option<CacheItem<serde_json::Value>> =
            parsed.get("item").and_then(|v| serde_json::from_value(v.clone()).ok());
        match item {
            Some(item) if !item.metadata.is_expired() => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(item)
            }
            _ => {
                let _ = std::fs::remove_file(&path);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn remove(&self, key: &str) -> bool {
        std::fs::remove_file(self.path_for(key)).is_ok()
    }

    pub fn exists(&self, key: &str) -> bool {
        self.path_for(key).exists()
    }

    pub fn clear(&self) {
        let _ = std::fs::remove_dir_all(&self.root);
        let _ = std::fs::create_dir_all(&self.root);
    }

    /// Walks every shard directory, removing expired records; used by the §4.F maintenance
    /// tick alongside L1's sweep.
    pub fn sweep_expired(&self) {
        let Ok(shards) = std::fs::read_dir(&self.root) else { return };
        for shard in shards.flatten() {
            let Ok(files) = std::fs::read_dir(shard.path()) else { continue };
            for file in files.flatten() {
                let path = file.path();
                if !is_cache_file(&path) {
                    continue;
                }
                if let Ok(bytes) = std::fs::read(&path) {
                    let expired = serde_json::from_slice::<serde_json::Value>(&bytes)
                        .ok()
                        .and_then(|v| v.get("item").cloned())
                        .and_then(|v| serde_json::from_value::<CacheItem<serde_json::Value>>(v).ok())
                        .map(|item| item.metadata.is_expired())
                        .unwrap_or(true);
                    if expired {
                        let _ = std::fs::remove_file(&path);
                    }
                }
            }
        }
    }

    pub fn stats(&self, approx_count: u64, approx_size: u64) -> CacheLevelStats {
        CacheLevelStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            size: approx_size,
            count: approx_count,
        }
    }
}

fn is_cache_file(path: &Path) -> bool {
    path.extension().map(|e| e == "cache").unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fc_common::{CacheLevel, CacheMetadata};

    fn item() -> CacheItem<serde_json::Value> {
        CacheItem {
            data: serde_json::json!({"hello": "world"}),
            metadata: CacheMetadata::new(None, None, 50, 12, CacheLevel::L2),
        }
    }

    #[test]
    fn set_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = L2Store::new(dir.path()).unwrap();
        assert!(store.set("mykey", &item()));
        let got = store.get("mykey").unwrap();
        assert_eq!(got.data, serde_json::json!({"hello": "world"}));
    }

    #[test]
    fn corrupt_record_is_treated_as_absent_and_unlinked() {
        let dir = tempfile::tempdir().unwrap();
        let store = L2Store::new(dir.path()).unwrap();
        let path = store.path_for("mykey");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"not json").unwrap();
        assert!(store.get("mykey").is_none());
        assert!(!path.exists());
    }

    #[test]
    fn expired_record_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let store = L2Store::new(dir.path()).unwrap();
        let mut it = item();
        it.metadata.expires_at = Some(chrono::Utc::now() - chrono::Duration::seconds(1));
        store.set("mykey", &it);
        assert!(store.get("mykey").is_none());
    }
}
