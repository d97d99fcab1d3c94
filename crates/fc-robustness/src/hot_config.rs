//! Hot Config (§4.I): watches config files by modification time; on change, reloads, validates,
//! and delivers the new config to subscribers. A rejected reload keeps the previous value.
//!
//! Adapted from fc-router's `config_sync.rs` polling-ticker idiom, replacing its remote HTTP
//! fetch with a local file stat.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::SystemTime;
use tokio::sync::watch;
use tracing::{error, info, warn};

pub type Validator<T> = Box<dyn Fn(&T) -> Result<(), String> + Send + Sync>;

pub struct HotConfig<T: Clone + Send + Sync + 'static> {
    path: PathBuf,
    last_mtime: Option<SystemTime>,
    parse: Box<dyn Fn(&str) -> Result<T, String> + Send + Sync>,
    validate: Validator<T>,
    tx: watch::Sender<T>,
}

impl<T: Clone + Send + Sync + 'static> HotConfig<T> {
    pub fn new(
        path: impl Into<PathBuf>,
        initial: T,
        parse: impl Fn(&str) -> Result<T, String> + Send + Sync + 'static,
        validate: impl Fn(&T) -> Result<(), String> + Send + Sync + 'static,
    ) -> (Self, watch::Receiver<T>) {
        let (tx, rx) = watch::channel(initial);
        (Self { path: path.into(), last_mtime: None, parse: Box::new(parse), validate: Box::new(validate), tx }, rx)
    }

    fn current_mtime(&self) -> Option<SystemTime> {
        std::fs::metadata(&self.path).and_then(|m| m.modified()).ok()
    }

    /// Checks the file's mtime; if it changed, reloads and validates. Returns `true` if a new
    /// config was applied.
    pub fn poll(&mut self) -> bool {
        let mtime = match self.current_mtime() {
            Some(m) => m,
            None => return false,
        };
        if Some(mtime) == self.last_mtime {
            return false;
        }
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, path = ?self.path, "failed to read hot config file");
                return false;
            }
        };
        let parsed = match (self.parse)(&contents) {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, "hot config failed to parse, keeping previous value");
                return false;
            }
        };
        if let Err(e) = (self.validate)(&parsed) {
            error!(error = %e, "hot config failed validation, keeping previous value");
            return false;
        }
        self.last_mtime = Some(mtime);
        let _ = self.tx.send(parsed);
        info!(path = ?self.path, "hot config reloaded");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reload_applies_valid_change_and_rejects_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.txt");
        std::fs::write(&path, "10").unwrap();

        let (mut hot, rx) = HotConfig::new(
            &path,
            0u32,
            |s: &str| s.trim().parse::<u32>().map_err(|e| e.to_string()),
            |v: &u32| if *v > 0 { Ok(()) } else { Err("must be positive".into()) },
        );
        assert!(hot.poll());
        assert_eq!(*rx.borrow(), 10);

        std::fs::write(&path, "0").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(!hot.poll());
        assert_eq!(*rx.borrow(), 10);
    }
}
