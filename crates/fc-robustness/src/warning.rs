//! Warning service (§4.I): a bounded in-memory store of `Warning` records with acknowledgement,
//! auto-acknowledgement, and an optional async notification sink.

use fc_common::{Warning, WarningCategory, WarningSeverity};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

#[async_trait::async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, warning: &Warning);
}

#[derive(Debug, Clone)]
pub struct WarningServiceConfig {
    pub max_warnings: usize,
    pub auto_acknowledge_after_minutes: i64,
}

impl Default for WarningServiceConfig {
    fn default() -> Self {
        Self { max_warnings: 1000, auto_acknowledge_after_minutes: 480 }
    }
}

pub struct WarningService {
    warnings: RwLock<HashMap<String, Warning>>,
    config: WarningServiceConfig,
    sink: RwLock<Option<Arc<dyn NotificationSink>>>,
}

impl WarningService {
    pub fn new(config: WarningServiceConfig) -> Self {
        Self { warnings: RwLock::new(HashMap::new()), config, sink: RwLock::new(None) }
    }

    pub fn set_notification_sink(&self, sink: Arc<dyn NotificationSink>) {
        *self.sink.write() = Some(sink);
    }

    pub fn report(self: &Arc<Self>, category: WarningCategory, severity: WarningSeverity, message: impl Into<String>) -> String {
        let warning = Warning::new(category, severity, message);
        let id = warning.id.clone();

        {
            let mut warnings = self.warnings.write();
            if warnings.len() >= self.config.max_warnings {
                self.evict_oldest(&mut warnings);
            }
            warnings.insert(id.clone(), warning.clone());
        }
        debug!(%id, ?category, ?severity, "warning reported");

        if let Some(sink) = self.sink.read().clone() {
            tokio::spawn(async move { sink.notify(&warning).await });
        }
        id
    }

    fn evict_oldest(&self, warnings: &mut HashMap<String, Warning>) {
        if let Some(oldest_id) = warnings.values().max_by_key(|w| w.age_minutes()).map(|w| w.id.clone()) {
            warnings.remove(&oldest_id);
        }
    }

    pub fn all(&self) -> Vec<Warning> {
        self.warnings.read().values().cloned().collect()
    }

    pub fn by_severity(&self, severity: WarningSeverity) -> Vec<Warning> {
        self.warnings.read().values().filter(|w| w.severity == severity).cloned().collect()
    }

    pub fn by_category(&self, category: WarningCategory) -> Vec<Warning> {
        self.warnings.read().values().filter(|w| w.category == category).cloned().collect()
    }

    pub fn unacknowledged(&self) -> Vec<Warning> {
        self.warnings.read().values().filter(|w| !w.acknowledged).cloned().collect()
    }

    pub fn acknowledge(&self, id: &str) -> bool {
        if let Some(w) = self.warnings.write().get_mut(id) {
            w.acknowledged = true;
            true
        } else {
            false
        }
    }

    /// Acknowledges every warning older than `autoAcknowledgeAfterMinutes` (§4.I).
    pub fn auto_acknowledge(&self) -> usize {
        let threshold = self.config.auto_acknowledge_after_minutes;
        let mut warnings = self.warnings.write();
        let mut count = 0;
        for w in warnings.values_mut() {
            if !w.acknowledged && w.age_minutes() >= threshold {
                w.acknowledged = true;
                count += 1;
            }
        }
        if count > 0 {
            info!(count, "auto-acknowledged stale warnings");
        }
        count
    }

    pub fn len(&self) -> usize {
        self.warnings.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.warnings.read().is_empty()
    }
}

impl Default for WarningService {
    fn default() -> Self {
        Self::new(WarningServiceConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_and_acknowledge() {
        let svc = Arc::new(WarningService::default());
        let id = svc.report(WarningCategory::Resource, WarningSeverity::Warn, "disk low");
        assert_eq!(svc.unacknowledged().len(), 1);
        assert!(svc.acknowledge(&id));
        assert_eq!(svc.unacknowledged().len(), 0);
    }

    #[test]
    fn max_warnings_evicts_oldest() {
        let svc = Arc::new(WarningService::new(WarningServiceConfig { max_warnings: 2, auto_acknowledge_after_minutes: 480 }));
        svc.report(WarningCategory::Resource, WarningSeverity::Info, "a");
        svc.report(WarningCategory::Resource, WarningSeverity::Info, "b");
        svc.report(WarningCategory::Resource, WarningSeverity::Info, "c");
        assert_eq!(svc.len(), 2);
    }
}
