//! On-demand synchronization of the container with the rule store.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{ContainerError, Operation};
use crate::lifecycle::RuleContainer;
use crate::types::SyncReport;

/// Outcome of one synchronization.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    pub report: SyncReport,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

pub struct SyncService {
    container: Arc<RuleContainer>,
}

impl SyncService {
    pub fn new(container: Arc<RuleContainer>) -> Self {
        Self { container }
    }

    /// Reconciles the container with the store right away.
    ///
    /// The rebuild runs on the blocking pool so callers on the runtime are
    /// not stalled by compilation.
    pub async fn sync_now(&self) -> Result<SyncStats, ContainerError> {
        let start = Instant::now();
        let container = Arc::clone(&self.container);
        let report = tokio::task::spawn_blocking(move || container.sync_with_persistence())
            .await
            .map_err(|e| ContainerError::Operation {
                operation: Operation::Sync,
                rule_id: None,
                reason: format!("sync worker failed: {}", e),
            })??;

        Ok(SyncStats {
            report,
            duration_ms: u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
            timestamp: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContainerConfig;
    use crate::repository::InMemoryRuleRepository;
    use crate::types::{RuleDefinition, RuleId};

    #[tokio::test]
    async fn test_sync_now_picks_up_new_rules() {
        let repo = Arc::new(InMemoryRuleRepository::new());
        let container = Arc::new(RuleContainer::new(repo.clone(), ContainerConfig::default()));
        container.initialize().unwrap();
        let service = SyncService::new(Arc::clone(&container));

        repo.upsert(RuleDefinition::new(1, "a", "rule a when Order() then end"));
        let stats = service.sync_now().await.unwrap();
        assert_eq!(stats.report.added, vec![RuleId(1)]);
        assert_eq!(stats.report.loaded, 1);
        assert!(container.is_rule_loaded(RuleId(1)));

        let stats = service.sync_now().await.unwrap();
        assert!(!stats.report.has_changes());
    }

    #[tokio::test]
    async fn test_failed_sync_keeps_serving_rules() {
        let repo = Arc::new(InMemoryRuleRepository::with_rules([RuleDefinition::new(
            1,
            "a",
            "rule a when Order() then end",
        )]));
        let container = Arc::new(RuleContainer::new(repo.clone(), ContainerConfig::default()));
        container.initialize().unwrap();
        let release = container.release_id();
        let service = SyncService::new(Arc::clone(&container));

        repo.upsert(RuleDefinition::new(2, "b", "rule b when Order( then end"));
        assert!(service.sync_now().await.is_err());
        assert_eq!(container.release_id(), release);
        assert!(!container.is_rule_loaded(RuleId(2)));
    }
}
