//! Periodic reconciliation of the container with the rule store.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{error, info};
use parking_lot::RwLock;
use tokio::time::{interval, MissedTickBehavior};

use super::service::SyncService;
use crate::lifecycle::RuleContainer;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub sync_interval: Duration,
    pub enabled: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(5 * 60),
            enabled: true,
        }
    }
}

/// Background task that calls `sync_with_persistence` on every tick.
///
/// A failed sync is logged and the previously served module stays in place.
pub struct SyncScheduler {
    service: SyncService,
    config: SchedulerConfig,
    last_sync_at: Arc<RwLock<Option<DateTime<Utc>>>>,
}

impl SyncScheduler {
    pub fn new(container: Arc<RuleContainer>, config: SchedulerConfig) -> Self {
        Self {
            service: SyncService::new(container),
            config,
            last_sync_at: Arc::new(RwLock::new(None)),
        }
    }

    /// Time of the last successful sync, if any.
    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        *self.last_sync_at.read()
    }

    /// Runs until the task is aborted. Returns at once when disabled.
    pub async fn start(self: Arc<Self>) {
        if !self.config.enabled {
            info!("Scheduled sync is disabled, skipping");
            return;
        }

        info!(
            "Starting scheduled sync with {}-second interval",
            self.config.sync_interval.as_secs()
        );

        let mut ticker = interval(self.config.sync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately; the container was just initialized
        ticker.tick().await;

        loop {
            ticker.tick().await;
            self.run_once().await;
        }
    }

    async fn run_once(&self) {
        match self.service.sync_now().await {
            Ok(stats) => {
                if stats.report.has_changes() {
                    info!(
                        "Scheduled sync applied changes in {} ms: {} rule(s) loaded",
                        stats.duration_ms, stats.report.loaded
                    );
                }
                *self.last_sync_at.write() = Some(stats.timestamp);
            }
            Err(e) => {
                error!("Scheduled sync failed: {}", e);
            }
        }
    }
}
