//! # Refresh Module
//!
//! Keeps the production container in line with the rule store, either on a
//! fixed interval or on demand.

pub mod scheduler;
pub mod service;

pub use scheduler::{SchedulerConfig, SyncScheduler};
pub use service::{SyncService, SyncStats};
