//! # Rule Container Library
//!
//! Serves compiled rules from a persistent store with incremental rebuilds,
//! and runs isolated test executions of stored rules.

// Core modules
pub mod config;
pub mod ephemeral;
pub mod error;
pub mod fact_builder;
pub mod lifecycle;
pub mod refresh;
pub mod repository;
pub mod test_engine;
pub mod types;

// Re-export commonly used types
pub use config::{ContainerConfig, ServerConfig, TestConfig};
pub use error::{ContainerError, Operation};
pub use fact_builder::{FactType, FactTypeRegistry, FieldKind};
pub use lifecycle::RuleContainer;
pub use repository::{InMemoryRuleRepository, RuleRepository, SqliteRuleRepository};
pub use test_engine::TestExecutionEngine;
pub use types::{RuleDefinition, RuleId, TestResult, TestRuleRequest};
