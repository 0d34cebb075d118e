//! # Container Types
//!
//! Rule definitions as stored by the persistence layer, plus the request and
//! result types exchanged with callers of the container and the test engine.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ================================================================================================
// RULE DEFINITIONS
// ================================================================================================

/// Persistence identifier of a rule definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(pub i64);

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A stored rule: its name, rule text and status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleDefinition {
    pub id: RuleId,
    /// Unique among stored definitions.
    pub name: String,
    pub content: String,
    pub enabled: bool,
    pub description: Option<String>,
    /// Changes on every update. Only compared by callers.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RuleDefinition {
    /// An enabled definition at version 0, timestamped now.
    pub fn new(id: i64, name: impl Into<String>, content: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: RuleId(id),
            name: name.into(),
            content: content.into(),
            enabled: true,
            description: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn has_content(&self) -> bool {
        !self.content.trim().is_empty()
    }
}

// ================================================================================================
// CONTAINER REPORTS
// ================================================================================================

/// Outcome of a syntax check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning_message: Option<String>,
}

impl ValidationResult {
    pub fn valid(warning_message: Option<String>) -> Self {
        Self {
            valid: true,
            error_message: None,
            warning_message,
        }
    }

    pub fn invalid(error_message: impl Into<String>, warning_message: Option<String>) -> Self {
        Self {
            valid: false,
            error_message: Some(error_message.into()),
            warning_message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerHealthStatus {
    pub initialized: bool,
    pub healthy: bool,
    pub status_message: String,
    pub loaded_rules_count: usize,
    pub loaded_rule_ids: Vec<RuleId>,
    pub release_id: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// What a reconciliation with persistence changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub added: Vec<RuleId>,
    pub removed: Vec<RuleId>,
    /// Loaded rules whose text or name changed.
    pub refreshed: Vec<RuleId>,
    /// Enabled rules that could not be loaded.
    pub skipped: Vec<RuleId>,
    /// Whether a rebuild ran.
    pub rebuilt: bool,
    /// Rules loaded after the sync.
    pub loaded: usize,
}

impl SyncReport {
    pub fn has_changes(&self) -> bool {
        !(self.added.is_empty() && self.removed.is_empty() && self.refreshed.is_empty())
    }
}

// ================================================================================================
// TEST EXECUTION
// ================================================================================================

/// One fact to synthesize for a test run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleFactConfig {
    /// Label used in diagnostics.
    pub fact_name: String,
    /// Fact type, qualified or simple name.
    pub class_name: String,
    #[serde(default)]
    pub field_values: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRuleRequest {
    pub rule_ids: Vec<RuleId>,
    #[serde(default)]
    pub rule_configs: Vec<RuleFactConfig>,
    #[serde(default)]
    pub verbose: bool,
    /// Falls back to the engine's configured default.
    #[serde(default)]
    pub max_execution_time_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestFailureKind {
    InvalidRequest,
    NoValidRules,
    NoFacts,
    Compilation,
    Construction,
    Runtime,
    Timeout,
    Internal,
}

/// A rule firing observed during a test run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FiredRuleInfo {
    pub rule_name: String,
    pub rule_package: String,
    /// Definition the rule came from, when it can be attributed.
    pub rule_id: Option<RuleId>,
    pub description: Option<String>,
    pub fired_at: DateTime<Utc>,
    pub matched_objects: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub success: bool,
    pub execution_time_ms: u64,
    pub fired_rules_count: usize,
    pub fired_rules: Vec<FiredRuleInfo>,
    /// Final working memory, keyed `object_<index>`.
    pub result_data: BTreeMap<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<TestFailureKind>,
    pub test_time: DateTime<Utc>,
}

impl TestResult {
    pub fn failure(kind: TestFailureKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            execution_time_ms: 0,
            fired_rules_count: 0,
            fired_rules: Vec::new(),
            result_data: BTreeMap::new(),
            error_message: Some(message.into()),
            stack_trace: None,
            execution_details: None,
            failure_kind: Some(kind),
            test_time: Utc::now(),
        }
    }
}
