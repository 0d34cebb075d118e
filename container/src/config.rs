//! Container, test engine and server configuration.

use std::path::PathBuf;
use std::time::Duration;

use rule_engine::encode_path_segment;

use crate::refresh::SchedulerConfig;

/// Extension of every synthetic rule path.
pub const RULE_EXTENSION: &str = "rule";

/// Layout of the virtual source trees.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// Directory of production rule sources.
    pub rules_root: String,
    /// Directory of ephemeral test and validation sources.
    pub test_root: String,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            rules_root: "rules".to_string(),
            test_root: "test".to_string(),
        }
    }
}

impl ContainerConfig {
    /// Production path of a rule. Distinct names always give distinct paths.
    pub fn production_path(&self, rule_name: &str) -> String {
        format!(
            "{}/{}.{}",
            self.rules_root,
            encode_path_segment(rule_name),
            RULE_EXTENSION
        )
    }

    /// Path of the `index`-th rule of an ephemeral test tree.
    pub fn test_path(&self, index: usize, rule_name: &str) -> String {
        format!(
            "{}/{}_{}.{}",
            self.test_root,
            index,
            encode_path_segment(rule_name),
            RULE_EXTENSION
        )
    }

    /// Path of the single entry compiled by a syntax check.
    pub fn validation_path(&self) -> String {
        format!("{}/validation.{}", self.test_root, RULE_EXTENSION)
    }
}

/// Test execution limits.
#[derive(Debug, Clone)]
pub struct TestConfig {
    /// Deadline used when a request carries none.
    pub default_timeout_ms: u64,
    /// Firing limit per session; guards against rules that reactivate forever.
    pub max_fires: Option<usize>,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            max_fires: Some(10_000),
        }
    }
}

/// Settings for the `container-server` binary.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub database_path: PathBuf,
    /// JSON file of fact type declarations.
    pub fact_types_path: Option<PathBuf>,
    pub container: ContainerConfig,
    pub test: TestConfig,
    pub scheduler: SchedulerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("./var/data/rules.db"),
            fact_types_path: None,
            container: ContainerConfig::default(),
            test: TestConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Reads `RULE_CONTAINER_*` environment variables over the defaults.
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let mut config = Self::default();

        if let Some(path) = lookup("RULE_CONTAINER_DB_PATH") {
            config.database_path = PathBuf::from(path);
        }
        if let Some(path) = lookup("RULE_CONTAINER_FACT_TYPES") {
            config.fact_types_path = Some(PathBuf::from(path));
        }
        if let Some(root) = lookup("RULE_CONTAINER_RULES_ROOT") {
            config.container.rules_root = root;
        }
        if let Some(root) = lookup("RULE_CONTAINER_TEST_ROOT") {
            config.container.test_root = root;
        }
        if let Some(ms) = lookup("RULE_CONTAINER_TEST_TIMEOUT_MS") {
            config.test.default_timeout_ms = parse_var("RULE_CONTAINER_TEST_TIMEOUT_MS", &ms)?;
        }
        if let Some(limit) = lookup("RULE_CONTAINER_MAX_FIRES") {
            let limit: usize = parse_var("RULE_CONTAINER_MAX_FIRES", &limit)?;
            config.test.max_fires = (limit > 0).then_some(limit);
        }
        if let Some(secs) = lookup("RULE_CONTAINER_SYNC_INTERVAL_SECS") {
            let secs: u64 = parse_var("RULE_CONTAINER_SYNC_INTERVAL_SECS", &secs)?;
            config.scheduler.sync_interval = Duration::from_secs(secs);
        }
        if let Some(enabled) = lookup("RULE_CONTAINER_SYNC_ENABLED") {
            config.scheduler.enabled = parse_var("RULE_CONTAINER_SYNC_ENABLED", &enabled)?;
        }

        if config.test.default_timeout_ms == 0 {
            return Err("RULE_CONTAINER_TEST_TIMEOUT_MS must be positive".to_string());
        }
        if config.scheduler.enabled && config.scheduler.sync_interval.is_zero() {
            return Err("RULE_CONTAINER_SYNC_INTERVAL_SECS must be positive".to_string());
        }
        Ok(config)
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, String>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| format!("Invalid value for {}: '{}' ({})", key, raw, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_paths_are_injective_over_names() {
        let config = ContainerConfig::default();
        assert_eq!(config.production_path("Half price"), "rules/Half%20price.rule");
        assert_ne!(config.production_path("a/b"), config.production_path("a_b"));
        assert_ne!(config.production_path("a b"), config.production_path("a%20b"));
        assert_eq!(config.test_path(2, "x"), "test/2_x.rule");
    }

    #[test]
    fn test_server_config_defaults() {
        let config = ServerConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.database_path, PathBuf::from("./var/data/rules.db"));
        assert_eq!(config.test.default_timeout_ms, 30_000);
        assert!(config.scheduler.enabled);
    }

    #[test]
    fn test_server_config_overrides() {
        let config = ServerConfig::from_lookup(lookup_from(&[
            ("RULE_CONTAINER_DB_PATH", "/tmp/r.db"),
            ("RULE_CONTAINER_TEST_TIMEOUT_MS", "500"),
            ("RULE_CONTAINER_MAX_FIRES", "0"),
            ("RULE_CONTAINER_SYNC_INTERVAL_SECS", "60"),
            ("RULE_CONTAINER_SYNC_ENABLED", "false"),
        ]))
        .unwrap();
        assert_eq!(config.database_path, PathBuf::from("/tmp/r.db"));
        assert_eq!(config.test.default_timeout_ms, 500);
        assert_eq!(config.test.max_fires, None);
        assert_eq!(config.scheduler.sync_interval, Duration::from_secs(60));
        assert!(!config.scheduler.enabled);
    }

    #[test]
    fn test_server_config_rejects_bad_values() {
        let err = ServerConfig::from_lookup(lookup_from(&[("RULE_CONTAINER_TEST_TIMEOUT_MS", "soon")]))
            .unwrap_err();
        assert!(err.contains("RULE_CONTAINER_TEST_TIMEOUT_MS"));
        assert!(ServerConfig::from_lookup(lookup_from(&[("RULE_CONTAINER_TEST_TIMEOUT_MS", "0")])).is_err());
    }
}
