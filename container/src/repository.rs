//! Rule definition persistence.
//!
//! The container only needs three queries from storage: the enabled rule set,
//! a lookup by id and a status toggle. `SqliteRuleRepository` is the durable
//! implementation; `InMemoryRuleRepository` backs tests and embedded use.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use log::debug;
use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;

use crate::types::{RuleDefinition, RuleId};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("rule {0} not found")]
    NotFound(RuleId),

    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

pub trait RuleRepository: Send + Sync {
    /// Every enabled definition, ordered by id.
    fn list_enabled(&self) -> Result<Vec<RuleDefinition>, RepositoryError>;

    fn find_by_id(&self, id: RuleId) -> Result<Option<RuleDefinition>, RepositoryError>;

    /// Sets the enabled flag and returns the updated definition.
    fn set_enabled(&self, id: RuleId, enabled: bool) -> Result<RuleDefinition, RepositoryError>;
}

// ================================================================================================
// IN-MEMORY
// ================================================================================================

#[derive(Debug, Default)]
pub struct InMemoryRuleRepository {
    rules: RwLock<BTreeMap<RuleId, RuleDefinition>>,
}

impl InMemoryRuleRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rules(rules: impl IntoIterator<Item = RuleDefinition>) -> Self {
        let repo = Self::new();
        for rule in rules {
            repo.upsert(rule);
        }
        repo
    }

    pub fn upsert(&self, rule: RuleDefinition) {
        self.rules.write().insert(rule.id, rule);
    }

    pub fn delete(&self, id: RuleId) -> Option<RuleDefinition> {
        self.rules.write().remove(&id)
    }
}

impl RuleRepository for InMemoryRuleRepository {
    fn list_enabled(&self) -> Result<Vec<RuleDefinition>, RepositoryError> {
        Ok(self
            .rules
            .read()
            .values()
            .filter(|r| r.enabled)
            .cloned()
            .collect())
    }

    fn find_by_id(&self, id: RuleId) -> Result<Option<RuleDefinition>, RepositoryError> {
        Ok(self.rules.read().get(&id).cloned())
    }

    fn set_enabled(&self, id: RuleId, enabled: bool) -> Result<RuleDefinition, RepositoryError> {
        let mut rules = self.rules.write();
        let rule = rules.get_mut(&id).ok_or(RepositoryError::NotFound(id))?;
        rule.enabled = enabled;
        rule.version += 1;
        rule.updated_at = Utc::now();
        Ok(rule.clone())
    }
}

// ================================================================================================
// SQLITE
// ================================================================================================

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS rule_definitions (
    id          INTEGER PRIMARY KEY,
    name        TEXT NOT NULL UNIQUE,
    content     TEXT NOT NULL,
    enabled     INTEGER NOT NULL DEFAULT 1,
    description TEXT,
    version     INTEGER NOT NULL DEFAULT 0,
    created_at  INTEGER NOT NULL,
    updated_at  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_rule_definitions_enabled ON rule_definitions(enabled);
";

const COLUMNS: &str = "id, name, content, enabled, description, version, created_at, updated_at";

/// SQLite-backed repository. Timestamps are stored as epoch milliseconds.
#[derive(Debug)]
pub struct SqliteRuleRepository {
    db: Mutex<Connection>,
}

impl SqliteRuleRepository {
    /// Opens (creating if needed) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RepositoryError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    RepositoryError::Storage(format!("Failed to create storage directory: {}", e))
                })?;
            }
        }
        Self::from_connection(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, RepositoryError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, RepositoryError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// Inserts or replaces a definition.
    pub fn upsert(&self, rule: &RuleDefinition) -> Result<(), RepositoryError> {
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO rule_definitions (id, name, content, enabled, description, version, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                content = excluded.content,
                enabled = excluded.enabled,
                description = excluded.description,
                version = excluded.version,
                updated_at = excluded.updated_at",
            params![
                rule.id.0,
                rule.name,
                rule.content,
                rule.enabled,
                rule.description,
                rule.version as i64,
                rule.created_at.timestamp_millis(),
                rule.updated_at.timestamp_millis(),
            ],
        )?;
        debug!("Stored rule {} ({})", rule.id, rule.name);
        Ok(())
    }

    pub fn delete(&self, id: RuleId) -> Result<bool, RepositoryError> {
        let conn = self.db.lock();
        let changed = conn.execute("DELETE FROM rule_definitions WHERE id = ?1", params![id.0])?;
        Ok(changed > 0)
    }

    pub fn count(&self) -> Result<usize, RepositoryError> {
        let conn = self.db.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM rule_definitions", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}

impl RuleRepository for SqliteRuleRepository {
    fn list_enabled(&self) -> Result<Vec<RuleDefinition>, RepositoryError> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM rule_definitions WHERE enabled = 1 ORDER BY id",
            COLUMNS
        ))?;
        let rows = stmt.query_map([], row_to_definition)?;
        let collected: Result<Vec<_>, _> = rows.collect();
        Ok(collected?)
    }

    fn find_by_id(&self, id: RuleId) -> Result<Option<RuleDefinition>, RepositoryError> {
        let conn = self.db.lock();
        let found = conn
            .query_row(
                &format!("SELECT {} FROM rule_definitions WHERE id = ?1", COLUMNS),
                params![id.0],
                row_to_definition,
            )
            .optional()?;
        Ok(found)
    }

    fn set_enabled(&self, id: RuleId, enabled: bool) -> Result<RuleDefinition, RepositoryError> {
        {
            let conn = self.db.lock();
            let changed = conn.execute(
                "UPDATE rule_definitions SET enabled = ?1, version = version + 1, updated_at = ?2 WHERE id = ?3",
                params![enabled, Utc::now().timestamp_millis(), id.0],
            )?;
            if changed == 0 {
                return Err(RepositoryError::NotFound(id));
            }
        }
        self.find_by_id(id)?.ok_or(RepositoryError::NotFound(id))
    }
}

fn row_to_definition(row: &Row<'_>) -> rusqlite::Result<RuleDefinition> {
    let version: i64 = row.get(5)?;
    Ok(RuleDefinition {
        id: RuleId(row.get(0)?),
        name: row.get(1)?,
        content: row.get(2)?,
        enabled: row.get(3)?,
        description: row.get(4)?,
        version: version.max(0) as u64,
        created_at: from_millis(row.get(6)?),
        updated_at: from_millis(row.get(7)?),
    })
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_in_memory_lists_only_enabled() {
        let repo = InMemoryRuleRepository::with_rules([
            RuleDefinition::new(1, "a", "rule a when then end"),
            RuleDefinition::new(2, "b", "rule b when then end").disabled(),
        ]);
        let ids: Vec<_> = repo.list_enabled().unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![RuleId(1)]);
    }

    #[test]
    fn test_in_memory_set_enabled_bumps_version() {
        let repo = InMemoryRuleRepository::with_rules([RuleDefinition::new(1, "a", "x")]);
        let updated = repo.set_enabled(RuleId(1), false).unwrap();
        assert!(!updated.enabled);
        assert_eq!(updated.version, 1);
        assert!(matches!(
            repo.set_enabled(RuleId(9), true),
            Err(RepositoryError::NotFound(RuleId(9)))
        ));
    }

    #[test]
    fn test_sqlite_roundtrip_on_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("rules.db");
        let repo = SqliteRuleRepository::open(&path).unwrap();

        let rule = RuleDefinition::new(7, "discount", "rule d when then end").with_description("10% off");
        repo.upsert(&rule).unwrap();
        repo.upsert(&RuleDefinition::new(8, "off", "rule o when then end").disabled())
            .unwrap();

        let loaded = repo.find_by_id(RuleId(7)).unwrap().unwrap();
        assert_eq!(loaded.name, "discount");
        assert_eq!(loaded.description.as_deref(), Some("10% off"));
        assert_eq!(
            loaded.created_at.timestamp_millis(),
            rule.created_at.timestamp_millis()
        );
        assert_eq!(repo.list_enabled().unwrap().len(), 1);
        assert!(repo.find_by_id(RuleId(99)).unwrap().is_none());

        // reopening sees the same rows
        drop(repo);
        let reopened = SqliteRuleRepository::open(&path).unwrap();
        assert_eq!(reopened.count().unwrap(), 2);
    }

    #[test]
    fn test_sqlite_set_enabled() {
        let repo = SqliteRuleRepository::in_memory().unwrap();
        repo.upsert(&RuleDefinition::new(1, "a", "rule a when then end")).unwrap();

        let updated = repo.set_enabled(RuleId(1), false).unwrap();
        assert!(!updated.enabled);
        assert_eq!(updated.version, 1);
        assert!(repo.list_enabled().unwrap().is_empty());
        assert!(matches!(
            repo.set_enabled(RuleId(2), true),
            Err(RepositoryError::NotFound(_))
        ));
        assert!(repo.delete(RuleId(1)).unwrap());
    }
}
