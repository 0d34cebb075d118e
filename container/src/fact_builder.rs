//! Dynamic fact construction.
//!
//! Fact types are declared up front in a `FactTypeRegistry` (name, optional
//! parent, typed fields). `create_instance` builds a fact of a named type from
//! a field → JSON value map, coercing each value to the declared field kind.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::Path;

use chrono::NaiveDate;
use log::{debug, warn};
use rule_engine::{Fact, Value, DATE_FORMAT};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    String,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    Bool,
    Date,
}

impl FieldKind {
    fn default_value(self) -> Value {
        match self {
            FieldKind::I8 | FieldKind::I16 | FieldKind::I32 | FieldKind::I64 => Value::Int(0),
            FieldKind::F32 | FieldKind::F64 => Value::Float(0.0),
            FieldKind::Bool => Value::Bool(false),
            FieldKind::String | FieldKind::Date => Value::Null,
        }
    }

    fn int_range(self) -> Option<(i64, i64)> {
        match self {
            FieldKind::I8 => Some((i8::MIN as i64, i8::MAX as i64)),
            FieldKind::I16 => Some((i16::MIN as i64, i16::MAX as i64)),
            FieldKind::I32 => Some((i32::MIN as i64, i32::MAX as i64)),
            FieldKind::I64 => Some((i64::MIN, i64::MAX)),
            _ => None,
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldKind::String => "string",
            FieldKind::I8 => "i8",
            FieldKind::I16 => "i16",
            FieldKind::I32 => "i32",
            FieldKind::I64 => "i64",
            FieldKind::F32 => "f32",
            FieldKind::F64 => "f64",
            FieldKind::Bool => "bool",
            FieldKind::Date => "date",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConstructionError {
    #[error("unknown fact type '{0}'")]
    UnknownType(String),

    #[error("fact type '{name}' is ambiguous, candidates: {}", .candidates.join(", "))]
    AmbiguousType { name: String, candidates: Vec<String> },

    #[error("fact type '{0}' is abstract and cannot be instantiated")]
    NotConstructible(String),

    #[error("cannot set {type_name}.{field} to {value} (expected {expected}): {reason}")]
    Coercion {
        type_name: String,
        field: String,
        expected: FieldKind,
        value: String,
        reason: String,
    },
}

/// Declaration of one fact type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactType {
    /// Qualified name, e.g. `com.example.Order`.
    pub name: String,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default, rename = "abstract")]
    pub is_abstract: bool,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldKind>,
}

impl FactType {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: None,
            is_abstract: false,
            fields: BTreeMap::new(),
        }
    }

    pub fn field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.insert(name.into(), kind);
        self
    }

    pub fn extends(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn abstract_type(mut self) -> Self {
        self.is_abstract = true;
        self
    }

    pub fn simple_name(&self) -> &str {
        self.name.rsplit('.').next().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct FactTypeRegistry {
    types: HashMap<String, FactType>,
}

impl FactTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON array of fact type declarations.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let types: Vec<FactType> = serde_json::from_str(json)?;
        let mut registry = Self::new();
        for fact_type in types {
            registry.register(fact_type);
        }
        Ok(registry)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, String> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read fact types from {}: {}", path.display(), e))?;
        Self::from_json(&json)
            .map_err(|e| format!("Invalid fact types in {}: {}", path.display(), e))
    }

    /// Registers a type, replacing any previous declaration of the same name.
    pub fn register(&mut self, fact_type: FactType) {
        debug!("Registered fact type {}", fact_type.name);
        self.types.insert(fact_type.name.clone(), fact_type);
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Finds a type by qualified name, or by simple name when exactly one
    /// registered type has it.
    pub fn resolve(&self, type_name: &str) -> Result<&FactType, ConstructionError> {
        if let Some(found) = self.types.get(type_name) {
            return Ok(found);
        }
        let mut candidates: Vec<&FactType> = self
            .types
            .values()
            .filter(|t| t.simple_name() == type_name)
            .collect();
        match candidates.len() {
            0 => Err(ConstructionError::UnknownType(type_name.to_string())),
            1 => Ok(candidates.remove(0)),
            _ => {
                let mut names: Vec<String> = candidates.iter().map(|t| t.name.clone()).collect();
                names.sort();
                Err(ConstructionError::AmbiguousType {
                    name: type_name.to_string(),
                    candidates: names,
                })
            }
        }
    }

    /// Ancestors of `fact_type`, nearest first.
    fn ancestors<'a>(&'a self, fact_type: &'a FactType) -> Result<Vec<&'a FactType>, ConstructionError> {
        let mut chain = Vec::new();
        let mut seen = HashSet::from([fact_type.name.as_str()]);
        let mut current = fact_type;
        while let Some(parent) = current.parent.as_deref() {
            let parent = self.resolve(parent)?;
            if !seen.insert(parent.name.as_str()) {
                break;
            }
            chain.push(parent);
            current = parent;
        }
        Ok(chain)
    }

    /// Builds a fact of `type_name` from the supplied field values. Fields not
    /// supplied keep their defaults; unknown fields are skipped with a warning.
    pub fn create_instance(
        &self,
        type_name: &str,
        field_values: &BTreeMap<String, Json>,
    ) -> Result<Fact, ConstructionError> {
        let fact_type = self.resolve(type_name)?;
        if fact_type.is_abstract {
            return Err(ConstructionError::NotConstructible(fact_type.name.clone()));
        }
        let ancestors = self.ancestors(fact_type)?;

        // Nearest declaration of a field wins.
        let mut kinds: BTreeMap<&str, FieldKind> = BTreeMap::new();
        for declared in std::iter::once(fact_type).chain(ancestors.iter().copied()) {
            for (name, kind) in &declared.fields {
                kinds.entry(name.as_str()).or_insert(*kind);
            }
        }

        let mut fact = Fact::new(fact_type.name.clone())
            .with_supertypes(ancestors.iter().map(|t| t.name.clone()).collect());
        for (name, kind) in &kinds {
            fact.set(*name, kind.default_value());
        }

        for (field, raw) in field_values {
            let Some(kind) = kinds.get(field.as_str()) else {
                warn!("Field '{}' not found on fact type {}, skipping", field, fact_type.name);
                continue;
            };
            let value = coerce(raw, *kind).map_err(|reason| ConstructionError::Coercion {
                type_name: fact_type.name.clone(),
                field: field.clone(),
                expected: *kind,
                value: raw.to_string(),
                reason,
            })?;
            fact.set(field.clone(), value);
        }
        Ok(fact)
    }
}

fn coerce(raw: &Json, kind: FieldKind) -> Result<Value, String> {
    if raw.is_null() {
        return Ok(Value::Null);
    }
    match kind {
        FieldKind::String => Ok(Value::Str(match raw {
            Json::String(s) => s.clone(),
            other => other.to_string(),
        })),
        FieldKind::I8 | FieldKind::I16 | FieldKind::I32 | FieldKind::I64 => {
            let n = match raw {
                Json::Number(n) => n
                    .as_i64()
                    .ok_or_else(|| "not an integer".to_string())?,
                Json::String(s) => s
                    .trim()
                    .parse::<i64>()
                    .map_err(|e| e.to_string())?,
                _ => return Err("not a number".to_string()),
            };
            match kind.int_range() {
                Some((min, max)) if n < min || n > max => {
                    Err(format!("out of range [{}, {}]", min, max))
                }
                _ => Ok(Value::Int(n)),
            }
        }
        FieldKind::F32 | FieldKind::F64 => {
            let f = match raw {
                Json::Number(n) => n.as_f64().ok_or_else(|| "not a number".to_string())?,
                Json::String(s) => s.trim().parse::<f64>().map_err(|e| e.to_string())?,
                _ => return Err("not a number".to_string()),
            };
            if kind == FieldKind::F32 && f.is_finite() && f.abs() > f32::MAX as f64 {
                return Err("out of range for f32".to_string());
            }
            Ok(Value::Float(f))
        }
        FieldKind::Bool => match raw {
            Json::Bool(b) => Ok(Value::Bool(*b)),
            Json::String(s) if s.trim().eq_ignore_ascii_case("true") => Ok(Value::Bool(true)),
            Json::String(s) if s.trim().eq_ignore_ascii_case("false") => Ok(Value::Bool(false)),
            _ => Err("expected true or false".to_string()),
        },
        FieldKind::Date => match raw {
            Json::String(s) => NaiveDate::parse_from_str(s.trim(), DATE_FORMAT)
                .map(Value::Date)
                .map_err(|e| format!("expected yyyy-MM-dd: {}", e)),
            _ => Err("expected a yyyy-MM-dd string".to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> FactTypeRegistry {
        let mut registry = FactTypeRegistry::new();
        registry.register(
            FactType::new("com.example.Entity")
                .abstract_type()
                .field("id", FieldKind::I64)
                .field("createdOn", FieldKind::Date),
        );
        registry.register(
            FactType::new("com.example.Order")
                .extends("com.example.Entity")
                .field("price", FieldKind::F64)
                .field("quantity", FieldKind::I32)
                .field("code", FieldKind::String)
                .field("discounted", FieldKind::Bool),
        );
        registry.register(FactType::new("com.example.Customer").field("name", FieldKind::String));
        registry.register(FactType::new("legacy.Customer").field("name", FieldKind::String));
        registry
    }

    fn values(json: Json) -> BTreeMap<String, Json> {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_create_with_defaults_and_inherited_fields() {
        let fact = registry()
            .create_instance("Order", &values(json!({"id": "42", "price": 9.5, "createdOn": "2024-03-01"})))
            .unwrap();
        assert_eq!(fact.type_name(), "com.example.Order");
        assert!(fact.is_instance_of("Entity"));
        assert_eq!(fact.get("id"), Some(&Value::Int(42)));
        assert_eq!(fact.get("price"), Some(&Value::Float(9.5)));
        assert_eq!(fact.get("quantity"), Some(&Value::Int(0)));
        assert_eq!(fact.get("discounted"), Some(&Value::Bool(false)));
        assert_eq!(fact.get("code"), Some(&Value::Null));
        assert_eq!(
            fact.get("createdOn"),
            Some(&Value::Date(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()))
        );
    }

    #[test]
    fn test_unknown_field_is_skipped() {
        let fact = registry()
            .create_instance("com.example.Order", &values(json!({"colour": "red"})))
            .unwrap();
        assert_eq!(fact.get("colour"), None);
    }

    #[test]
    fn test_type_resolution_errors() {
        let registry = registry();
        assert_eq!(
            registry.create_instance("Invoice", &BTreeMap::new()),
            Err(ConstructionError::UnknownType("Invoice".to_string()))
        );
        assert!(matches!(
            registry.create_instance("Customer", &BTreeMap::new()),
            Err(ConstructionError::AmbiguousType { .. })
        ));
        assert!(registry.create_instance("legacy.Customer", &BTreeMap::new()).is_ok());
        assert_eq!(
            registry.create_instance("Entity", &BTreeMap::new()),
            Err(ConstructionError::NotConstructible("com.example.Entity".to_string()))
        );
    }

    #[test]
    fn test_coercion_failures() {
        let registry = registry();
        let err = registry
            .create_instance("Order", &values(json!({"quantity": 3_000_000_000i64})))
            .unwrap_err();
        assert!(matches!(err, ConstructionError::Coercion { ref field, .. } if field == "quantity"));

        for bad in [json!({"price": "cheap"}), json!({"discounted": "yes"}), json!({"createdOn": "01/03/2024"}), json!({"quantity": 1.5})] {
            assert!(registry.create_instance("Order", &values(bad)).is_err());
        }
    }

    #[test]
    fn test_registry_from_json() {
        let registry = FactTypeRegistry::from_json(
            r#"[{"name": "shop.Order", "fields": {"price": "f64", "paid": "bool"}},
                {"name": "shop.Base", "abstract": true}]"#,
        )
        .unwrap();
        assert_eq!(registry.len(), 2);
        let fact = registry
            .create_instance("Order", &values(json!({"paid": "TRUE"})))
            .unwrap();
        assert_eq!(fact.get("paid"), Some(&Value::Bool(true)));
    }
}
