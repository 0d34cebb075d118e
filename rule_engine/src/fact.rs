//! Fact objects held in a session's working memory.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::value::Value;

/// Handle of a fact inside one session. Handles are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FactHandle(pub(crate) u64);

impl FactHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for FactHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A plain data object: a type name, its ancestor types and named fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Fact {
    #[serde(rename = "type")]
    type_name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    supertypes: Vec<String>,
    fields: BTreeMap<String, Value>,
}

impl Fact {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            supertypes: Vec::new(),
            fields: BTreeMap::new(),
        }
    }

    /// Declares ancestor types, nearest first. Patterns written against an
    /// ancestor type match this fact.
    pub fn with_supertypes(mut self, supertypes: Vec<String>) -> Self {
        self.supertypes = supertypes;
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Last segment of the qualified type name.
    pub fn simple_name(&self) -> &str {
        simple_name(&self.type_name)
    }

    pub fn supertypes(&self) -> &[String] {
        &self.supertypes
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Field value, `Null` when the field is absent.
    pub fn field_or_null(&self, field: &str) -> Value {
        self.fields.get(field).cloned().unwrap_or(Value::Null)
    }

    pub fn set(&mut self, field: impl Into<String>, value: Value) -> Option<Value> {
        self.fields.insert(field.into(), value)
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    /// True when `pattern_type` names this fact's type or one of its
    /// supertypes. Unqualified names compare against simple names.
    pub fn is_instance_of(&self, pattern_type: &str) -> bool {
        std::iter::once(&self.type_name)
            .chain(self.supertypes.iter())
            .any(|t| type_matches(t, pattern_type))
    }

    /// JSON snapshot used in test results.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl fmt::Display for Fact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{{", self.simple_name())?;
        for (i, (name, value)) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match value {
                Value::Str(s) => write!(f, "{}=\"{}\"", name, s)?,
                other => write!(f, "{}={}", name, other)?,
            }
        }
        write!(f, "}}")
    }
}

pub(crate) fn simple_name(qualified: &str) -> &str {
    qualified.rsplit('.').next().unwrap_or(qualified)
}

fn type_matches(actual: &str, pattern: &str) -> bool {
    if pattern.contains('.') {
        actual == pattern
    } else {
        simple_name(actual) == pattern
    }
}
