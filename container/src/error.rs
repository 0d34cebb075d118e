use std::fmt;

use rule_engine::SessionError;
use thiserror::Error;

use crate::repository::RepositoryError;
use crate::types::RuleId;

/// Container mutation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Initialize,
    Add,
    Update,
    Remove,
    Sync,
    Recover,
    ToggleStatus,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Initialize => "initialize",
            Operation::Add => "add rule",
            Operation::Update => "update rule",
            Operation::Remove => "remove rule",
            Operation::Sync => "sync",
            Operation::Recover => "recover",
            Operation::ToggleStatus => "toggle rule status",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum ContainerError {
    /// Rule text rejected before any production state was touched.
    #[error("rule validation failed{}: {message}", for_rule(.rule_id))]
    Validation {
        rule_id: Option<RuleId>,
        message: String,
        warnings: Option<String>,
    },

    /// A rebuild or bookkeeping step failed; production state is unchanged.
    #[error("{operation} failed{}: {reason}", for_rule(.rule_id))]
    Operation {
        operation: Operation,
        rule_id: Option<RuleId>,
        reason: String,
    },

    #[error("rule container is not initialized")]
    NotInitialized,

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

fn for_rule(rule_id: &Option<RuleId>) -> String {
    match rule_id {
        Some(id) => format!(" for rule {}", id),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_rule() {
        let err = ContainerError::Operation {
            operation: Operation::Add,
            rule_id: Some(RuleId(4)),
            reason: "boom".to_string(),
        };
        assert_eq!(err.to_string(), "add rule failed for rule 4: boom");

        let err = ContainerError::Validation {
            rule_id: None,
            message: "empty".to_string(),
            warnings: None,
        };
        assert_eq!(err.to_string(), "rule validation failed: empty");
    }
}
