//! Working-memory event callbacks.
//!
//! A session notifies its listeners synchronously, in registration order,
//! after each change has been applied.

use crate::compiler::CompiledRule;
use crate::fact::{Fact, FactHandle};

pub struct ObjectInserted<'a> {
    pub handle: FactHandle,
    pub object: &'a Fact,
    /// Rule whose action caused the change, `None` for caller inserts.
    pub rule_name: Option<&'a str>,
}

pub struct ObjectUpdated<'a> {
    pub handle: FactHandle,
    pub old_object: &'a Fact,
    pub object: &'a Fact,
    pub rule_name: Option<&'a str>,
}

pub struct ObjectDeleted<'a> {
    pub handle: FactHandle,
    pub old_object: &'a Fact,
    pub rule_name: Option<&'a str>,
}

/// Emitted after a rule's actions have run.
pub struct MatchFired<'a> {
    pub rule: &'a CompiledRule,
    /// The matched facts as they were when the activation was selected.
    pub objects: &'a [Fact],
}

pub trait WorkingMemoryListener: Send {
    fn object_inserted(&mut self, _event: &ObjectInserted<'_>) {}

    fn object_updated(&mut self, _event: &ObjectUpdated<'_>) {}

    fn object_deleted(&mut self, _event: &ObjectDeleted<'_>) {}

    fn match_fired(&mut self, _event: &MatchFired<'_>) {}
}
