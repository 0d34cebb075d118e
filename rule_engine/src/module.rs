//! Compiled modules.
//!
//! A module is immutable once built. Cloning it is cheap and every clone
//! refers to the same rules; sessions keep their own reference so a module
//! that has been replaced or disposed still serves sessions already opened
//! from it.

use std::cmp::Reverse;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use log::debug;

use crate::compiler::CompiledRule;
use crate::error::SessionError;
use crate::session::{Session, SessionConfig};

#[derive(Debug)]
pub(crate) struct ModuleInner {
    pub(crate) release_id: String,
    pub(crate) rules: Vec<CompiledRule>,
    /// Rule indices sorted by salience (high first), then declaration order.
    pub(crate) agenda: Vec<usize>,
    disposed: AtomicBool,
    live_sessions: AtomicUsize,
}

impl ModuleInner {
    pub(crate) fn session_closed(&self) {
        self.live_sessions.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Debug, Clone)]
pub struct CompiledModule {
    inner: Arc<ModuleInner>,
}

impl CompiledModule {
    pub(crate) fn new(release_id: String, rules: Vec<CompiledRule>) -> Self {
        let mut agenda: Vec<usize> = (0..rules.len()).collect();
        agenda.sort_by_key(|&i| (Reverse(rules[i].salience), rules[i].order));
        Self {
            inner: Arc::new(ModuleInner {
                release_id,
                rules,
                agenda,
                disposed: AtomicBool::new(false),
                live_sessions: AtomicUsize::new(0),
            }),
        }
    }

    /// Opens a session with default settings.
    pub fn new_session(&self) -> Result<Session, SessionError> {
        self.new_session_with(SessionConfig::default())
    }

    pub fn new_session_with(&self, config: SessionConfig) -> Result<Session, SessionError> {
        if self.is_disposed() {
            return Err(SessionError::ModuleDisposed(self.inner.release_id.clone()));
        }
        self.inner.live_sessions.fetch_add(1, Ordering::AcqRel);
        Ok(Session::new(Arc::clone(&self.inner), config))
    }

    /// Stops the module from opening new sessions. Sessions already open are
    /// unaffected and release their own resources when disposed.
    pub fn dispose(&self) -> Result<(), SessionError> {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return Err(SessionError::AlreadyDisposed(self.inner.release_id.clone()));
        }
        debug!(
            "Disposed module {} ({} live session(s))",
            self.inner.release_id,
            self.active_sessions()
        );
        Ok(())
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Sessions opened from this module that have not been disposed yet.
    pub fn active_sessions(&self) -> usize {
        self.inner.live_sessions.load(Ordering::Acquire)
    }

    pub fn rule_count(&self) -> usize {
        self.inner.rules.len()
    }

    /// Rules in declaration order.
    pub fn rules(&self) -> &[CompiledRule] {
        &self.inner.rules
    }

    pub fn release_id(&self) -> &str {
        &self.inner.release_id
    }
}

#[cfg(test)]
mod tests {
    use crate::compiler::RuleCompiler;
    use crate::error::SessionError;
    use crate::source_tree::SourceTree;

    fn module(src: &str) -> super::CompiledModule {
        let mut tree = SourceTree::new();
        tree.write("rules/a.rule", src);
        RuleCompiler::new().compile(&tree).unwrap().module
    }

    #[test]
    fn test_agenda_orders_by_salience_then_declaration() {
        let m = module(
            "rule low when T() then end
             rule high salience 5 when T() then end
             rule low2 when T() then end",
        );
        let names: Vec<_> = m.inner.agenda.iter().map(|&i| m.rules()[i].name()).collect();
        assert_eq!(names, vec!["high", "low", "low2"]);
    }

    #[test]
    fn test_session_counter_tracks_disposal() {
        let m = module("rule r when T() then end");
        let s1 = m.new_session().unwrap();
        let s2 = m.new_session().unwrap();
        assert_eq!(m.active_sessions(), 2);
        s1.dispose();
        drop(s2);
        assert_eq!(m.active_sessions(), 0);
    }

    #[test]
    fn test_disposed_module_rejects_new_sessions() {
        let m = module("rule r when T() then end");
        let open = m.new_session().unwrap();
        m.dispose().unwrap();
        assert!(matches!(m.new_session(), Err(SessionError::ModuleDisposed(_))));
        assert!(matches!(m.dispose(), Err(SessionError::AlreadyDisposed(_))));
        // already-open sessions still work
        assert_eq!(open.fact_count(), 0);
    }
}
