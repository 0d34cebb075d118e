//! Evaluation sessions.
//!
//! A session owns a working memory of facts and runs a naive forward-chaining
//! cycle over the rules of the module it was opened from:
//!
//! 1. find the first activation in agenda order (salience, then declaration
//!    order) that has not fired yet;
//! 2. execute its actions, which may change working memory;
//! 3. repeat until no activation is left.
//!
//! An activation is a rule together with one tuple of distinct facts matching
//! its positive patterns, with none of its negated patterns matching. A rule
//! fires at most once per tuple of fact versions, so modifying a matched fact
//! makes the rule eligible again. `no-loop` rules ignore versions and fire at
//! most once per tuple of facts.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, trace};
use uuid::Uuid;

use crate::ast::{Action, Assignment, Pattern};
use crate::compiler::CompiledRule;
use crate::error::SessionError;
use crate::eval;
use crate::fact::{Fact, FactHandle};
use crate::listener::{MatchFired, ObjectDeleted, ObjectInserted, ObjectUpdated, WorkingMemoryListener};
use crate::module::ModuleInner;
use crate::value::Value;

/// Shared flag used to stop a running cycle from another thread.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// Upper bound on firings per `fire_all_rules` call.
    pub max_fires: Option<usize>,
    /// Checked before every firing and while matching.
    pub cancellation: Option<CancellationFlag>,
}

struct Entry {
    fact: Fact,
    version: u64,
}

type Bindings<'r> = Vec<(Option<&'r str>, FactHandle)>;
type ActivationKey = (usize, Vec<(FactHandle, u64)>);

/// Why a match search stopped without a result.
enum Halt {
    Eval(String),
    Cancelled,
}

impl From<String> for Halt {
    fn from(message: String) -> Self {
        Halt::Eval(message)
    }
}

struct Activation {
    rule: usize,
    handles: Vec<FactHandle>,
    key: ActivationKey,
}

pub struct Session {
    id: Uuid,
    module: Arc<ModuleInner>,
    facts: BTreeMap<FactHandle, Entry>,
    next_handle: u64,
    clock: u64,
    refracted: HashSet<ActivationKey>,
    listeners: Vec<Box<dyn WorkingMemoryListener>>,
    config: SessionConfig,
}

impl Session {
    pub(crate) fn new(module: Arc<ModuleInner>, config: SessionConfig) -> Self {
        let session = Self {
            id: Uuid::new_v4(),
            module,
            facts: BTreeMap::new(),
            next_handle: 0,
            clock: 0,
            refracted: HashSet::new(),
            listeners: Vec::new(),
            config,
        };
        trace!("Opened session {} on module {}", session.id, session.module.release_id);
        session
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Release id of the module this session was opened from.
    pub fn release_id(&self) -> &str {
        &self.module.release_id
    }

    pub fn add_listener(&mut self, listener: Box<dyn WorkingMemoryListener>) {
        self.listeners.push(listener);
    }

    pub fn insert(&mut self, fact: Fact) -> FactHandle {
        self.insert_from(fact, None)
    }

    pub fn get(&self, handle: FactHandle) -> Option<&Fact> {
        self.facts.get(&handle).map(|e| &e.fact)
    }

    /// Facts in working memory, in insertion order.
    pub fn objects(&self) -> impl Iterator<Item = (FactHandle, &Fact)> {
        self.facts.iter().map(|(h, e)| (*h, &e.fact))
    }

    pub fn fact_count(&self) -> usize {
        self.facts.len()
    }

    /// Runs the match/fire cycle to quiescence. Returns the number of rules
    /// fired by this call.
    pub fn fire_all_rules(&mut self) -> Result<usize, SessionError> {
        let module = Arc::clone(&self.module);
        let mut fired = 0;
        loop {
            if self.is_cancelled() {
                debug!("Session {} cancelled after {} firing(s)", self.id, fired);
                return Err(SessionError::Cancelled { fired });
            }
            let Some(activation) = self.next_activation(&module, fired)? else {
                break;
            };
            if let Some(limit) = self.config.max_fires {
                if fired >= limit {
                    return Err(SessionError::FiringLimitExceeded { limit });
                }
            }

            let rule = &module.rules[activation.rule];
            self.refracted.insert(activation.key);
            let matched: Vec<Fact> = activation
                .handles
                .iter()
                .filter_map(|h| self.facts.get(h).map(|e| e.fact.clone()))
                .collect();
            trace!("Firing {} on {} fact(s)", rule.qualified_name(), matched.len());

            self.execute(rule, &activation.handles)?;
            fired += 1;
            for listener in &mut self.listeners {
                listener.match_fired(&MatchFired {
                    rule,
                    objects: &matched,
                });
            }
        }
        debug!("Session {} fired {} rule(s)", self.id, fired);
        Ok(fired)
    }

    /// Releases the session.
    pub fn dispose(self) {
        trace!("Disposing session {}", self.id);
    }

    fn is_cancelled(&self) -> bool {
        self.config
            .cancellation
            .as_ref()
            .map_or(false, CancellationFlag::is_cancelled)
    }

    // ------------------------------------------------------------------
    // Matching
    // ------------------------------------------------------------------

    fn next_activation(
        &self,
        module: &ModuleInner,
        fired: usize,
    ) -> Result<Option<Activation>, SessionError> {
        for &idx in &module.agenda {
            let rule = &module.rules[idx];
            let mut bound = Vec::new();
            let found = self.search(idx, rule, 0, &mut bound).map_err(|halt| match halt {
                Halt::Eval(message) => action_error(rule, message),
                Halt::Cancelled => {
                    debug!("Session {} cancelled during matching", self.id);
                    SessionError::Cancelled { fired }
                }
            })?;
            if let Some(handles) = found {
                let key = self.key(idx, rule, &handles);
                return Ok(Some(Activation {
                    rule: idx,
                    handles,
                    key,
                }));
            }
        }
        Ok(None)
    }

    fn search<'r>(
        &self,
        idx: usize,
        rule: &'r CompiledRule,
        depth: usize,
        bound: &mut Bindings<'r>,
    ) -> Result<Option<Vec<FactHandle>>, Halt> {
        let Some(pattern) = rule.patterns.get(depth) else {
            let handles: Vec<FactHandle> = bound.iter().map(|(_, h)| *h).collect();
            if self.refracted.contains(&self.key(idx, rule, &handles)) {
                return Ok(None);
            }
            return Ok(Some(handles));
        };

        if pattern.negated {
            for (handle, entry) in &self.facts {
                if self.is_cancelled() {
                    return Err(Halt::Cancelled);
                }
                if bound.iter().any(|(_, h)| h == handle) {
                    continue;
                }
                if self.matches(pattern, &entry.fact, bound)? {
                    return Ok(None);
                }
            }
            return self.search(idx, rule, depth + 1, bound);
        }

        for (handle, entry) in &self.facts {
            if self.is_cancelled() {
                return Err(Halt::Cancelled);
            }
            if bound.iter().any(|(_, h)| h == handle) {
                continue;
            }
            if !self.matches(pattern, &entry.fact, bound)? {
                continue;
            }
            bound.push((pattern.binding.as_deref(), *handle));
            let found = self.search(idx, rule, depth + 1, bound)?;
            bound.pop();
            if found.is_some() {
                return Ok(found);
            }
        }
        Ok(None)
    }

    fn matches<'s>(
        &'s self,
        pattern: &Pattern,
        fact: &'s Fact,
        bound: &[(Option<&str>, FactHandle)],
    ) -> Result<bool, String> {
        if !fact.is_instance_of(&pattern.type_name) {
            return Ok(false);
        }
        let resolve = |name: &str| self.lookup(bound, name);
        for constraint in &pattern.constraints {
            if !eval::satisfies(constraint, fact, &resolve)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn lookup(&self, bound: &[(Option<&str>, FactHandle)], name: &str) -> Option<&Fact> {
        bound
            .iter()
            .find(|(binding, _)| *binding == Some(name))
            .and_then(|(_, handle)| self.facts.get(handle))
            .map(|e| &e.fact)
    }

    fn key(&self, idx: usize, rule: &CompiledRule, handles: &[FactHandle]) -> ActivationKey {
        let tuple = handles
            .iter()
            .map(|h| {
                let version = if rule.no_loop {
                    0
                } else {
                    self.facts.get(h).map_or(0, |e| e.version)
                };
                (*h, version)
            })
            .collect();
        (idx, tuple)
    }

    // ------------------------------------------------------------------
    // Actions
    // ------------------------------------------------------------------

    fn execute(&mut self, rule: &CompiledRule, handles: &[FactHandle]) -> Result<(), SessionError> {
        let bindings: Bindings<'_> = rule
            .patterns
            .iter()
            .filter(|p| !p.negated)
            .map(|p| p.binding.as_deref())
            .zip(handles.iter().copied())
            .collect();

        for action in &rule.actions {
            match action {
                Action::Modify {
                    binding,
                    assignments,
                    ..
                } => {
                    let handle = self.live_handle(&bindings, binding, rule)?;
                    let values = self
                        .evaluate(assignments, &bindings)
                        .map_err(|m| action_error(rule, m))?;
                    self.modify(handle, values, &rule.name);
                }
                Action::Insert {
                    type_name,
                    assignments,
                    ..
                } => {
                    let values = self
                        .evaluate(assignments, &bindings)
                        .map_err(|m| action_error(rule, m))?;
                    let mut fact = Fact::new(type_name.clone());
                    for (field, value) in values {
                        fact.set(field, value);
                    }
                    self.insert_from(fact, Some(&rule.name));
                }
                Action::Delete { binding, .. } => {
                    let handle = self.live_handle(&bindings, binding, rule)?;
                    self.remove(handle, Some(&rule.name));
                }
            }
        }
        Ok(())
    }

    fn live_handle(
        &self,
        bindings: &[(Option<&str>, FactHandle)],
        binding: &str,
        rule: &CompiledRule,
    ) -> Result<FactHandle, SessionError> {
        bindings
            .iter()
            .find(|(b, _)| *b == Some(binding))
            .map(|(_, h)| *h)
            .filter(|h| self.facts.contains_key(h))
            .ok_or_else(|| {
                action_error(rule, format!("${} is no longer in working memory", binding))
            })
    }

    fn evaluate(
        &self,
        assignments: &[Assignment],
        bindings: &[(Option<&str>, FactHandle)],
    ) -> Result<Vec<(String, Value)>, String> {
        let resolve = |name: &str| self.lookup(bindings, name);
        assignments
            .iter()
            .map(|a| Ok((a.field.clone(), eval::eval(&a.value, None, &resolve)?)))
            .collect()
    }

    fn insert_from(&mut self, fact: Fact, rule_name: Option<&str>) -> FactHandle {
        self.next_handle += 1;
        self.clock += 1;
        let handle = FactHandle(self.next_handle);
        let entry = self.facts.entry(handle).or_insert(Entry {
            fact,
            version: self.clock,
        });
        for listener in &mut self.listeners {
            listener.object_inserted(&ObjectInserted {
                handle,
                object: &entry.fact,
                rule_name,
            });
        }
        handle
    }

    fn modify(&mut self, handle: FactHandle, values: Vec<(String, Value)>, rule_name: &str) {
        self.clock += 1;
        let Some(entry) = self.facts.get_mut(&handle) else {
            return;
        };
        let old = entry.fact.clone();
        for (field, value) in values {
            entry.fact.set(field, value);
        }
        entry.version = self.clock;
        for listener in &mut self.listeners {
            listener.object_updated(&ObjectUpdated {
                handle,
                old_object: &old,
                object: &entry.fact,
                rule_name: Some(rule_name),
            });
        }
    }

    fn remove(&mut self, handle: FactHandle, rule_name: Option<&str>) -> Option<Fact> {
        let entry = self.facts.remove(&handle)?;
        for listener in &mut self.listeners {
            listener.object_deleted(&ObjectDeleted {
                handle,
                old_object: &entry.fact,
                rule_name,
            });
        }
        Some(entry.fact)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.module.session_closed();
    }
}

fn action_error(rule: &CompiledRule, message: String) -> SessionError {
    SessionError::Action {
        rule: rule.qualified_name(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::compiler::RuleCompiler;
    use crate::module::CompiledModule;
    use crate::source_tree::SourceTree;

    fn module(src: &str) -> CompiledModule {
        let mut tree = SourceTree::new();
        tree.write("rules/test.rule", src);
        RuleCompiler::new().compile(&tree).unwrap().module
    }

    fn order(price: f64) -> Fact {
        Fact::new("com.example.Order")
            .with_field("originalPrice", price)
            .with_field("price", price)
    }

    #[derive(Default)]
    struct Recorder(Arc<Mutex<Vec<String>>>);

    impl WorkingMemoryListener for Recorder {
        fn object_inserted(&mut self, event: &ObjectInserted<'_>) {
            self.0.lock().unwrap().push(format!("insert {}", event.object.simple_name()));
        }

        fn object_updated(&mut self, event: &ObjectUpdated<'_>) {
            self.0.lock().unwrap().push(format!("update {}", event.object.simple_name()));
        }

        fn object_deleted(&mut self, event: &ObjectDeleted<'_>) {
            self.0.lock().unwrap().push(format!("delete {}", event.old_object.simple_name()));
        }

        fn match_fired(&mut self, event: &MatchFired<'_>) {
            self.0.lock().unwrap().push(format!("fired {}", event.rule.name()));
        }
    }

    #[test]
    fn test_half_price_rule() {
        let m = module(
            r#"rule "half" no-loop
               when $o : Order( originalPrice > 5 )
               then modify($o) { price = $o.originalPrice * 0.5 } end"#,
        );
        let mut session = m.new_session().unwrap();
        let cheap = session.insert(order(4.0));
        let pricey = session.insert(order(10.0));
        assert_eq!(session.fire_all_rules().unwrap(), 1);
        assert_eq!(session.get(pricey).unwrap().get("price"), Some(&Value::Float(5.0)));
        assert_eq!(session.get(cheap).unwrap().get("price"), Some(&Value::Float(4.0)));
    }

    #[test]
    fn test_modify_reactivates_until_condition_fails() {
        let m = module("rule inc when $c : Counter( n < 3 ) then modify($c) { n = $c.n + 1 } end");
        let mut session = m.new_session().unwrap();
        let c = session.insert(Fact::new("Counter").with_field("n", 0i64));
        assert_eq!(session.fire_all_rules().unwrap(), 3);
        assert_eq!(session.get(c).unwrap().get("n"), Some(&Value::Int(3)));
    }

    #[test]
    fn test_firing_limit_stops_runaway_rules() {
        let m = module("rule inc when $c : Counter() then modify($c) { n = $c.n + 1 } end");
        let mut session = m
            .new_session_with(SessionConfig {
                max_fires: Some(10),
                cancellation: None,
            })
            .unwrap();
        session.insert(Fact::new("Counter").with_field("n", 0i64));
        assert_eq!(
            session.fire_all_rules(),
            Err(SessionError::FiringLimitExceeded { limit: 10 })
        );
    }

    #[test]
    fn test_cancelled_session_does_not_fire() {
        let flag = CancellationFlag::new();
        let m = module("rule r when Order() then end");
        let mut session = m
            .new_session_with(SessionConfig {
                max_fires: None,
                cancellation: Some(flag.clone()),
            })
            .unwrap();
        session.insert(order(1.0));
        flag.cancel();
        assert_eq!(session.fire_all_rules(), Err(SessionError::Cancelled { fired: 0 }));
    }

    #[test]
    fn test_cancel_interrupts_matching() {
        let flag = CancellationFlag::new();
        let m = module("rule join when T() T() T() T( v < 0 ) then end");
        let mut session = m
            .new_session_with(SessionConfig {
                max_fires: None,
                cancellation: Some(flag.clone()),
            })
            .unwrap();
        for v in 0..120i64 {
            session.insert(Fact::new("T").with_field("v", v));
        }

        let canceller = {
            let flag = flag.clone();
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(50));
                flag.cancel();
            })
        };
        let started = std::time::Instant::now();
        let result = session.fire_all_rules();
        canceller.join().unwrap();

        assert_eq!(result, Err(SessionError::Cancelled { fired: 0 }));
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
    }

    #[test]
    fn test_join_and_negation() {
        let m = module(
            r#"rule "alert big customer orders"
               when
                   $c : Customer( vip == true )
                   $o : Order( customerId == $c.id )
                   not Alert( orderId == $o.id )
               then
                   insert(new Alert( orderId = $o.id, customer = $c.name ));
               end"#,
        );
        let mut session = m.new_session().unwrap();
        session.insert(
            Fact::new("Customer")
                .with_field("id", 1i64)
                .with_field("name", "ann")
                .with_field("vip", true),
        );
        session.insert(Fact::new("Customer").with_field("id", 2i64).with_field("vip", false));
        session.insert(Fact::new("Order").with_field("id", 10i64).with_field("customerId", 1i64));
        session.insert(Fact::new("Order").with_field("id", 11i64).with_field("customerId", 2i64));
        assert_eq!(session.fire_all_rules().unwrap(), 1);
        let alerts: Vec<_> = session
            .objects()
            .filter(|(_, f)| f.type_name() == "Alert")
            .map(|(_, f)| f.clone())
            .collect();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].get("customer"), Some(&Value::from("ann")));
    }

    #[test]
    fn test_salience_decides_firing_order() {
        let m = module(
            r#"rule first salience 10 when $o : Order() then delete($o) end
               rule second when $o : Order() then modify($o) { price = 0 } end"#,
        );
        let mut session = m.new_session().unwrap();
        session.insert(order(3.0));
        assert_eq!(session.fire_all_rules().unwrap(), 1);
        assert_eq!(session.fact_count(), 0);
    }

    #[test]
    fn test_listener_sees_every_change() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let m = module(
            r#"rule r no-loop when $o : Order() then
                 modify($o) { seen = true };
                 insert(new Audit( price = $o.price ));
                 delete($o);
               end"#,
        );
        let mut session = m.new_session().unwrap();
        session.add_listener(Box::new(Recorder(Arc::clone(&log))));
        session.insert(order(2.0));
        session.fire_all_rules().unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "insert Order",
                "update Order",
                "insert Audit",
                "delete Order",
                "fired r",
            ]
        );
    }

    #[test]
    fn test_action_error_names_the_rule() {
        let m = module("package p; rule r no-loop when $o : Order() then modify($o) { price = $o.price / 0 } end");
        let mut session = m.new_session().unwrap();
        session.insert(Fact::new("Order").with_field("price", 4i64));
        match session.fire_all_rules() {
            Err(SessionError::Action { rule, .. }) => assert_eq!(rule, "p.r"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_rule_without_conditions_fires_once() {
        let m = module("rule boot when then insert(new Started()) end");
        let mut session = m.new_session().unwrap();
        assert_eq!(session.fire_all_rules().unwrap(), 1);
        assert_eq!(session.fire_all_rules().unwrap(), 0);
        assert_eq!(session.fact_count(), 1);
    }
}
