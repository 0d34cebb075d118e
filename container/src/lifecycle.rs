//! # Rule Container Lifecycle
//!
//! `RuleContainer` owns the production source tree, the rule id → path index
//! and the compiled module, all behind one reader/writer lock.
//!
//! Every mutation follows the same protocol:
//!
//! 1. take the writer lock;
//! 2. stage a copy of the tree and index and apply the change to the copy;
//! 3. compile the staged tree;
//! 4. on success swap tree, index and module in together, on failure drop the
//!    copy and report the diagnostics.
//!
//! Readers (`create_session`, `health_status`, accessors) never observe a
//! tree that does not match the module being served. Sessions hold their own
//! reference to the module they were opened from and outlive rebuilds.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use log::{debug, error, info, warn};
use parking_lot::RwLock;
use rule_engine::{
    diagnostics::render, CompiledModule, RuleCompiler, Session, SessionConfig, SourceTree,
};

use crate::config::ContainerConfig;
use crate::error::{ContainerError, Operation};
use crate::repository::{RepositoryError, RuleRepository};
use crate::types::{ContainerHealthStatus, RuleDefinition, RuleId, SyncReport, ValidationResult};

#[derive(Debug, Default)]
struct ContainerState {
    tree: SourceTree,
    paths: BTreeMap<RuleId, String>,
    module: Option<CompiledModule>,
}

/// Copy of the tree and index that a mutation works on.
struct Staged {
    tree: SourceTree,
    paths: BTreeMap<RuleId, String>,
}

impl Staged {
    fn empty() -> Self {
        Self {
            tree: SourceTree::new(),
            paths: BTreeMap::new(),
        }
    }

    fn of(state: &ContainerState) -> Self {
        Self {
            tree: state.tree.clone(),
            paths: state.paths.clone(),
        }
    }

    fn owner_of(&self, path: &str) -> Option<RuleId> {
        self.paths
            .iter()
            .find(|(_, p)| p.as_str() == path)
            .map(|(id, _)| *id)
    }

    fn remove(&mut self, id: RuleId) -> bool {
        match self.paths.remove(&id) {
            Some(path) => {
                self.tree.delete(&path);
                true
            }
            None => false,
        }
    }

    fn put(&mut self, id: RuleId, path: String, content: &str) {
        self.tree.write(path.clone(), content);
        self.paths.insert(id, path);
    }
}

pub struct RuleContainer {
    repository: Arc<dyn RuleRepository>,
    compiler: RuleCompiler,
    config: ContainerConfig,
    state: RwLock<ContainerState>,
}

impl RuleContainer {
    pub fn new(repository: Arc<dyn RuleRepository>, config: ContainerConfig) -> Self {
        Self {
            repository,
            compiler: RuleCompiler::new(),
            config,
            state: RwLock::new(ContainerState::default()),
        }
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    /// Compiler used for production builds and syntax checks.
    pub fn compiler(&self) -> &RuleCompiler {
        &self.compiler
    }

    // ============================================================================================
    // LIFECYCLE
    // ============================================================================================

    /// Loads every enabled definition and builds the first module.
    pub fn initialize(&self) -> Result<(), ContainerError> {
        let mut state = self.state.write();
        self.initialize_locked(&mut state, Operation::Initialize)
    }

    fn initialize_locked(
        &self,
        state: &mut ContainerState,
        operation: Operation,
    ) -> Result<(), ContainerError> {
        info!("Initializing rule container");
        let definitions = self.repository.list_enabled()?;

        let mut staged = Staged::empty();
        for definition in &definitions {
            if !definition.has_content() {
                warn!("Skipping rule {} ({}): empty content", definition.id, definition.name);
                continue;
            }
            let path = self.config.production_path(&definition.name);
            if let Some(owner) = staged.owner_of(&path) {
                warn!(
                    "Skipping rule {} ({}): path {} already used by rule {}",
                    definition.id, definition.name, path, owner
                );
                continue;
            }
            staged.put(definition.id, path, &definition.content);
        }

        let module = self.build(&staged.tree, operation, None)?;
        self.commit(state, staged, module);
        info!(
            "Rule container initialized with {} rule(s)",
            state.paths.len()
        );
        Ok(())
    }

    /// Drops the current module and state and initializes from scratch.
    pub fn recover(&self) -> Result<(), ContainerError> {
        let mut state = self.state.write();
        warn!("Recovering rule container");
        if let Some(module) = state.module.take() {
            if let Err(e) = module.dispose() {
                warn!("Ignoring error while disposing module during recovery: {}", e);
            }
        }
        state.tree.clear();
        state.paths.clear();
        self.initialize_locked(&mut state, Operation::Recover)
    }

    /// Disposes the module and clears all state.
    pub fn shutdown(&self) {
        let mut state = self.state.write();
        if let Some(module) = state.module.take() {
            if let Err(e) = module.dispose() {
                warn!("Error disposing module on shutdown: {}", e);
            }
        }
        state.tree.clear();
        state.paths.clear();
        info!("Rule container shut down");
    }

    // ============================================================================================
    // SESSIONS
    // ============================================================================================

    pub fn create_session(&self) -> Result<Session, ContainerError> {
        self.create_session_with(SessionConfig::default())
    }

    pub fn create_session_with(&self, config: SessionConfig) -> Result<Session, ContainerError> {
        let state = self.state.read();
        let module = state.module.as_ref().ok_or(ContainerError::NotInitialized)?;
        Ok(module.new_session_with(config)?)
    }

    /// The module currently served.
    pub fn current_module(&self) -> Result<CompiledModule, ContainerError> {
        let state = self.state.read();
        state.module.clone().ok_or(ContainerError::NotInitialized)
    }

    /// The module currently served together with its path → rule id index,
    /// read under one lock.
    pub fn current_module_with_index(
        &self,
    ) -> Result<(CompiledModule, HashMap<String, RuleId>), ContainerError> {
        let state = self.state.read();
        let module = state.module.clone().ok_or(ContainerError::NotInitialized)?;
        let index = state
            .paths
            .iter()
            .map(|(id, path)| (path.clone(), *id))
            .collect();
        Ok((module, index))
    }

    // ============================================================================================
    // MUTATIONS
    // ============================================================================================

    /// Adds a rule to the runtime. A rule that is already loaded is updated.
    pub fn add_rule(&self, definition: &RuleDefinition) -> Result<(), ContainerError> {
        let mut state = self.state.write();
        if state.paths.contains_key(&definition.id) {
            debug!("Rule {} already loaded, updating instead", definition.id);
            return self.update_locked(&mut state, definition);
        }
        self.add_locked(&mut state, definition)
    }

    fn add_locked(
        &self,
        state: &mut ContainerState,
        definition: &RuleDefinition,
    ) -> Result<(), ContainerError> {
        if !definition.has_content() {
            return Err(ContainerError::Validation {
                rule_id: Some(definition.id),
                message: "Rule content must not be empty".to_string(),
                warnings: None,
            });
        }
        let mut staged = Staged::of(state);
        let path = self.config.production_path(&definition.name);
        self.check_path_free(&staged, &path, definition.id, Operation::Add)?;
        staged.put(definition.id, path, &definition.content);

        let module = self.build(&staged.tree, Operation::Add, Some(definition.id))?;
        self.commit(state, staged, module);
        info!("Added rule {} ({})", definition.id, definition.name);
        Ok(())
    }

    /// Replaces a loaded rule's text. The new text is validated before any
    /// state changes; an unloaded rule is added.
    pub fn update_rule(&self, definition: &RuleDefinition) -> Result<(), ContainerError> {
        let mut state = self.state.write();
        self.update_locked(&mut state, definition)
    }

    fn update_locked(
        &self,
        state: &mut ContainerState,
        definition: &RuleDefinition,
    ) -> Result<(), ContainerError> {
        let validation = self.validate_rule_content(&definition.content);
        if !validation.valid {
            return Err(ContainerError::Validation {
                rule_id: Some(definition.id),
                message: validation.error_message.unwrap_or_default(),
                warnings: validation.warning_message,
            });
        }
        if !state.paths.contains_key(&definition.id) {
            debug!("Rule {} not loaded, adding instead", definition.id);
            return self.add_locked(state, definition);
        }

        let mut staged = Staged::of(state);
        staged.remove(definition.id);
        let path = self.config.production_path(&definition.name);
        self.check_path_free(&staged, &path, definition.id, Operation::Update)?;
        staged.put(definition.id, path, &definition.content);

        let module = self.build(&staged.tree, Operation::Update, Some(definition.id))?;
        self.commit(state, staged, module);
        info!("Updated rule {} ({})", definition.id, definition.name);
        Ok(())
    }

    /// Removes a rule from the runtime. Unknown ids are ignored.
    pub fn remove_rule(&self, id: RuleId) -> Result<(), ContainerError> {
        let mut state = self.state.write();
        if !state.paths.contains_key(&id) {
            debug!("Rule {} not loaded, nothing to remove", id);
            return Ok(());
        }
        let mut staged = Staged::of(&state);
        staged.remove(id);

        let module = self.build(&staged.tree, Operation::Remove, Some(id))?;
        self.commit(&mut state, staged, module);
        info!("Removed rule {}", id);
        Ok(())
    }

    /// Enables or disables a rule in storage and applies the change to the
    /// runtime. Storage is reverted when the runtime change fails.
    pub fn set_rule_enabled(&self, id: RuleId, enabled: bool) -> Result<RuleDefinition, ContainerError> {
        let previous = self
            .repository
            .find_by_id(id)?
            .ok_or(RepositoryError::NotFound(id))?;
        let updated = self.repository.set_enabled(id, enabled)?;

        let applied = if enabled {
            self.add_rule(&updated)
        } else {
            self.remove_rule(id)
        };
        if let Err(e) = applied {
            warn!("Reverting status of rule {} after runtime failure: {}", id, e);
            if let Err(revert) = self.repository.set_enabled(id, previous.enabled) {
                error!("Failed to revert status of rule {}: {}", id, revert);
            }
            return Err(e);
        }
        Ok(updated)
    }

    /// Reconciles the runtime with the enabled rules in storage, compiling at
    /// most once.
    pub fn sync_with_persistence(&self) -> Result<SyncReport, ContainerError> {
        let mut state = self.state.write();
        let enabled: BTreeMap<RuleId, RuleDefinition> = self
            .repository
            .list_enabled()?
            .into_iter()
            .map(|d| (d.id, d))
            .collect();

        let mut report = SyncReport::default();
        let mut staged = Staged::of(&state);
        let mut changed = false;

        let stale: Vec<RuleId> = staged
            .paths
            .keys()
            .filter(|id| !enabled.contains_key(*id))
            .copied()
            .collect();
        for id in stale {
            staged.remove(id);
            report.removed.push(id);
            changed = true;
        }

        for (id, definition) in &enabled {
            if !definition.has_content() {
                warn!("Sync skipping rule {} ({}): empty content", id, definition.name);
                report.skipped.push(*id);
                changed |= staged.remove(*id);
                continue;
            }
            let path = self.config.production_path(&definition.name);
            match staged.paths.get(id).cloned() {
                None => {
                    if let Some(owner) = staged.owner_of(&path) {
                        warn!("Sync skipping rule {}: path {} already used by rule {}", id, path, owner);
                        report.skipped.push(*id);
                        continue;
                    }
                    staged.put(*id, path, &definition.content);
                    report.added.push(*id);
                    changed = true;
                }
                Some(current) => {
                    let same_text = staged.tree.read(&current) == Some(definition.content.as_str());
                    if current == path && same_text {
                        continue;
                    }
                    staged.remove(*id);
                    if let Some(owner) = staged.owner_of(&path) {
                        warn!("Sync skipping rule {}: path {} already used by rule {}", id, path, owner);
                        report.skipped.push(*id);
                        changed = true;
                        continue;
                    }
                    staged.put(*id, path, &definition.content);
                    report.refreshed.push(*id);
                    changed = true;
                }
            }
        }

        if !changed && state.module.is_some() {
            report.loaded = state.paths.len();
            debug!("Sync found no changes ({} rule(s) loaded)", report.loaded);
            return Ok(report);
        }

        let module = self.build(&staged.tree, Operation::Sync, None)?;
        self.commit(&mut state, staged, module);
        report.rebuilt = true;
        report.loaded = state.paths.len();
        info!(
            "Sync complete: {} added, {} removed, {} refreshed, {} skipped, {} loaded",
            report.added.len(),
            report.removed.len(),
            report.refreshed.len(),
            report.skipped.len(),
            report.loaded
        );
        Ok(report)
    }

    // ============================================================================================
    // VALIDATION & HEALTH
    // ============================================================================================

    /// Compiles `content` on its own. Production state is never touched.
    pub fn validate_rule_content(&self, content: &str) -> ValidationResult {
        if content.trim().is_empty() {
            return ValidationResult::invalid("Rule content must not be empty", None);
        }
        let mut tree = SourceTree::new();
        tree.write(self.config.validation_path(), content);
        match self.compiler.compile(&tree) {
            Ok(build) => {
                let warnings = (!build.warnings.is_empty())
                    .then(|| render("Rule compilation warnings:", &build.warnings));
                ValidationResult::valid(warnings)
            }
            Err(e) => {
                let warnings = (!e.warnings.is_empty())
                    .then(|| render("Rule compilation warnings:", &e.warnings));
                ValidationResult::invalid(e.report(), warnings)
            }
        }
    }

    pub fn health_status(&self) -> ContainerHealthStatus {
        let state = self.state.read();
        let loaded_rule_ids: Vec<RuleId> = state.paths.keys().copied().collect();
        let (initialized, healthy, status_message) = match &state.module {
            None => (false, false, "Rule container is not initialized".to_string()),
            Some(module) => match module.new_session() {
                Ok(session) => {
                    session.dispose();
                    (true, true, "Rule container is healthy".to_string())
                }
                Err(e) => (true, false, format!("Failed to open a session: {}", e)),
            },
        };
        ContainerHealthStatus {
            initialized,
            healthy,
            status_message,
            loaded_rules_count: loaded_rule_ids.len(),
            loaded_rule_ids,
            release_id: state.module.as_ref().map(|m| m.release_id().to_string()),
            checked_at: Utc::now(),
        }
    }

    // ============================================================================================
    // ACCESSORS
    // ============================================================================================

    pub fn is_initialized(&self) -> bool {
        self.state.read().module.is_some()
    }

    pub fn loaded_rules_count(&self) -> usize {
        self.state.read().paths.len()
    }

    pub fn loaded_rule_ids(&self) -> Vec<RuleId> {
        self.state.read().paths.keys().copied().collect()
    }

    pub fn is_rule_loaded(&self, id: RuleId) -> bool {
        self.state.read().paths.contains_key(&id)
    }

    pub fn loaded_paths(&self) -> Vec<String> {
        self.state.read().tree.paths()
    }

    pub fn rule_path(&self, id: RuleId) -> Option<String> {
        self.state.read().paths.get(&id).cloned()
    }

    pub fn release_id(&self) -> Option<String> {
        self.state
            .read()
            .module
            .as_ref()
            .map(|m| m.release_id().to_string())
    }

    // ============================================================================================
    // INTERNALS
    // ============================================================================================

    fn check_path_free(
        &self,
        staged: &Staged,
        path: &str,
        id: RuleId,
        operation: Operation,
    ) -> Result<(), ContainerError> {
        match staged.owner_of(path) {
            Some(owner) if owner != id => Err(ContainerError::Operation {
                operation,
                rule_id: Some(id),
                reason: format!("path {} is already used by rule {}", path, owner),
            }),
            _ => Ok(()),
        }
    }

    fn build(
        &self,
        tree: &SourceTree,
        operation: Operation,
        rule_id: Option<RuleId>,
    ) -> Result<CompiledModule, ContainerError> {
        match self.compiler.compile(tree) {
            Ok(build) => {
                for warning in &build.warnings {
                    warn!("{}", warning);
                }
                Ok(build.module)
            }
            Err(e) => {
                error!("{} failed: {}", operation, e.report());
                Err(ContainerError::Operation {
                    operation,
                    rule_id,
                    reason: e.report(),
                })
            }
        }
    }

    fn commit(&self, state: &mut ContainerState, staged: Staged, module: CompiledModule) {
        debug!(
            "Swapping in module {} ({} rule(s) from {} source(s))",
            module.release_id(),
            module.rule_count(),
            staged.tree.len()
        );
        state.tree = staged.tree;
        state.paths = staged.paths;
        state.module = Some(module);
    }
}
