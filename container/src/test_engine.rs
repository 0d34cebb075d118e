//! # Test Execution Engine
//!
//! Runs ad-hoc tests of stored rules against synthesized facts:
//!
//! ```text
//! request ─► resolve rule ids ─► [blocking worker] build ephemeral module
//!                                                  open session + tracker
//!                                                  insert facts, fire once
//!                                                  snapshot working memory
//!                                                  dispose session
//! ```
//!
//! The caller waits on the worker with a real deadline. On expiry the
//! session's cancellation flag is raised and a `Timeout` result is returned
//! at once; the worker stops at its next match step and still disposes its
//! session on the way out.
//!
//! Test failures never surface as `Err`: every path produces a `TestResult`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{debug, info, warn};
use parking_lot::Mutex;
use rule_engine::{
    CancellationFlag, CompiledModule, MatchFired, ObjectDeleted, ObjectInserted, ObjectUpdated,
    Session, SessionConfig, SessionError, WorkingMemoryListener,
};
use uuid::Uuid;

use crate::config::TestConfig;
use crate::ephemeral::{EphemeralContainerBuilder, RuleAttribution};
use crate::fact_builder::FactTypeRegistry;
use crate::lifecycle::RuleContainer;
use crate::repository::RuleRepository;
use crate::types::{
    FiredRuleInfo, RuleDefinition, RuleFactConfig, TestFailureKind, TestResult, TestRuleRequest,
};

// ================================================================================================
// TRACKING LISTENER
// ================================================================================================

#[derive(Debug, Default)]
struct TrackerLog {
    lines: Vec<String>,
    fired: Vec<FiredRuleInfo>,
}

/// Records fired rules and, in verbose mode, a timestamped line per
/// working-memory change.
#[derive(Clone)]
struct ExecutionTracker {
    verbose: bool,
    attribution: Arc<HashMap<String, RuleAttribution>>,
    log: Arc<Mutex<TrackerLog>>,
}

impl ExecutionTracker {
    fn new(verbose: bool, attribution: Arc<HashMap<String, RuleAttribution>>) -> Self {
        Self {
            verbose,
            attribution,
            log: Arc::new(Mutex::new(TrackerLog::default())),
        }
    }

    fn line(&self, text: String) {
        if self.verbose {
            let stamp = Utc::now().format("%H:%M:%S%.3f");
            self.log.lock().lines.push(format!("[{}] {}", stamp, text));
        }
    }

    fn take(&self) -> TrackerLog {
        std::mem::take(&mut *self.log.lock())
    }
}

fn by_rule(rule_name: Option<&str>) -> String {
    rule_name.map(|r| format!(" by rule \"{}\"", r)).unwrap_or_default()
}

impl WorkingMemoryListener for ExecutionTracker {
    fn object_inserted(&mut self, event: &ObjectInserted<'_>) {
        self.line(format!(
            "Inserted {} {}{}",
            event.handle,
            event.object,
            by_rule(event.rule_name)
        ));
    }

    fn object_updated(&mut self, event: &ObjectUpdated<'_>) {
        self.line(format!(
            "Updated {} {} -> {}{}",
            event.handle,
            event.old_object,
            event.object,
            by_rule(event.rule_name)
        ));
    }

    fn object_deleted(&mut self, event: &ObjectDeleted<'_>) {
        self.line(format!(
            "Deleted {} {}{}",
            event.handle,
            event.old_object,
            by_rule(event.rule_name)
        ));
    }

    fn match_fired(&mut self, event: &MatchFired<'_>) {
        let attribution = self.attribution.get(event.rule.source_path());
        let info = FiredRuleInfo {
            rule_name: event.rule.name().to_string(),
            rule_package: event.rule.package().to_string(),
            rule_id: attribution.map(|a| a.rule_id),
            description: attribution.and_then(|a| a.description.clone()),
            fired_at: Utc::now(),
            matched_objects: event.objects.iter().map(|f| f.to_json()).collect(),
        };
        self.line(format!("Fired rule \"{}\"", event.rule.qualified_name()));
        self.log.lock().fired.push(info);
    }
}

// ================================================================================================
// SESSION RUN
// ================================================================================================

struct RunFailure {
    kind: TestFailureKind,
    message: String,
    trace: Option<String>,
}

impl RunFailure {
    fn new(kind: TestFailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            trace: None,
        }
    }

    fn with_trace(mut self, trace: String) -> Self {
        self.trace = Some(trace);
        self
    }
}

impl From<SessionError> for RunFailure {
    fn from(e: SessionError) -> Self {
        let kind = match e {
            SessionError::Cancelled { .. } => TestFailureKind::Timeout,
            _ => TestFailureKind::Runtime,
        };
        RunFailure::new(kind, format!("Rule execution failed: {}", e)).with_trace(format!("{:?}", e))
    }
}

/// Everything one session run needs. Moved onto the blocking pool.
struct SessionRun {
    registry: Arc<FactTypeRegistry>,
    configs: Vec<RuleFactConfig>,
    verbose: bool,
    max_fires: Option<usize>,
    cancellation: CancellationFlag,
}

impl SessionRun {
    /// Opens a session on `module`, drives it and always disposes it.
    /// `notes` open the verbose log.
    fn execute(
        self,
        module: &CompiledModule,
        attribution: Arc<HashMap<String, RuleAttribution>>,
        notes: Vec<String>,
        started: Instant,
    ) -> TestResult {
        let tracker = ExecutionTracker::new(self.verbose, attribution);
        for note in notes {
            tracker.line(note);
        }
        let mut session = match module.new_session_with(SessionConfig {
            max_fires: self.max_fires,
            cancellation: Some(self.cancellation.clone()),
        }) {
            Ok(session) => session,
            Err(e) => return finish(Err(RunFailure::from(e)), tracker.take(), started, self.verbose),
        };
        session.add_listener(Box::new(tracker.clone()));

        let outcome = self.drive(&mut session);
        session.dispose();
        finish(outcome, tracker.take(), started, self.verbose)
    }

    fn drive(&self, session: &mut Session) -> Result<(usize, BTreeMap<String, serde_json::Value>), RunFailure> {
        if self.configs.is_empty() {
            return Err(RunFailure::new(
                TestFailureKind::NoFacts,
                "No fact configurations supplied",
            ));
        }
        for config in &self.configs {
            let fact = self
                .registry
                .create_instance(&config.class_name, &config.field_values)
                .map_err(|e| {
                    RunFailure::new(
                        TestFailureKind::Construction,
                        format!("Failed to create fact '{}': {}", config.fact_name, e),
                    )
                    .with_trace(format!("{:?}", e))
                })?;
            session.insert(fact);
        }

        let cycle = Instant::now();
        let fired = session.fire_all_rules()?;
        debug!(
            "Session {} fired {} rule(s) in {} ms",
            session.id(),
            fired,
            cycle.elapsed().as_millis()
        );

        let snapshot = session
            .objects()
            .enumerate()
            .map(|(i, (_, fact))| (format!("object_{}", i), fact.to_json()))
            .collect();
        Ok((fired, snapshot))
    }
}

fn finish(
    outcome: Result<(usize, BTreeMap<String, serde_json::Value>), RunFailure>,
    log: TrackerLog,
    started: Instant,
    verbose: bool,
) -> TestResult {
    let details = (verbose && !log.lines.is_empty()).then(|| log.lines.join("\n"));
    let mut result = match outcome {
        Ok((fired, result_data)) => TestResult {
            success: true,
            execution_time_ms: 0,
            fired_rules_count: fired,
            fired_rules: log.fired,
            result_data,
            error_message: None,
            stack_trace: None,
            execution_details: None,
            failure_kind: None,
            test_time: Utc::now(),
        },
        Err(failure) => {
            let mut result = TestResult::failure(failure.kind, failure.message);
            result.stack_trace = failure.trace;
            result.fired_rules_count = log.fired.len();
            result.fired_rules = log.fired;
            result
        }
    };
    result.execution_details = details;
    result.execution_time_ms = elapsed_ms(started);
    result
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

// ================================================================================================
// ENGINE
// ================================================================================================

pub struct TestExecutionEngine {
    repository: Arc<dyn RuleRepository>,
    registry: Arc<FactTypeRegistry>,
    builder: Arc<EphemeralContainerBuilder>,
    config: TestConfig,
}

impl TestExecutionEngine {
    pub fn new(
        repository: Arc<dyn RuleRepository>,
        registry: Arc<FactTypeRegistry>,
        builder: EphemeralContainerBuilder,
        config: TestConfig,
    ) -> Self {
        Self {
            repository,
            registry,
            builder: Arc::new(builder),
            config,
        }
    }

    pub fn builder(&self) -> &EphemeralContainerBuilder {
        &self.builder
    }

    /// Tests the requested rules in a disposable module.
    pub async fn execute_test(&self, request: TestRuleRequest) -> TestResult {
        let invocation = Uuid::new_v4();
        let started = Instant::now();
        info!(
            "Test {} started for rule(s) {:?} with {} fact(s)",
            invocation,
            request.rule_ids,
            request.rule_configs.len()
        );

        if request.rule_ids.is_empty() {
            return TestResult::failure(TestFailureKind::InvalidRequest, "At least one rule id is required");
        }
        let timeout_ms = request
            .max_execution_time_ms
            .unwrap_or(self.config.default_timeout_ms);
        if timeout_ms == 0 {
            return TestResult::failure(
                TestFailureKind::InvalidRequest,
                "maxExecutionTimeMs must be positive",
            );
        }

        let definitions = match self.resolve(&request) {
            Ok(definitions) => definitions,
            Err(result) => return result,
        };
        if definitions.is_empty() {
            warn!("Test {}: none of the requested rules are available", invocation);
            return TestResult::failure(
                TestFailureKind::NoValidRules,
                "No valid rules found for the requested ids",
            );
        }

        let cancellation = CancellationFlag::new();
        let run = SessionRun {
            registry: Arc::clone(&self.registry),
            configs: request.rule_configs,
            verbose: request.verbose,
            max_fires: self.config.max_fires,
            cancellation: cancellation.clone(),
        };
        let builder = Arc::clone(&self.builder);
        let job = move || {
            let ephemeral = match builder.build(&definitions) {
                Ok(ephemeral) => ephemeral,
                Err(e) => {
                    let mut result = TestResult::failure(
                        TestFailureKind::Compilation,
                        format!("Rule compilation failed: {}", e.report()),
                    );
                    result.execution_time_ms = elapsed_ms(started);
                    return result;
                }
            };
            let attribution = Arc::new(ephemeral.attribution().clone());
            let notes = ephemeral
                .warnings()
                .iter()
                .map(|w| format!("Compilation warning: {}", w))
                .collect();
            let result = run.execute(ephemeral.module(), attribution, notes, started);
            ephemeral.dispose();
            result
        };

        let result = self
            .await_with_deadline(job, cancellation, Duration::from_millis(timeout_ms), started)
            .await;
        info!(
            "Test {} finished: success={}, fired={}, {} ms",
            invocation, result.success, result.fired_rules_count, result.execution_time_ms
        );
        result
    }

    /// Runs facts against the module the production container is serving.
    pub async fn execute_on_production(
        &self,
        container: &RuleContainer,
        configs: Vec<RuleFactConfig>,
        verbose: bool,
        timeout: Option<Duration>,
    ) -> TestResult {
        let started = Instant::now();
        let (module, index) = match container.current_module_with_index() {
            Ok(current) => current,
            Err(e) => return TestResult::failure(TestFailureKind::Runtime, e.to_string()),
        };
        let attribution: HashMap<String, RuleAttribution> = index
            .into_iter()
            .map(|(path, rule_id)| {
                (
                    path,
                    RuleAttribution {
                        rule_id,
                        description: None,
                    },
                )
            })
            .collect();

        let cancellation = CancellationFlag::new();
        let run = SessionRun {
            registry: Arc::clone(&self.registry),
            configs,
            verbose,
            max_fires: self.config.max_fires,
            cancellation: cancellation.clone(),
        };
        let job = move || run.execute(&module, Arc::new(attribution), Vec::new(), started);
        let deadline = timeout.unwrap_or(Duration::from_millis(self.config.default_timeout_ms));
        self.await_with_deadline(job, cancellation, deadline, started)
            .await
    }

    /// Looks up each requested id, skipping missing and disabled rules.
    fn resolve(&self, request: &TestRuleRequest) -> Result<Vec<RuleDefinition>, TestResult> {
        let mut definitions = Vec::new();
        for id in &request.rule_ids {
            match self.repository.find_by_id(*id) {
                Ok(Some(definition)) if definition.enabled => definitions.push(definition),
                Ok(Some(_)) => warn!("Rule {} is disabled, skipping", id),
                Ok(None) => warn!("Rule {} not found, skipping", id),
                Err(e) => {
                    let mut result = TestResult::failure(
                        TestFailureKind::Internal,
                        format!("Failed to load rule {}: {}", id, e),
                    );
                    result.stack_trace = Some(format!("{:?}", e));
                    return Err(result);
                }
            }
        }
        Ok(definitions)
    }

    async fn await_with_deadline<F>(
        &self,
        job: F,
        cancellation: CancellationFlag,
        deadline: Duration,
        started: Instant,
    ) -> TestResult
    where
        F: FnOnce() -> TestResult + Send + 'static,
    {
        let handle = tokio::task::spawn_blocking(job);
        match tokio::time::timeout(deadline, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                let mut result =
                    TestResult::failure(TestFailureKind::Internal, format!("Test worker failed: {}", e));
                result.execution_time_ms = elapsed_ms(started);
                result
            }
            Err(_) => {
                cancellation.cancel();
                warn!("Test execution exceeded {} ms, cancelled", deadline.as_millis());
                let mut result = TestResult::failure(
                    TestFailureKind::Timeout,
                    format!("Test execution timed out after {} ms", deadline.as_millis()),
                );
                result.execution_time_ms = elapsed_ms(started);
                result
            }
        }
    }
}
