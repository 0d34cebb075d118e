//! Disposable modules for test runs.
//!
//! Each test invocation compiles its own tree holding only the requested
//! definitions. Nothing here touches the production container or storage.

use std::collections::HashMap;

use log::{debug, warn};
use rule_engine::{CompilationError, CompiledModule, Diagnostic, RuleCompiler, SourceTree};

use crate::config::ContainerConfig;
use crate::types::{RuleDefinition, RuleId};

/// What a source path of a compiled module was built from.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleAttribution {
    pub rule_id: RuleId,
    pub description: Option<String>,
}

/// A module plus the definitions it was compiled from.
#[derive(Debug)]
pub struct EphemeralModule {
    module: CompiledModule,
    attribution: HashMap<String, RuleAttribution>,
    warnings: Vec<Diagnostic>,
}

impl EphemeralModule {
    pub fn module(&self) -> &CompiledModule {
        &self.module
    }

    /// Source path → definition, for attributing fired rules.
    pub fn attribution(&self) -> &HashMap<String, RuleAttribution> {
        &self.attribution
    }

    pub fn warnings(&self) -> &[Diagnostic] {
        &self.warnings
    }

    pub fn dispose(self) {
        if let Err(e) = self.module.dispose() {
            warn!("Failed to dispose ephemeral module: {}", e);
        }
    }
}

#[derive(Debug, Default)]
pub struct EphemeralContainerBuilder {
    compiler: RuleCompiler,
    config: ContainerConfig,
}

impl EphemeralContainerBuilder {
    pub fn new(config: ContainerConfig) -> Self {
        Self {
            compiler: RuleCompiler::new(),
            config,
        }
    }

    /// Number of compilations performed so far.
    pub fn compilations(&self) -> u64 {
        self.compiler.invocations()
    }

    pub fn build(&self, definitions: &[RuleDefinition]) -> Result<EphemeralModule, CompilationError> {
        let mut tree = SourceTree::new();
        let mut attribution = HashMap::new();
        for (index, definition) in definitions.iter().enumerate() {
            let path = self.config.test_path(index, &definition.name);
            tree.write(path.clone(), definition.content.clone());
            attribution.insert(
                path,
                RuleAttribution {
                    rule_id: definition.id,
                    description: definition.description.clone(),
                },
            );
        }

        let build = self.compiler.compile(&tree)?;
        for warning in &build.warnings {
            debug!("Test build warning: {}", warning);
        }
        debug!(
            "Built ephemeral module {} with {} rule(s)",
            build.module.release_id(),
            build.module.rule_count()
        );
        Ok(EphemeralModule {
            module: build.module,
            attribution,
            warnings: build.warnings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_attributes_paths_to_rules() {
        let builder = EphemeralContainerBuilder::new(ContainerConfig::default());
        let defs = vec![
            RuleDefinition::new(5, "same name", "rule a when Order() then end").with_description("first"),
            RuleDefinition::new(6, "same name", "rule b when Order() then end"),
        ];
        let built = builder.build(&defs).unwrap();
        assert_eq!(built.module().rule_count(), 2);
        assert_eq!(
            built.attribution()["test/0_same%20name.rule"],
            RuleAttribution {
                rule_id: RuleId(5),
                description: Some("first".to_string()),
            }
        );
        assert_eq!(built.attribution()["test/1_same%20name.rule"].rule_id, RuleId(6));
        assert_eq!(builder.compilations(), 1);
    }

    #[test]
    fn test_compilation_error_is_returned() {
        let builder = EphemeralContainerBuilder::default();
        let err = builder
            .build(&[RuleDefinition::new(1, "broken", "rule x when Order( then end")])
            .unwrap_err();
        assert_eq!(err.failing_paths(), vec!["test/0_broken.rule"]);
    }
}
