// Rule source compiler.
//
// Compiles every entry of a SourceTree into one immutable CompiledModule.
// Each file is parsed independently; semantic checks then run per rule and
// across files (duplicate names within a package). Error diagnostics fail the
// build, warnings are returned alongside the module.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;
use sha2::{Digest, Sha256};

use crate::ast::{Action, Expr, Pattern, Pos, RuleDecl};
use crate::diagnostics::Diagnostic;
use crate::error::CompilationError;
use crate::module::CompiledModule;
use crate::parser::parse;
use crate::source_tree::SourceTree;

/// Package used for files without a `package` declaration.
pub const DEFAULT_PACKAGE: &str = "defaultpkg";

/// A rule ready for evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledRule {
    pub(crate) name: String,
    pub(crate) package: String,
    pub(crate) source_path: String,
    pub(crate) salience: i32,
    pub(crate) no_loop: bool,
    pub(crate) order: usize,
    pub(crate) patterns: Vec<Pattern>,
    pub(crate) actions: Vec<Action>,
}

impl CompiledRule {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn package(&self) -> &str {
        &self.package
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.package, self.name)
    }

    /// Path of the source tree entry this rule was compiled from.
    pub fn source_path(&self) -> &str {
        &self.source_path
    }

    pub fn salience(&self) -> i32 {
        self.salience
    }

    pub fn no_loop(&self) -> bool {
        self.no_loop
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }
}

/// Output of a successful build.
#[derive(Debug)]
pub struct CompiledBuild {
    pub module: CompiledModule,
    pub warnings: Vec<Diagnostic>,
}

#[derive(Debug, Default)]
pub struct RuleCompiler {
    invocations: AtomicU64,
}

impl RuleCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times `compile` has been called.
    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }

    /// Compiles the whole tree.
    pub fn compile(&self, tree: &SourceTree) -> Result<CompiledBuild, CompilationError> {
        self.invocations.fetch_add(1, Ordering::Relaxed);

        let mut diagnostics = Vec::new();
        let mut rules = Vec::new();
        let mut seen_names: HashMap<(String, String), String> = HashMap::new();

        for (path, source) in tree.iter() {
            let (file, parse_errors) = parse(source);
            for e in parse_errors {
                diagnostics.push(Diagnostic::error(path, e.line, e.column, e.message));
            }
            if file.rules.is_empty() && !diagnostics.iter().any(|d| d.path == path) {
                diagnostics.push(Diagnostic::warning(path, 1, 1, "file defines no rules"));
            }

            let package = file.package.unwrap_or_else(|| DEFAULT_PACKAGE.to_string());
            for decl in file.rules {
                let key = (package.clone(), decl.name.clone());
                if let Some(first_path) = seen_names.get(&key) {
                    diagnostics.push(Diagnostic::error(
                        path,
                        decl.line,
                        decl.column,
                        format!(
                            "duplicate rule name \"{}\" in package {} (first defined in {})",
                            decl.name, package, first_path
                        ),
                    ));
                    continue;
                }
                seen_names.insert(key, path.to_string());

                check_rule(path, &decl, &mut diagnostics);
                rules.push(CompiledRule {
                    name: decl.name,
                    package: package.clone(),
                    source_path: path.to_string(),
                    salience: decl.salience,
                    no_loop: decl.no_loop,
                    order: rules.len(),
                    patterns: decl.patterns,
                    actions: decl.actions,
                });
            }
        }

        let (errors, warnings): (Vec<_>, Vec<_>) =
            diagnostics.into_iter().partition(Diagnostic::is_error);
        if !errors.is_empty() {
            return Err(CompilationError { errors, warnings });
        }

        let release_id = release_id(tree);
        debug!(
            "Compiled {} rule(s) from {} source(s) into module {}",
            rules.len(),
            tree.len(),
            release_id
        );
        Ok(CompiledBuild {
            module: CompiledModule::new(release_id, rules),
            warnings,
        })
    }
}

/// Content digest of the tree, stable across identical inputs.
fn release_id(tree: &SourceTree) -> String {
    let mut hasher = Sha256::new();
    for (path, source) in tree.iter() {
        hasher.update(path.as_bytes());
        hasher.update([0u8]);
        hasher.update(source.as_bytes());
        hasher.update([0u8]);
    }
    hasher
        .finalize()
        .iter()
        .take(8)
        .map(|b| format!("{:02x}", b))
        .collect()
}

// ============================================================================
// Semantic checks
// ============================================================================

fn check_rule(path: &str, rule: &RuleDecl, out: &mut Vec<Diagnostic>) {
    let mut declared: HashMap<&str, Pos> = HashMap::new();
    let mut used: HashSet<&str> = HashSet::new();

    if rule.patterns.is_empty() {
        out.push(Diagnostic::warning(
            path,
            rule.line,
            rule.column,
            format!("rule \"{}\" has no conditions and fires once per session", rule.name),
        ));
    }

    for pattern in &rule.patterns {
        for constraint in &pattern.constraints {
            check_expr_vars(path, constraint, &declared, &mut used, out);
        }
        if let Some(binding) = pattern.binding.as_deref() {
            if pattern.negated {
                out.push(Diagnostic::error(
                    path,
                    pattern.line,
                    pattern.column,
                    format!("binding ${} is not allowed on a negated pattern", binding),
                ));
            } else if declared.contains_key(binding) {
                out.push(Diagnostic::error(
                    path,
                    pattern.line,
                    pattern.column,
                    format!("duplicate binding ${} in rule \"{}\"", binding, rule.name),
                ));
            } else {
                declared.insert(
                    binding,
                    Pos {
                        line: pattern.line,
                        column: pattern.column,
                    },
                );
            }
        }
    }

    for action in &rule.actions {
        match action {
            Action::Modify { binding, pos, .. } | Action::Delete { binding, pos } => {
                if declared.contains_key(binding.as_str()) {
                    used.insert(binding.as_str());
                } else {
                    out.push(Diagnostic::error(
                        path,
                        pos.line,
                        pos.column,
                        format!("unknown binding ${} in rule \"{}\"", binding, rule.name),
                    ));
                }
                if matches!(action, Action::Modify { .. }) && !rule.no_loop {
                    out.push(Diagnostic::warning(
                        path,
                        pos.line,
                        pos.column,
                        format!(
                            "rule \"{}\" modifies ${} without no-loop and may activate itself again",
                            rule.name, binding
                        ),
                    ));
                }
            }
            Action::Insert { .. } => {}
        }
        for assignment in action.assignments() {
            check_expr_vars(path, &assignment.value, &declared, &mut used, out);
            assignment.value.for_each_field(&mut |name, pos| {
                out.push(Diagnostic::error(
                    path,
                    pos.line,
                    pos.column,
                    format!(
                        "bare field '{}' is not allowed in actions; use $binding.{}",
                        name, name
                    ),
                ));
            });
        }
    }

    let mut unused: Vec<(&str, Pos)> = declared
        .iter()
        .filter(|(name, _)| !used.contains(*name))
        .map(|(name, pos)| (*name, *pos))
        .collect();
    unused.sort_by_key(|(_, pos)| (pos.line, pos.column));
    for (name, pos) in unused {
        out.push(Diagnostic::warning(
            path,
            pos.line,
            pos.column,
            format!("binding ${} is never used", name),
        ));
    }
}

fn check_expr_vars<'a>(
    path: &str,
    expr: &'a Expr,
    declared: &HashMap<&'a str, Pos>,
    used: &mut HashSet<&'a str>,
    out: &mut Vec<Diagnostic>,
) {
    match expr {
        Expr::Var { name, pos } => out.push(Diagnostic::error(
            path,
            pos.line,
            pos.column,
            format!("binding ${} cannot be used as a value; use ${}.field", name, name),
        )),
        Expr::VarField { var, pos, .. } => match declared.get_key_value(var.as_str()) {
            Some((key, _)) => {
                used.insert(*key);
            }
            None => out.push(Diagnostic::error(
                path,
                pos.line,
                pos.column,
                format!("unknown binding ${}", var),
            )),
        },
        Expr::Literal(_) | Expr::Field { .. } => {}
        Expr::Unary(_, inner) => check_expr_vars(path, inner, declared, used, out),
        Expr::Binary(_, lhs, rhs) => {
            check_expr_vars(path, lhs, declared, used, out);
            check_expr_vars(path, rhs, declared, used, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree(entries: &[(&str, &str)]) -> SourceTree {
        let mut tree = SourceTree::new();
        for (path, source) in entries {
            tree.write(*path, *source);
        }
        tree
    }

    #[test]
    fn test_compiles_valid_rules() {
        let compiler = RuleCompiler::new();
        let build = compiler
            .compile(&tree(&[(
                "rules/a.rule",
                "package p; rule \"A\" no-loop when $o : Order( price > 1 ) then modify($o) { price = $o.price - 1 } end",
            )]))
            .unwrap();
        assert_eq!(build.module.rule_count(), 1);
        assert_eq!(build.module.rules()[0].qualified_name(), "p.A");
        assert!(build.warnings.is_empty(), "{:?}", build.warnings);
        assert_eq!(compiler.invocations(), 1);
    }

    #[test]
    fn test_syntax_error_carries_location() {
        let err = RuleCompiler::new()
            .compile(&tree(&[("rules/bad.rule", "rule \"x\"\nwhen\n  Order( > 3 )\nthen\nend")]))
            .unwrap_err();
        assert_eq!(err.errors.len(), 1);
        assert_eq!(err.errors[0].path, "rules/bad.rule");
        assert_eq!(err.errors[0].line, 3);
        assert!(err.report().starts_with("Rule compilation errors:"));
    }

    #[test]
    fn test_duplicate_rule_names_across_files() {
        let err = RuleCompiler::new()
            .compile(&tree(&[
                ("rules/a.rule", "rule \"same\" when then end"),
                ("rules/b.rule", "rule \"same\" when then end"),
            ]))
            .unwrap_err();
        assert_eq!(err.failing_paths(), vec!["rules/b.rule"]);
    }

    #[test]
    fn test_same_name_in_different_packages_is_allowed() {
        let build = RuleCompiler::new()
            .compile(&tree(&[
                ("rules/a.rule", "package one; rule \"same\" when Order() then end"),
                ("rules/b.rule", "package two; rule \"same\" when Order() then end"),
            ]))
            .unwrap();
        assert_eq!(build.module.rule_count(), 2);
    }

    #[test]
    fn test_unknown_binding_and_bare_field_in_action() {
        let err = RuleCompiler::new()
            .compile(&tree(&[(
                "rules/a.rule",
                "rule r when $o : Order() then modify($x) { price = price } end",
            )]))
            .unwrap_err();
        let messages: Vec<_> = err.errors.iter().map(|d| d.message.as_str()).collect();
        assert!(messages.iter().any(|m| m.contains("unknown binding $x")));
        assert!(messages.iter().any(|m| m.contains("bare field 'price'")));
    }

    #[test]
    fn test_binding_must_be_declared_before_use() {
        let err = RuleCompiler::new()
            .compile(&tree(&[(
                "rules/a.rule",
                "rule r when Customer( id == $o.customerId ) $o : Order() then delete($o) end",
            )]))
            .unwrap_err();
        assert!(err.errors[0].message.contains("unknown binding $o"));
    }

    #[test]
    fn test_binding_on_negated_pattern_is_an_error() {
        let err = RuleCompiler::new()
            .compile(&tree(&[("rules/a.rule", "rule r when not $a : Alert() then end")]))
            .unwrap_err();
        assert!(err.errors[0].message.contains("negated pattern"));
    }

    #[test]
    fn test_warnings_do_not_fail_the_build() {
        let build = RuleCompiler::new()
            .compile(&tree(&[(
                "rules/a.rule",
                "rule r when $o : Order() $c : Customer() then modify($o) { seen = true } end",
            )]))
            .unwrap();
        let messages: Vec<_> = build.warnings.iter().map(|d| d.message.clone()).collect();
        assert!(messages.iter().any(|m| m.contains("without no-loop")));
        assert!(messages.iter().any(|m| m.contains("$c is never used")));
    }

    #[test]
    fn test_release_id_is_content_addressed() {
        let compiler = RuleCompiler::new();
        let a = compiler.compile(&tree(&[("x.rule", "rule r when then end")])).unwrap();
        let b = compiler.compile(&tree(&[("x.rule", "rule r when then end")])).unwrap();
        let c = compiler.compile(&tree(&[("x.rule", "rule r2 when then end")])).unwrap();
        assert_eq!(a.module.release_id(), b.module.release_id());
        assert_ne!(a.module.release_id(), c.module.release_id());
    }

    #[test]
    fn test_empty_tree_builds_empty_module() {
        let build = RuleCompiler::new().compile(&SourceTree::new()).unwrap();
        assert_eq!(build.module.rule_count(), 0);
    }
}
