// Validator Orchestrator
// A fixed set of validators, registered in a stable order and executed by
// priority tier. Any validator may short-circuit the rest; the outcome is
// valid iff no error-severity issue was recorded.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use cadence_types::{BranchStrategy, PipelineConfig, CONTEXT_REDUCER_STAGE};

use crate::condition::validate_condition_syntax;
use crate::planner::ExecutionGraph;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone)]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
    pub severity: Severity,
}

#[derive(Debug, Default)]
pub struct ValidationOutcome {
    pub issues: Vec<ValidationIssue>,
    /// Set by a validator when later validators cannot produce meaningful
    /// results (e.g. the structure itself is unusable).
    pub skip_remaining: bool,
}

impl ValidationOutcome {
    pub fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.issues.push(ValidationIssue {
            field: field.into(),
            message: message.into(),
            severity: Severity::Error,
        });
    }

    pub fn warning(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.issues.push(ValidationIssue {
            field: field.into(),
            message: message.into(),
            severity: Severity::Warning,
        });
    }

    pub fn is_valid(&self) -> bool {
        !self
            .issues
            .iter()
            .any(|issue| issue.severity == Severity::Error)
    }

    pub fn errors(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues
            .iter()
            .filter(|i| i.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues
            .iter()
            .filter(|i| i.severity == Severity::Warning)
    }
}

/// Inputs the validators inspect. Side-effect probes are limited to the
/// filesystem paths carried here.
pub struct ValidationContext {
    pub config: PipelineConfig,
    pub repo: PathBuf,
    pub available_runtimes: Vec<String>,
    /// Branch strategy previously used per pipeline name, from stored runs.
    pub known_strategies: HashMap<String, BranchStrategy>,
}

pub trait ConfigValidator: Send + Sync {
    fn name(&self) -> &'static str;
    /// Tier 0 runs first; within a tier, registration order holds.
    fn priority(&self) -> u8;
    fn should_run(&self, _ctx: &ValidationContext) -> bool {
        true
    }
    fn validate(&self, ctx: &ValidationContext, outcome: &mut ValidationOutcome);
}

pub struct ValidatorPipeline {
    validators: Vec<Box<dyn ConfigValidator>>,
}

impl ValidatorPipeline {
    /// The built-in validator set in its canonical order.
    pub fn with_defaults() -> Self {
        Self {
            validators: vec![
                Box::new(StructureValidator),
                Box::new(StageNameValidator),
                Box::new(DependencyValidator),
                Box::new(TimeoutValidator),
                Box::new(RetryValidator),
                Box::new(CommitPrefixValidator),
                Box::new(ConditionValidator),
                Box::new(RuntimeValidator),
                Box::new(AgentFileValidator),
                Box::new(BranchStrategyValidator),
            ],
        }
    }

    pub fn run(&self, ctx: &ValidationContext) -> ValidationOutcome {
        let mut order: Vec<&Box<dyn ConfigValidator>> = self.validators.iter().collect();
        order.sort_by_key(|v| v.priority()); // stable: ties keep registration order

        let mut outcome = ValidationOutcome::default();
        for validator in order {
            if outcome.skip_remaining {
                break;
            }
            if !validator.should_run(ctx) {
                continue;
            }
            validator.validate(ctx, &mut outcome);
        }
        outcome
    }
}

// ============================================================================
// Built-in validators
// ============================================================================

struct StructureValidator;

impl ConfigValidator for StructureValidator {
    fn name(&self) -> &'static str {
        "structure"
    }

    fn priority(&self) -> u8 {
        0
    }

    fn validate(&self, ctx: &ValidationContext, outcome: &mut ValidationOutcome) {
        if ctx.config.name.trim().is_empty() {
            outcome.error("name", "pipeline name must not be empty");
        }
        if ctx.config.agents.is_empty() {
            outcome.error("agents", "pipeline has no stages");
        }
        if !outcome.is_valid() {
            outcome.skip_remaining = true;
        }
    }
}

struct StageNameValidator;

impl ConfigValidator for StageNameValidator {
    fn name(&self) -> &'static str {
        "stage-names"
    }

    fn priority(&self) -> u8 {
        0
    }

    fn validate(&self, ctx: &ValidationContext, outcome: &mut ValidationOutcome) {
        let mut seen = HashSet::new();
        for (index, stage) in ctx.config.agents.iter().enumerate() {
            let field = format!("agents[{index}].name");
            if stage.name.trim().is_empty() {
                outcome.error(&field, "stage name must not be empty");
                continue;
            }
            if stage.name == CONTEXT_REDUCER_STAGE {
                outcome.error(&field, format!("'{}' is reserved", CONTEXT_REDUCER_STAGE));
            }
            if !stage
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            {
                outcome.error(
                    &field,
                    format!(
                        "stage name '{}' may only contain letters, digits, '-' and '_'",
                        stage.name
                    ),
                );
            }
            if !seen.insert(stage.name.as_str()) {
                outcome.error(&field, format!("duplicate stage name '{}'", stage.name));
            }
        }
    }
}

struct DependencyValidator;

impl ConfigValidator for DependencyValidator {
    fn name(&self) -> &'static str {
        "dependencies"
    }

    fn priority(&self) -> u8 {
        1
    }

    fn validate(&self, ctx: &ValidationContext, outcome: &mut ValidationOutcome) {
        let names: HashSet<&str> = ctx.config.agents.iter().map(|s| s.name.as_str()).collect();
        let mut reference_ok = true;
        for (index, stage) in ctx.config.agents.iter().enumerate() {
            for dep in &stage.depends_on {
                if dep == &stage.name {
                    outcome.error(
                        format!("agents[{index}].dependsOn"),
                        format!("stage '{}' depends on itself", stage.name),
                    );
                    reference_ok = false;
                } else if !names.contains(dep.as_str()) {
                    outcome.error(
                        format!("agents[{index}].dependsOn"),
                        format!("unknown dependency '{}'", dep),
                    );
                    reference_ok = false;
                }
            }
        }
        // the planner's cycle check only makes sense over resolvable edges
        if reference_ok {
            if let Err(e) = ExecutionGraph::build(&ctx.config) {
                outcome.error("agents", e.to_string());
            }
        }
    }
}

struct TimeoutValidator;

impl ConfigValidator for TimeoutValidator {
    fn name(&self) -> &'static str {
        "timeouts"
    }

    fn priority(&self) -> u8 {
        1
    }

    fn validate(&self, ctx: &ValidationContext, outcome: &mut ValidationOutcome) {
        for (index, stage) in ctx.config.agents.iter().enumerate() {
            match stage.timeout_seconds {
                Some(0) => outcome.error(
                    format!("agents[{index}].timeoutSeconds"),
                    "timeout must be positive",
                ),
                Some(seconds) if seconds > 24 * 60 * 60 => outcome.warning(
                    format!("agents[{index}].timeoutSeconds"),
                    format!("timeout of {seconds}s exceeds one day"),
                ),
                _ => {}
            }
        }
    }
}

struct RetryValidator;

impl ConfigValidator for RetryValidator {
    fn name(&self) -> &'static str {
        "retries"
    }

    fn priority(&self) -> u8 {
        1
    }

    fn validate(&self, ctx: &ValidationContext, outcome: &mut ValidationOutcome) {
        for (index, stage) in ctx.config.agents.iter().enumerate() {
            if stage.retry.max_attempts == 0 {
                outcome.error(
                    format!("agents[{index}].retry.maxAttempts"),
                    "maxAttempts must be at least 1",
                );
            }
            if stage.retry.max_attempts > 10 {
                outcome.warning(
                    format!("agents[{index}].retry.maxAttempts"),
                    format!("{} attempts is excessive", stage.retry.max_attempts),
                );
            }
        }
    }
}

struct CommitPrefixValidator;

impl ConfigValidator for CommitPrefixValidator {
    fn name(&self) -> &'static str {
        "commit-prefix"
    }

    fn priority(&self) -> u8 {
        1
    }

    fn should_run(&self, ctx: &ValidationContext) -> bool {
        ctx.config.settings.auto_commit
    }

    fn validate(&self, ctx: &ValidationContext, outcome: &mut ValidationOutcome) {
        if !ctx.config.settings.commit_prefix.contains("{{stage}}") {
            outcome.error(
                "settings.commitPrefix",
                "commit prefix must contain the {{stage}} placeholder",
            );
        }
    }
}

struct ConditionValidator;

impl ConfigValidator for ConditionValidator {
    fn name(&self) -> &'static str {
        "conditions"
    }

    fn priority(&self) -> u8 {
        1
    }

    fn validate(&self, ctx: &ValidationContext, outcome: &mut ValidationOutcome) {
        let names: HashSet<&str> = ctx.config.agents.iter().map(|s| s.name.as_str()).collect();
        for (index, stage) in ctx.config.agents.iter().enumerate() {
            let Some(expr) = &stage.condition else {
                continue;
            };
            let field = format!("agents[{index}].condition");
            if let Err(reason) = validate_condition_syntax(expr) {
                outcome.error(&field, reason);
                continue;
            }
            // referencing an undeclared stage is survivable (evaluates false)
            for clause_stage in referenced_stages(expr) {
                if !names.contains(clause_stage.as_str()) {
                    outcome.warning(
                        &field,
                        format!("condition references undeclared stage '{}'", clause_stage),
                    );
                }
            }
        }
    }
}

fn referenced_stages(expr: &str) -> Vec<String> {
    expr.split("stages.")
        .skip(1)
        .filter_map(|rest| rest.split('.').next())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect()
}

struct RuntimeValidator;

impl ConfigValidator for RuntimeValidator {
    fn name(&self) -> &'static str {
        "runtimes"
    }

    fn priority(&self) -> u8 {
        2
    }

    fn validate(&self, ctx: &ValidationContext, outcome: &mut ValidationOutcome) {
        let mut check = |field: String, kind: &str| {
            if !ctx.available_runtimes.iter().any(|r| r == kind) {
                outcome.warning(
                    field,
                    format!(
                        "runtime '{}' is not registered; the default runtime will be used",
                        kind
                    ),
                );
            }
        };
        if let Some(runtime) = &ctx.config.runtime {
            check("runtime.type".to_string(), &runtime.kind);
        }
        for (index, stage) in ctx.config.agents.iter().enumerate() {
            if let Some(runtime) = &stage.runtime {
                check(format!("agents[{index}].runtime.type"), &runtime.kind);
            }
        }
    }
}

struct AgentFileValidator;

impl ConfigValidator for AgentFileValidator {
    fn name(&self) -> &'static str {
        "agent-files"
    }

    fn priority(&self) -> u8 {
        2
    }

    fn validate(&self, ctx: &ValidationContext, outcome: &mut ValidationOutcome) {
        for (index, stage) in ctx.config.agents.iter().enumerate() {
            let path = if stage.agent.is_absolute() {
                stage.agent.clone()
            } else {
                ctx.repo.join(&stage.agent)
            };
            if !path.is_file() {
                outcome.error(
                    format!("agents[{index}].agent"),
                    format!("agent file '{}' does not exist", stage.agent.display()),
                );
            }
        }
    }
}

struct BranchStrategyValidator;

impl ConfigValidator for BranchStrategyValidator {
    fn name(&self) -> &'static str {
        "branch-strategy"
    }

    fn priority(&self) -> u8 {
        2
    }

    fn validate(&self, ctx: &ValidationContext, outcome: &mut ValidationOutcome) {
        // `{prefix}/{name}` and `{prefix}/{name}/{run}` must never collide
        if ctx.config.name.contains('/') {
            outcome.error(
                "name",
                "pipeline name must not contain '/' (it is embedded in branch names)",
            );
        }
        if ctx.config.git.branch_prefix.is_empty() || ctx.config.git.branch_prefix.contains(' ') {
            outcome.error(
                "git.branchPrefix",
                "branch prefix must be a non-empty token without spaces",
            );
        }
        if let Some(previous) = ctx.known_strategies.get(&ctx.config.name) {
            if *previous != ctx.config.git.strategy {
                outcome.error(
                    "git.strategy",
                    format!(
                        "pipeline '{}' already has runs with the {:?} strategy; mixing strategies would collide branch names",
                        ctx.config.name, previous
                    ),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{pipeline, stage, write_agent_files};
    use tempfile::TempDir;

    fn context(config: PipelineConfig, repo: &TempDir) -> ValidationContext {
        ValidationContext {
            config,
            repo: repo.path().to_path_buf(),
            available_runtimes: vec!["mock".to_string()],
            known_strategies: HashMap::new(),
        }
    }

    fn valid_context(repo: &TempDir) -> ValidationContext {
        let config = pipeline("review", vec![stage("lint", &[]), stage("fix", &["lint"])]);
        write_agent_files(repo.path(), &config);
        context(config, repo)
    }

    #[test]
    fn a_wellformed_config_passes() {
        let repo = TempDir::new().unwrap();
        let outcome = ValidatorPipeline::with_defaults().run(&valid_context(&repo));
        assert!(outcome.is_valid(), "issues: {:?}", outcome.issues);
    }

    #[test]
    fn empty_structure_short_circuits() {
        let repo = TempDir::new().unwrap();
        let ctx = context(pipeline("", vec![]), &repo);
        let outcome = ValidatorPipeline::with_defaults().run(&ctx);

        assert!(!outcome.is_valid());
        assert!(outcome.skip_remaining);
        // only structure issues; nothing from later tiers (e.g. agent files)
        assert!(outcome.issues.iter().all(|i| {
            i.field == "name" || i.field == "agents"
        }));
    }

    #[test]
    fn duplicate_and_illegal_stage_names() {
        let repo = TempDir::new().unwrap();
        let config = pipeline(
            "review",
            vec![stage("lint", &[]), stage("lint", &[]), stage("bad name", &[])],
        );
        let outcome = ValidatorPipeline::with_defaults().run(&context(config, &repo));
        assert!(!outcome.is_valid());
        let messages: Vec<&str> = outcome.errors().map(|i| i.message.as_str()).collect();
        assert!(messages.iter().any(|m| m.contains("duplicate")));
        assert!(messages.iter().any(|m| m.contains("may only contain")));
    }

    #[test]
    fn unknown_and_cyclic_dependencies() {
        let repo = TempDir::new().unwrap();
        let config = pipeline("review", vec![stage("a", &["ghost"])]);
        let outcome = ValidatorPipeline::with_defaults().run(&context(config, &repo));
        assert!(outcome
            .errors()
            .any(|i| i.message.contains("unknown dependency 'ghost'")));

        let config = pipeline("review", vec![stage("a", &["b"]), stage("b", &["a"])]);
        let outcome = ValidatorPipeline::with_defaults().run(&context(config, &repo));
        assert!(outcome.errors().any(|i| i.message.contains("cycle")));
    }

    #[test]
    fn commit_prefix_requires_placeholder_only_when_autocommitting() {
        let repo = TempDir::new().unwrap();
        let mut config = pipeline("review", vec![stage("lint", &[])]);
        write_agent_files(repo.path(), &config);
        config.settings.auto_commit = true;
        config.settings.commit_prefix = "pipeline commit".to_string();
        let outcome = ValidatorPipeline::with_defaults().run(&context(config.clone(), &repo));
        assert!(outcome
            .errors()
            .any(|i| i.field == "settings.commitPrefix"));

        config.settings.auto_commit = false;
        let outcome = ValidatorPipeline::with_defaults().run(&context(config, &repo));
        assert!(outcome.is_valid());
    }

    #[test]
    fn zero_timeout_and_zero_attempts_are_errors() {
        let repo = TempDir::new().unwrap();
        let mut config = pipeline("review", vec![stage("lint", &[])]);
        write_agent_files(repo.path(), &config);
        config.agents[0].timeout_seconds = Some(0);
        config.agents[0].retry.max_attempts = 0;
        let outcome = ValidatorPipeline::with_defaults().run(&context(config, &repo));
        assert!(outcome.errors().any(|i| i.field.contains("timeoutSeconds")));
        assert!(outcome.errors().any(|i| i.field.contains("maxAttempts")));
    }

    #[test]
    fn condition_issues_split_by_severity() {
        let repo = TempDir::new().unwrap();
        let mut config = pipeline("review", vec![stage("a", &[]), stage("b", &["a"])]);
        write_agent_files(repo.path(), &config);
        config.agents[1].condition = Some("{{ stages.ghost.outputs.n > 0 }}".to_string());
        let outcome = ValidatorPipeline::with_defaults().run(&context(config.clone(), &repo));
        assert!(outcome.is_valid());
        assert!(outcome
            .warnings()
            .any(|i| i.message.contains("undeclared stage 'ghost'")));

        config.agents[1].condition = Some("{{ whatever }}".to_string());
        let outcome = ValidatorPipeline::with_defaults().run(&context(config, &repo));
        assert!(!outcome.is_valid());
    }

    #[test]
    fn unregistered_runtime_is_a_warning() {
        let repo = TempDir::new().unwrap();
        let mut config = pipeline("review", vec![stage("lint", &[])]);
        write_agent_files(repo.path(), &config);
        config.runtime = Some(cadence_types::RuntimeConfig {
            kind: "sdk".to_string(),
            options: Default::default(),
        });
        let outcome = ValidatorPipeline::with_defaults().run(&context(config, &repo));
        assert!(outcome.is_valid());
        assert!(outcome.warnings().any(|i| i.field == "runtime.type"));
    }

    #[test]
    fn missing_agent_files_are_errors() {
        let repo = TempDir::new().unwrap();
        let config = pipeline("review", vec![stage("lint", &[])]);
        // no files written
        let outcome = ValidatorPipeline::with_defaults().run(&context(config, &repo));
        assert!(outcome
            .errors()
            .any(|i| i.message.contains("does not exist")));
    }

    #[test]
    fn strategy_mixing_for_one_pipeline_is_rejected() {
        let repo = TempDir::new().unwrap();
        let config = pipeline("review", vec![stage("lint", &[])]);
        write_agent_files(repo.path(), &config);
        let mut ctx = context(config, &repo);
        ctx.known_strategies
            .insert("review".to_string(), BranchStrategy::UniquePerRun);
        let outcome = ValidatorPipeline::with_defaults().run(&ctx);
        assert!(outcome
            .errors()
            .any(|i| i.field == "git.strategy" && i.message.contains("collide")));
    }
}
