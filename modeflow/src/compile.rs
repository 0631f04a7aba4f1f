//! Mode compilation: document -> normalized flow -> schedule -> planned jobs.
//!
//! Each planned job carries its resolved runtime policy and rendered prompts.
//! Nothing here executes a job.

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::core::normalize::{check_schema_contracts, materialize_jobs, normalize_mode};
use crate::core::runtime_policy::{PolicyLayers, RuntimePolicy, resolve_layers};
use crate::core::schedule::{self, SimulateReport, ValidateReport, compute_levels};
use crate::core::types::{Job, ValidationError};
use crate::flow::FlowSpec;
use crate::io::mode::Mode;
use crate::io::prompt::{JobPrompt, build_job_prompt};

/// Policy layers that live outside the mode document.
#[derive(Debug, Clone, Copy, Default)]
pub struct PolicySources<'a> {
    /// Pack-level layer (from `pack.toml`).
    pub pack: Option<&'a RuntimePolicy>,
    /// Workspace defaults (from `.modeflow/config.toml`).
    pub defaults: Option<&'a RuntimePolicy>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledFlow {
    pub mode: String,
    pub spec: FlowSpec,
    /// Parallel levels, first level first.
    pub schedule: Vec<Vec<String>>,
    pub jobs: Vec<PlannedJob>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedJob {
    pub job: Job,
    pub policy: RuntimePolicy,
    pub prompt: JobPrompt,
}

/// Compile an untyped mode document.
pub fn compile_mode(
    document: &Value,
    sources: &PolicySources<'_>,
    task: &Value,
) -> Result<CompiledFlow, Vec<ValidationError>> {
    let mode = Mode::from_document(document)?;
    compile(&mode, sources, task)
}

/// Compile an already loaded mode. A cyclic graph or a schema contract
/// violation yields no jobs.
#[instrument(skip_all, fields(mode = %mode.name))]
pub fn compile(
    mode: &Mode,
    sources: &PolicySources<'_>,
    task: &Value,
) -> Result<CompiledFlow, Vec<ValidationError>> {
    let levels = compute_levels(&mode.flow);
    let mut errors: Vec<ValidationError> = levels.cycle.into_iter().collect();
    errors.extend(check_schema_contracts(&mode.flow));
    if !errors.is_empty() {
        debug!(error_count = errors.len(), "mode rejected");
        return Err(errors);
    }

    let layers = PolicyLayers {
        mode: mode.runtime_policy.as_ref(),
        pack: sources.pack,
        defaults: sources.defaults,
    };
    let jobs: Vec<PlannedJob> = mode
        .flow
        .nodes
        .iter()
        .zip(materialize_jobs(&mode.flow))
        .map(|(node, job)| PlannedJob {
            policy: resolve_layers(node.runtime_policy.as_ref(), &layers),
            prompt: build_job_prompt(node, &job, &mode.flow, &mode.name, task),
            job,
        })
        .collect();

    info!(
        jobs = jobs.len(),
        levels = levels.levels.len(),
        "mode compiled"
    );
    Ok(CompiledFlow {
        mode: mode.name.clone(),
        spec: mode.flow.clone(),
        schedule: levels.levels,
        jobs,
    })
}

/// Sequencing report for a mode document, including load-time errors.
pub fn validate_document(document: &Value) -> ValidateReport {
    let spec = match normalize_mode(document) {
        Ok(spec) => spec,
        Err(errors) => {
            return ValidateReport {
                ok: false,
                errors,
                topo: Vec::new(),
            };
        }
    };
    let mut report = schedule::validate(&spec);
    let contracts = check_schema_contracts(&spec);
    if !contracts.is_empty() {
        report.ok = false;
        report.errors.extend(contracts);
    }
    report
}

/// Concurrency report for a mode document. Load-time errors are returned
/// as-is; a cycle or a schema contract violation is reported inside the
/// simulation, so `ok` agrees with [`validate_document`].
pub fn simulate_document(document: &Value) -> Result<SimulateReport, Vec<ValidationError>> {
    let spec = normalize_mode(document)?;
    let mut report = schedule::simulate(&spec);
    let contracts = check_schema_contracts(&spec);
    if !contracts.is_empty() {
        report.ok = false;
        report.errors.extend(contracts);
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::runtime_policy::{BudgetPolicy, ModelPolicy, RateLimitPolicy};
    use crate::core::types::{JobStatus, ValidationErrorKind};
    use crate::flow::ExpectedSchema;
    use crate::test_support::{edge, flow_value, node, node_with_policy, node_with_schema};
    use serde_json::json;

    fn model(name: &str) -> RuntimePolicy {
        RuntimePolicy {
            model: Some(ModelPolicy {
                preferred: name.to_string(),
                fallback: Vec::new(),
            }),
            ..RuntimePolicy::default()
        }
    }

    fn diamond_document() -> Value {
        let flow = flow_value(
            vec![
                node_with_policy("plan", model("node-model")),
                node("left"),
                node("right"),
                node("merge"),
            ],
            vec![
                edge("plan", "left"),
                edge("plan", "right"),
                edge("left", "merge"),
                edge("right", "merge"),
            ],
        );
        json!({
            "name": "diamond",
            "runtimePolicy": { "budget": { "maxTokens": 500 } },
            "flow": flow,
        })
    }

    #[test]
    fn compiles_jobs_with_schedule_policy_and_prompts() {
        let pack = RuntimePolicy {
            rate_limit: Some(RateLimitPolicy {
                requests_per_minute: Some(30),
                tokens_per_minute: None,
            }),
            ..model("pack-model")
        };
        let sources = PolicySources {
            pack: Some(&pack),
            defaults: None,
        };
        let compiled = compile_mode(&diamond_document(), &sources, &json!("ship it"))
            .expect("compile");

        assert_eq!(compiled.mode, "diamond");
        assert_eq!(
            compiled.schedule,
            vec![vec!["plan"], vec!["left", "right"], vec!["merge"]]
        );
        assert_eq!(compiled.jobs.len(), 4);
        assert!(compiled.jobs.iter().all(|j| j.job.status == JobStatus::Pending));

        let plan = &compiled.jobs[0];
        assert_eq!(plan.policy.model.as_ref().map(|m| m.preferred.as_str()), Some("node-model"));
        let merge = &compiled.jobs[3];
        assert_eq!(merge.job.depends_on, vec!["left", "right"]);
        assert_eq!(merge.policy.model.as_ref().map(|m| m.preferred.as_str()), Some("pack-model"));
        assert_eq!(
            merge.policy.budget,
            Some(BudgetPolicy {
                max_tokens: Some(500),
                max_cost_usd: None
            })
        );
        assert_eq!(merge.policy.rate_limit.as_ref().and_then(|r| r.requests_per_minute), Some(30));
        assert_eq!(merge.prompt.user, "ship it");
        assert_eq!(merge.prompt.system, "system prompt for merge");
    }

    #[test]
    fn cyclic_flow_yields_no_jobs() {
        let flow = flow_value(
            vec![node("a"), node("b")],
            vec![edge("a", "b"), edge("b", "a")],
        );
        let errors = compile_mode(&json!({ "flow": flow }), &PolicySources::default(), &Value::Null)
            .expect_err("cycle");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, ValidationErrorKind::Cycle);
    }

    #[test]
    fn dependency_on_merge_decision_blocks_compilation() {
        let flow = flow_value(
            vec![node_with_schema("arbiter", ExpectedSchema::MergeDecision), node("after")],
            vec![edge("arbiter", "after")],
        );
        let document = json!({ "flow": flow });
        let errors = compile_mode(&document, &PolicySources::default(), &Value::Null)
            .expect_err("mismatch");
        assert_eq!(errors[0].kind, ValidationErrorKind::SchemaMismatch);

        let report = validate_document(&document);
        assert!(!report.ok);
        assert_eq!(report.topo, vec![vec!["arbiter"], vec!["after"]]);

        let simulated = simulate_document(&document).expect("simulate");
        assert!(!simulated.ok);
        assert_eq!(simulated.ticks, vec![vec!["arbiter"], vec!["after"]]);
        assert_eq!(simulated.errors[0].kind, ValidationErrorKind::SchemaMismatch);
    }

    #[test]
    fn validate_and_simulate_report_load_errors() {
        let report = validate_document(&json!({ "name": "empty" }));
        assert!(!report.ok);
        assert_eq!(report.errors[0].kind, ValidationErrorKind::NoFlow);
        assert!(report.topo.is_empty());

        let errors = simulate_document(&json!([])).expect_err("not an object");
        assert_eq!(errors[0].kind, ValidationErrorKind::Parse);
    }

    #[test]
    fn simulate_reports_blocked_nodes() {
        let flow = flow_value(
            vec![node("a"), node("b"), node("c")],
            vec![edge("b", "c"), edge("c", "b")],
        );
        let report = simulate_document(&json!({ "flow": flow })).expect("simulate");
        assert!(!report.ok);
        assert_eq!(report.ticks, vec![vec!["a"]]);
        assert_eq!(report.blocked_by.get("b"), Some(&vec!["c".to_string()]));
        assert_eq!(report.errors[0].kind, ValidationErrorKind::Cycle);
    }
}
