//! Structural validation of raw flow documents and job materialization.
//!
//! Shape problems are reported as PARSE errors (all schema violations at once).
//! Duplicate ids and dangling edges stop at the first contradiction.

use std::collections::HashSet;
use std::sync::LazyLock;

use jsonschema::Validator;
use serde_json::Value;

use crate::core::types::{Job, JobStatus, ValidationError, ValidationErrorKind};
use crate::flow::{ExpectedSchema, FlowSpec};

const FLOW_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/flow/v1.schema.json"
));

static FLOW_VALIDATOR: LazyLock<Result<Validator, String>> = LazyLock::new(|| {
    let schema: Value = serde_json::from_str(FLOW_SCHEMA).map_err(|err| err.to_string())?;
    jsonschema::validator_for(&schema).map_err(|err| err.to_string())
});

/// Extract and normalize the `flow` field of an untyped mode document.
pub fn normalize_mode(document: &Value) -> Result<FlowSpec, Vec<ValidationError>> {
    let Some(object) = document.as_object() else {
        return Err(vec![ValidationError::new(
            ValidationErrorKind::Parse,
            "mode document must be an object",
        )]);
    };
    match object.get("flow") {
        None | Some(Value::Null) => Err(vec![ValidationError::new(
            ValidationErrorKind::NoFlow,
            "mode document has no `flow` field",
        )]),
        Some(flow) => normalize(flow),
    }
}

/// Decode a raw flow value into a trusted [`FlowSpec`].
///
/// On success the spec is returned exactly as declared; nodes are not mutated.
pub fn normalize(raw: &Value) -> Result<FlowSpec, Vec<ValidationError>> {
    check_shape(raw)?;
    let spec: FlowSpec = serde_json::from_value(raw.clone()).map_err(|err| {
        vec![ValidationError::new(
            ValidationErrorKind::Parse,
            format!("decode flow: {err}"),
        )]
    })?;
    check_structure(&spec).map_err(|err| vec![err])?;
    Ok(spec)
}

/// Unique node ids and resolvable edge endpoints. Stops at the first violation.
pub fn check_structure(spec: &FlowSpec) -> Result<(), ValidationError> {
    let mut seen: HashSet<&str> = HashSet::new();
    for node in &spec.nodes {
        if !seen.insert(node.id.as_str()) {
            return Err(ValidationError::at_node(
                ValidationErrorKind::NodeDuplicate,
                &node.id,
                format!("duplicate node id '{}'", node.id),
            ));
        }
    }

    for edge in &spec.edges {
        for endpoint in [&edge.from, &edge.to] {
            if !seen.contains(endpoint.as_str()) {
                return Err(ValidationError::at_node(
                    ValidationErrorKind::EdgeInvalid,
                    endpoint,
                    format!(
                        "edge {} -> {} references unknown node '{}'",
                        edge.from, edge.to, endpoint
                    ),
                ));
            }
        }
    }
    Ok(())
}

/// Flag edges that consume a merge decision.
///
/// A `mergeDecision` is the terminal verdict of a flow, so nothing may depend
/// on a node that produces one. No other schema contract is inferred.
pub fn check_schema_contracts(spec: &FlowSpec) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    for edge in &spec.edges {
        let Some(from) = spec.node(&edge.from) else {
            continue;
        };
        if from.expected_schema == ExpectedSchema::MergeDecision {
            errors.push(ValidationError::at_node(
                ValidationErrorKind::SchemaMismatch,
                &edge.to,
                format!(
                    "node '{}' depends on '{}', which produces a terminal {}",
                    edge.to,
                    edge.from,
                    from.expected_schema.as_str()
                ),
            ));
        }
    }
    errors
}

/// Materialize one pending job per node, in node declaration order.
pub fn materialize_jobs(spec: &FlowSpec) -> Vec<Job> {
    spec.nodes
        .iter()
        .map(|node| Job {
            job_id: node.id.clone(),
            role: node.role,
            goal: node.goal.clone(),
            depends_on: spec.dependencies_of(&node.id),
            status: JobStatus::Pending,
        })
        .collect()
}

fn check_shape(raw: &Value) -> Result<(), Vec<ValidationError>> {
    let validator = FLOW_VALIDATOR.as_ref().map_err(|err| {
        vec![ValidationError::new(
            ValidationErrorKind::Parse,
            format!("invalid flow schema: {err}"),
        )]
    })?;
    let errors: Vec<ValidationError> = validator
        .iter_errors(raw)
        .map(|err| ValidationError::new(ValidationErrorKind::Parse, err.to_string()))
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
