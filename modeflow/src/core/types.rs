//! Shared deterministic types for core logic.
//!
//! These types define stable contracts between core components and the
//! collaborators that consume their output (CLI, dashboards, persistence).

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::flow::Role;

/// Category of a structural problem found while loading or compiling a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationErrorKind {
    Parse,
    NoFlow,
    Cycle,
    SchemaMismatch,
    EdgeInvalid,
    NodeDuplicate,
    Catalog,
    Repo,
}

impl ValidationErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationErrorKind::Parse => "PARSE",
            ValidationErrorKind::NoFlow => "NO_FLOW",
            ValidationErrorKind::Cycle => "CYCLE",
            ValidationErrorKind::SchemaMismatch => "SCHEMA_MISMATCH",
            ValidationErrorKind::EdgeInvalid => "EDGE_INVALID",
            ValidationErrorKind::NodeDuplicate => "NODE_DUPLICATE",
            ValidationErrorKind::Catalog => "CATALOG",
            ValidationErrorKind::Repo => "REPO",
        }
    }
}

impl fmt::Display for ValidationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed structural error. Never raised as a panic; always returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(rename_all = "camelCase")]
#[error("{kind}: {message}")]
pub struct ValidationError {
    pub kind: ValidationErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

impl ValidationError {
    pub fn new(kind: ValidationErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            node_id: None,
        }
    }

    pub fn at_node(
        kind: ValidationErrorKind,
        node_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            node_id: Some(node_id.into()),
        }
    }
}

/// Lifecycle of a materialized job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Per-run instance of a flow node. Not persisted by this crate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub job_id: String,
    pub role: Role,
    pub goal: String,
    pub depends_on: Vec<String>,
    pub status: JobStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("job '{job_id}' cannot move from {from:?} to {to:?}")]
pub struct JobTransitionError {
    pub job_id: String,
    pub from: JobStatus,
    pub to: JobStatus,
}

impl Job {
    /// pending -> processing
    pub fn start(&mut self) -> Result<(), JobTransitionError> {
        self.transition(JobStatus::Pending, JobStatus::Processing)
    }

    /// processing -> completed
    pub fn complete(&mut self) -> Result<(), JobTransitionError> {
        self.transition(JobStatus::Processing, JobStatus::Completed)
    }

    /// processing -> failed
    pub fn fail(&mut self) -> Result<(), JobTransitionError> {
        self.transition(JobStatus::Processing, JobStatus::Failed)
    }

    fn transition(&mut self, expected: JobStatus, next: JobStatus) -> Result<(), JobTransitionError> {
        if self.status != expected {
            return Err(JobTransitionError {
                job_id: self.job_id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }
}

/// File and line statistics extracted from a unified diff.
///
/// `valid` is true iff `errors` is empty. Counts are filled in even when the
/// diff is invalid so callers can show partial diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchStats {
    pub valid: bool,
    pub files_changed: usize,
    pub insertions: usize,
    pub deletions: usize,
    pub files: Vec<String>,
    pub errors: Vec<String>,
}

/// Outcome of the patch safety checks. Every violation is listed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SafetyReport {
    pub safe: bool,
    pub errors: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job {
            job_id: "impl".to_string(),
            role: Role::Implementer,
            goal: "write code".to_string(),
            depends_on: Vec::new(),
            status: JobStatus::Pending,
        }
    }

    #[test]
    fn error_kind_serializes_screaming_snake_case() {
        let err = ValidationError::at_node(ValidationErrorKind::NodeDuplicate, "x", "duplicate");
        let value = serde_json::to_value(&err).expect("serialize");
        assert_eq!(value["kind"], "NODE_DUPLICATE");
        assert_eq!(value["nodeId"], "x");
        assert_eq!(err.to_string(), "NODE_DUPLICATE: duplicate");
    }

    #[test]
    fn job_moves_through_lifecycle() {
        let mut job = job();
        job.start().expect("start");
        assert_eq!(job.status, JobStatus::Processing);
        job.complete().expect("complete");
        assert!(job.status.is_terminal());
    }

    #[test]
    fn job_rejects_skipping_processing() {
        let mut job = job();
        let err = job.complete().expect_err("pending cannot complete");
        assert_eq!(err.from, JobStatus::Pending);
        assert_eq!(err.to, JobStatus::Completed);
        assert_eq!(job.status, JobStatus::Pending);
    }
}
