//! Declarative step graph attached to a mode.
//!
//! A [`FlowSpec`] is parsed from a mode document's `flow` field and is treated
//! as immutable once [`crate::core::normalize::normalize`] accepts it.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::runtime_policy::RuntimePolicy;

/// The only flow format version currently understood.
pub const FLOW_VERSION: &str = "1";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FlowSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub version: String,
    pub nodes: Vec<FlowNode>,
    #[serde(default)]
    pub edges: Vec<FlowEdge>,
}

impl FlowSpec {
    pub fn node(&self, id: &str) -> Option<&FlowNode> {
        self.nodes.iter().find(|node| node.id == id)
    }

    /// Ids of every node the given node depends on, in edge declaration order.
    pub fn dependencies_of(&self, id: &str) -> Vec<String> {
        let mut deps: Vec<String> = Vec::new();
        for edge in self.edges.iter().filter(|edge| edge.to == id) {
            if !deps.contains(&edge.from) {
                deps.push(edge.from.clone());
            }
        }
        deps
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FlowNode {
    pub id: String,
    pub role: Role,
    pub goal: String,
    pub expected_schema: ExpectedSchema,
    pub prompt: PromptTemplates,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_policy: Option<RuntimePolicy>,
}

/// System and user prompt templates for a node.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PromptTemplates {
    pub system: String,
    pub user: String,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Security,
    Planner,
    Implementer,
    Reviewer,
    Arbiter,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Security => "security",
            Role::Planner => "planner",
            Role::Implementer => "implementer",
            Role::Reviewer => "reviewer",
            Role::Arbiter => "arbiter",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured output a node is expected to produce.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum ExpectedSchema {
    MultiPlan,
    PatchCandidate,
    ReviewReport,
    SecurityReport,
    MergeDecision,
}

impl ExpectedSchema {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExpectedSchema::MultiPlan => "multiPlan",
            ExpectedSchema::PatchCandidate => "patchCandidate",
            ExpectedSchema::ReviewReport => "reviewReport",
            ExpectedSchema::SecurityReport => "securityReport",
            ExpectedSchema::MergeDecision => "mergeDecision",
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum EdgeKind {
    #[serde(rename = "dependsOn")]
    DependsOn,
}

/// `to` may not start until `from` has completed.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FlowEdge {
    pub kind: EdgeKind,
    pub from: String,
    pub to: String,
}

impl FlowEdge {
    pub fn depends_on(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            kind: EdgeKind::DependsOn,
            from: from.into(),
            to: to.into(),
        }
    }
}
