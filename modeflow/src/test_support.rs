//! Test-only helpers for building flows, diffs, and scratch workspaces.

use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, bail};
use serde_json::Value;
use tempfile::TempDir;

use crate::core::runtime_policy::RuntimePolicy;
use crate::flow::{ExpectedSchema, FLOW_VERSION, FlowEdge, FlowNode, FlowSpec, PromptTemplates, Role};
use crate::io::command::{CommandRequest, CommandResult, CommandRunner};
use crate::io::config::Policy;

/// Create a deterministic implementer node producing a patch candidate.
pub fn node(id: &str) -> FlowNode {
    FlowNode {
        id: id.to_string(),
        role: Role::Implementer,
        goal: format!("goal for {id}"),
        expected_schema: ExpectedSchema::PatchCandidate,
        prompt: PromptTemplates {
            system: format!("system prompt for {id}"),
            user: "{{task}}".to_string(),
        },
        output_key: None,
        runtime_policy: None,
    }
}

/// Create a node with an explicit expected schema.
pub fn node_with_schema(id: &str, expected_schema: ExpectedSchema) -> FlowNode {
    FlowNode {
        expected_schema,
        ..node(id)
    }
}

/// Create a node carrying its own runtime policy layer.
pub fn node_with_policy(id: &str, policy: RuntimePolicy) -> FlowNode {
    FlowNode {
        runtime_policy: Some(policy),
        ..node(id)
    }
}

/// `to` depends on `from`.
pub fn edge(from: &str, to: &str) -> FlowEdge {
    FlowEdge::depends_on(from, to)
}

pub fn flow_spec(nodes: Vec<FlowNode>, edges: Vec<FlowEdge>) -> FlowSpec {
    FlowSpec {
        name: Some("test-flow".to_string()),
        version: FLOW_VERSION.to_string(),
        nodes,
        edges,
    }
}

/// The raw JSON form of [`flow_spec`], bypassing normalization so invalid
/// graphs (duplicates, dangling edges) can be expressed.
pub fn flow_value(nodes: Vec<FlowNode>, edges: Vec<FlowEdge>) -> Value {
    serde_json::to_value(flow_spec(nodes, edges)).unwrap_or(Value::Null)
}

/// A `git apply`-compatible diff replacing `old` with `new` in `path`.
///
/// The common leading lines become context; the rest are removed and added.
pub fn diff_for(path: &str, old: &[&str], new: &[&str]) -> String {
    let common = old
        .iter()
        .zip(new.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let mut diff = format!(
        "diff --git a/{path} b/{path}\n--- a/{path}\n+++ b/{path}\n@@ -1,{} +1,{} @@\n",
        old.len(),
        new.len()
    );
    for line in &old[..common] {
        diff.push_str(&format!(" {line}\n"));
    }
    for line in &old[common..] {
        diff.push_str(&format!("-{line}\n"));
    }
    for line in &new[common..] {
        diff.push_str(&format!("+{line}\n"));
    }
    diff
}

/// A `git apply`-compatible diff creating `path` with `lines`.
pub fn new_file_diff(path: &str, lines: &[&str]) -> String {
    let mut diff = format!(
        "diff --git a/{path} b/{path}\nnew file mode 100644\n--- /dev/null\n+++ b/{path}\n@@ -0,0 +1,{} @@\n",
        lines.len()
    );
    for line in lines {
        diff.push_str(&format!("+{line}\n"));
    }
    diff
}

/// A temporary git-initialized directory used as a workspace root.
pub struct TestWorkspace {
    dir: TempDir,
}

impl TestWorkspace {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp workspace")?;
        let status = Command::new("git")
            .args(["init", "-q"])
            .current_dir(dir.path())
            .status()
            .context("run git init")?;
        if !status.success() {
            bail!("git init failed with {status}");
        }
        Ok(Self { dir })
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    pub fn write_file(&self, rel: &str, contents: &str) -> Result<()> {
        let path = self.path(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
    }

    pub fn read_file(&self, rel: &str) -> Result<String> {
        let path = self.path(rel);
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }

    /// Policy rooted at this workspace with default permissions.
    pub fn policy(&self) -> Policy {
        Policy::default().with_workspace_root(self.root())
    }
}

/// Command runner that records every request and replays exit codes in order.
///
/// Requests beyond the scripted codes succeed.
#[derive(Debug, Default)]
pub struct ScriptedCommandRunner {
    exit_codes: Vec<i32>,
    calls: RefCell<Vec<String>>,
}

impl ScriptedCommandRunner {
    pub fn new(exit_codes: Vec<i32>) -> Self {
        Self {
            exit_codes,
            calls: RefCell::new(Vec::new()),
        }
    }

    /// Display form of every command run so far.
    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }
}

impl CommandRunner for ScriptedCommandRunner {
    fn run(&self, request: &CommandRequest, _policy: &Policy) -> CommandResult {
        let mut calls = self.calls.borrow_mut();
        let exit_code = self.exit_codes.get(calls.len()).copied().unwrap_or(0);
        let command = request.display();
        calls.push(command.clone());
        CommandResult {
            command,
            exit_code,
            stdout: String::new(),
            stderr: if exit_code == 0 {
                String::new()
            } else {
                format!("scripted failure ({exit_code})")
            },
            duration_ms: 0,
            timed_out: false,
        }
    }
}
