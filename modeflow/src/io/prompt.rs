//! Job prompt building on top of the template renderer.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use crate::core::template::render;
use crate::core::types::Job;
use crate::flow::{FlowNode, FlowSpec};

/// Rendered system and user prompts for one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPrompt {
    pub system: String,
    pub user: String,
}

/// Template context exposed to node prompts.
///
/// `{{task}}`, `{{node.id}}`, `{{node.role}}`, `{{node.goal}}`,
/// `{{node.outputKey}}`, `{{flow.name}}`, `{{flow.version}}`,
/// `{{mode.name}}`, and `{{json job.dependsOn}}` are available.
pub fn prompt_context(
    node: &FlowNode,
    job: &Job,
    spec: &FlowSpec,
    mode_name: &str,
    task: &Value,
) -> Value {
    json!({
        "task": task,
        "node": {
            "id": node.id,
            "role": node.role.as_str(),
            "goal": node.goal,
            "outputKey": node.output_key,
        },
        "flow": {
            "name": spec.name,
            "version": spec.version,
        },
        "mode": { "name": mode_name },
        "job": { "dependsOn": job.depends_on },
    })
}

pub fn build_job_prompt(
    node: &FlowNode,
    job: &Job,
    spec: &FlowSpec,
    mode_name: &str,
    task: &Value,
) -> JobPrompt {
    let context = prompt_context(node, job, spec, mode_name, task);
    JobPrompt {
        system: render(&node.prompt.system, &context),
        user: render(&node.prompt.user, &context),
    }
}

/// Read a task file. JSON content is kept structured; anything else becomes
/// a trimmed string.
pub fn load_task(path: &Path) -> Result<Value> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let task = match serde_json::from_str::<Value>(&contents) {
        Ok(value) => value,
        Err(_) => Value::String(contents.trim().to_string()),
    };
    debug!(path = %path.display(), structured = !task.is_string(), "task loaded");
    Ok(task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::normalize::materialize_jobs;
    use crate::flow::PromptTemplates;
    use crate::test_support::{edge, flow_spec, node};

    #[test]
    fn renders_node_flow_and_task_fields() {
        let mut b = node("b");
        b.output_key = Some("patch".to_string());
        b.prompt = PromptTemplates {
            system: "You are {{node.role}} in {{mode.name}} (flow v{{flow.version}}).".to_string(),
            user: "{{task}}\nGoal: {{node.goal}}\nAfter: {{json job.dependsOn}}\nKey: {{node.outputKey}}"
                .to_string(),
        };
        let spec = flow_spec(vec![node("a"), b], vec![edge("a", "b")]);
        let jobs = materialize_jobs(&spec);
        let b_node = spec.node("b").expect("node b");

        let prompt = build_job_prompt(b_node, &jobs[1], &spec, "review", &json!("fix the bug"));
        assert_eq!(prompt.system, "You are implementer in review (flow v1).");
        assert_eq!(
            prompt.user,
            "fix the bug\nGoal: goal for b\nAfter: [\n  \"a\"\n]\nKey: patch"
        );
    }

    #[test]
    fn loads_json_and_plain_tasks() {
        let temp = tempfile::tempdir().expect("tempdir");
        let json_path = temp.path().join("task.json");
        fs::write(&json_path, r#"{"title": "t"}"#).expect("write");
        assert_eq!(load_task(&json_path).expect("load"), json!({"title": "t"}));

        let text_path = temp.path().join("task.txt");
        fs::write(&text_path, "  add logging\n").expect("write");
        assert_eq!(load_task(&text_path).expect("load"), json!("add logging"));
    }
}
