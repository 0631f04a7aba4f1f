//! Lenient `{{path}}` / `{{json path}}` substitution for prompt templates.
//!
//! Lookups never fail: a missing path renders as an empty string (bare tags)
//! or `null` (json tags), so partially filled templates still render.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::Value;

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*(json\s+)?([A-Za-z0-9_$-]+(?:\.[A-Za-z0-9_$-]+)*)\s*\}\}")
        .expect("template tag pattern is valid")
});

/// Render `template` against `context`.
///
/// Every tag is substituted exactly once, in a single scan, so text produced
/// by a json tag is never re-scanned for bare tags.
pub fn render(template: &str, context: &Value) -> String {
    TAG_RE
        .replace_all(template, |caps: &Captures<'_>| {
            let path = &caps[2];
            let value = lookup(context, path);
            if caps.get(1).is_some() {
                render_json(value)
            } else {
                render_plain(value)
            }
        })
        .into_owned()
}

/// Resolve a dotted path by sequential property lookup. Array segments are
/// numeric indices.
pub fn lookup<'a>(context: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(context, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|idx| items.get(idx)),
        _ => None,
    })
}

fn render_json(value: Option<&Value>) -> String {
    match value {
        Some(value) => serde_json::to_string_pretty(value).unwrap_or_else(|_| "null".to_string()),
        None => "null".to_string(),
    }
}

/// Plain coercion: arrays join their rendered items with `,`, objects
/// fall back to compact JSON.
fn render_plain(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| render_plain(Some(item)))
            .collect::<Vec<_>>()
            .join(","),
        Some(object) => object.to_string(),
    }
}
