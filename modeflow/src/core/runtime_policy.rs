//! Layered runtime policy resolution (node > mode > pack > defaults).
//!
//! Each category (model, budget, rate limit) resolves as a whole unit: the
//! first layer that defines it wins and lower layers are ignored for that
//! category entirely. There is no field-level merge.

use serde::{Deserialize, Serialize};

/// A policy fragment as it appears on a node, mode, pack, or defaults layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RuntimePolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<BudgetPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "rate_limit")]
    pub rate_limit: Option<RateLimitPolicy>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ModelPolicy {
    pub preferred: String,
    #[serde(default)]
    pub fallback: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BudgetPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "max_tokens")]
    pub max_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "max_cost_usd")]
    pub max_cost_usd: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RateLimitPolicy {
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        alias = "requests_per_minute"
    )]
    pub requests_per_minute: Option<u32>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        alias = "tokens_per_minute"
    )]
    pub tokens_per_minute: Option<u64>,
}

/// The policy layers consulted for a job, highest priority first.
#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyLayers<'a> {
    pub mode: Option<&'a RuntimePolicy>,
    pub pack: Option<&'a RuntimePolicy>,
    pub defaults: Option<&'a RuntimePolicy>,
}

/// Resolve the effective policy for a node.
pub fn resolve(
    node: Option<&RuntimePolicy>,
    mode: Option<&RuntimePolicy>,
    pack: Option<&RuntimePolicy>,
    defaults: Option<&RuntimePolicy>,
) -> RuntimePolicy {
    let layers = [node, mode, pack, defaults];
    RuntimePolicy {
        model: first_defined(&layers, |p| p.model.as_ref()),
        budget: first_defined(&layers, |p| p.budget.as_ref()),
        rate_limit: first_defined(&layers, |p| p.rate_limit.as_ref()),
    }
}

/// Resolve a node's policy against a set of lower layers.
pub fn resolve_layers(node: Option<&RuntimePolicy>, layers: &PolicyLayers<'_>) -> RuntimePolicy {
    resolve(node, layers.mode, layers.pack, layers.defaults)
}

fn first_defined<T: Clone>(
    layers: &[Option<&RuntimePolicy>],
    pick: impl Fn(&RuntimePolicy) -> Option<&T>,
) -> Option<T> {
    layers.iter().flatten().find_map(|layer| pick(layer)).cloned()
}
