//! Leveled topological scheduling of a flow graph.
//!
//! Every level holds ids whose dependencies are all satisfied by earlier
//! levels, so the ids within one level may run concurrently. The output is
//! advisory: nothing here executes jobs.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::core::types::{ValidationError, ValidationErrorKind};
use crate::flow::FlowSpec;

/// Raw scheduling result. `cycle` is set when some nodes could not be leveled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Levels {
    pub levels: Vec<Vec<String>>,
    /// Unresolved node id -> its dependencies that are still unresolved.
    pub blocked_by: BTreeMap<String, Vec<String>>,
    pub cycle: Option<ValidationError>,
}

impl Levels {
    pub fn is_schedulable(&self) -> bool {
        self.cycle.is_none()
    }
}

/// Sequencing view: what must run before what.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateReport {
    pub ok: bool,
    pub errors: Vec<ValidationError>,
    pub topo: Vec<Vec<String>>,
}

/// Concurrency view. `ticks` and `parallel` carry the same level sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulateReport {
    pub ok: bool,
    pub ticks: Vec<Vec<String>>,
    pub blocked_by: BTreeMap<String, Vec<String>>,
    pub parallel: Vec<Vec<String>>,
    /// Why `ok` is false; omitted when empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ValidationError>,
}

/// Compute parallel levels with a layered Kahn walk.
///
/// Ids within a level keep node declaration order. Edges repeating the same
/// dependency count once.
pub fn compute_levels(spec: &FlowSpec) -> Levels {
    let index: HashMap<&str, usize> = spec
        .nodes
        .iter()
        .enumerate()
        .map(|(idx, node)| (node.id.as_str(), idx))
        .collect();

    // deps[i]: unique dependency indices of node i; dependents[i]: reverse.
    let mut deps: Vec<Vec<usize>> = vec![Vec::new(); spec.nodes.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); spec.nodes.len()];
    for edge in &spec.edges {
        let (Some(&from), Some(&to)) = (index.get(edge.from.as_str()), index.get(edge.to.as_str()))
        else {
            continue;
        };
        if !deps[to].contains(&from) {
            deps[to].push(from);
            dependents[from].push(to);
        }
    }

    let mut in_degree: Vec<usize> = deps.iter().map(Vec::len).collect();
    let mut resolved = vec![false; spec.nodes.len()];
    let mut remaining = spec.nodes.len();
    let mut levels = Vec::new();

    while remaining > 0 {
        let ready: Vec<usize> = (0..spec.nodes.len())
            .filter(|&idx| !resolved[idx] && in_degree[idx] == 0)
            .collect();
        if ready.is_empty() {
            break;
        }
        for &idx in &ready {
            resolved[idx] = true;
            remaining -= 1;
            for &dependent in &dependents[idx] {
                in_degree[dependent] -= 1;
            }
        }
        levels.push(
            ready
                .into_iter()
                .map(|idx| spec.nodes[idx].id.clone())
                .collect(),
        );
    }

    let mut blocked_by: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut stuck = Vec::new();
    for (idx, node) in spec.nodes.iter().enumerate() {
        if resolved[idx] {
            continue;
        }
        stuck.push(node.id.clone());
        let waiting_on: Vec<String> = deps[idx]
            .iter()
            .filter(|&&dep| !resolved[dep])
            .map(|&dep| spec.nodes[dep].id.clone())
            .collect();
        blocked_by.insert(node.id.clone(), waiting_on);
    }

    let cycle = stuck.first().map(|first| {
        ValidationError::at_node(
            ValidationErrorKind::Cycle,
            first,
            format!("dependency cycle among: {}", stuck.join(", ")),
        )
    });

    Levels {
        levels,
        blocked_by,
        cycle,
    }
}

pub fn validate(spec: &FlowSpec) -> ValidateReport {
    let computed = compute_levels(spec);
    ValidateReport {
        ok: computed.cycle.is_none(),
        errors: computed.cycle.into_iter().collect(),
        topo: computed.levels,
    }
}

pub fn simulate(spec: &FlowSpec) -> SimulateReport {
    let computed = compute_levels(spec);
    SimulateReport {
        ok: computed.cycle.is_none(),
        ticks: computed.levels.clone(),
        blocked_by: computed.blocked_by,
        parallel: computed.levels,
        errors: computed.cycle.into_iter().collect(),
    }
}
