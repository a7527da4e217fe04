use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dsl::{Flow, JobId};

/// One applied replacement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Replacement {
    /// Job whose response carried the flow.
    pub origin: JobId,
    /// Depth of the injected jobs.
    pub depth: usize,
    /// The injected flow, with inherited metadata applied.
    pub flow: Flow,
    /// Response wrapper now standing in for `origin`.
    pub forward: JobId,
}

/// 执行轨迹
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecutionTrace {
    /// Every job that entered the arena, in creation order.
    pub created: Vec<JobId>,
    pub replacements: Vec<Replacement>,
}

impl ExecutionTrace {
    /// Replaced originals and response wrappers.
    pub fn bookkeeping_ids(&self) -> HashSet<JobId> {
        self.replacements
            .iter()
            .flat_map(|r| [r.origin, r.forward])
            .collect()
    }
}

/// Maps every executed job to its display name: the jobs of `root` plus the
/// jobs of every injected flow, minus bookkeeping entries.
pub fn resolve_names(root: &Flow, trace: &ExecutionTrace) -> HashMap<JobId, String> {
    let skip = trace.bookkeeping_ids();
    let mut names = HashMap::new();

    let flows = std::iter::once(root).chain(trace.replacements.iter().map(|r| &r.flow));
    for flow in flows {
        for job in flow.iter_jobs() {
            if !skip.contains(&job.id) {
                names.insert(job.id, job.name.clone());
            }
        }
    }
    names
}

/// `(display name, output)` pairs in creation order.
pub fn named_report(
    root: &Flow,
    trace: &ExecutionTrace,
    outputs: &HashMap<JobId, Value>,
) -> Vec<(String, Value)> {
    let names = resolve_names(root, trace);
    trace
        .created
        .iter()
        .filter_map(|id| Some((names.get(id)?.clone(), outputs.get(id)?.clone())))
        .collect()
}
