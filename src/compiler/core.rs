use std::collections::{HashMap, HashSet, VecDeque};

use crate::dsl::{Flow, FlowNode, Input, Job, JobId};
use crate::error::FlowError;
use crate::runtime::blueprint::Blueprint;

/// Flattens and validates a flow into a [`Blueprint`].
///
/// Checks, in order: empty flows and unreachable flow outputs, duplicate ids,
/// dangling references, dependency cycles.
#[derive(Debug, Default)]
pub struct Compiler {
    /// Jobs that already exist outside the flow being compiled. References
    /// to them are legal, reusing their ids is not.
    known: HashSet<JobId>,
}

impl Compiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_known(known: impl IntoIterator<Item = JobId>) -> Self {
        Self {
            known: known.into_iter().collect(),
        }
    }

    pub fn compile(&self, flow: Flow) -> Result<Blueprint, FlowError> {
        // 1. Pass 1: structure
        check_structure(&flow)?;

        let Flow {
            id,
            name,
            jobs,
            output,
            metadata,
        } = flow;
        let jobs = Flow::new(&name, jobs, None).into_jobs();

        // 2. Pass 2: indexing
        let mut id_map: HashMap<JobId, usize> = HashMap::with_capacity(jobs.len());
        for (idx, job) in jobs.iter().enumerate() {
            if self.known.contains(&job.id) || id_map.insert(job.id, idx).is_some() {
                return Err(FlowError::DuplicateJob(job.id));
            }
        }

        // 3. Pass 3: references
        for job in &jobs {
            for r in job.references() {
                if !id_map.contains_key(&r.job_id) && !self.known.contains(&r.job_id) {
                    return Err(FlowError::DanglingReference {
                        job: job.id,
                        name: job.name.clone(),
                        target: r.job_id,
                    });
                }
            }
        }

        // 4. Pass 4: cycles
        check_acyclic(&jobs, &id_map)?;

        Ok(Blueprint {
            id,
            name,
            metadata,
            jobs,
            output,
        })
    }
}

fn check_structure(flow: &Flow) -> Result<(), FlowError> {
    if flow.jobs.is_empty() && flow.output.is_none() {
        return Err(FlowError::EmptyFlow(flow.name.clone()));
    }
    if let Some(Input::Reference(r)) = &flow.output {
        if flow.find_job(r.job_id).is_none() {
            return Err(FlowError::UnreachableOutput {
                flow: flow.name.clone(),
                target: r.job_id,
            });
        }
    }
    for node in &flow.jobs {
        if let FlowNode::Flow(sub) = node {
            check_structure(sub)?;
        }
    }
    Ok(())
}

/// Kahn's algorithm over the references internal to `jobs`.
fn check_acyclic(jobs: &[Job], id_map: &HashMap<JobId, usize>) -> Result<(), FlowError> {
    let mut in_degree = vec![0usize; jobs.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); jobs.len()];

    for (idx, job) in jobs.iter().enumerate() {
        let upstream: HashSet<usize> = job
            .references()
            .filter_map(|r| id_map.get(&r.job_id).copied())
            .collect();
        in_degree[idx] = upstream.len();
        for up in upstream {
            dependents[up].push(idx);
        }
    }

    let mut queue: VecDeque<usize> = (0..jobs.len()).filter(|i| in_degree[*i] == 0).collect();
    let mut visited = 0;
    while let Some(idx) = queue.pop_front() {
        visited += 1;
        for &next in &dependents[idx] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push_back(next);
            }
        }
    }

    if visited == jobs.len() {
        return Ok(());
    }
    match in_degree.iter().position(|d| *d > 0) {
        Some(idx) => Err(FlowError::Cycle(jobs[idx].id)),
        None => Ok(()),
    }
}
