use serde::{Deserialize, Serialize};

use crate::dsl::Job;

/// 作业状态机
///
/// `Pending -> Running -> {Resolved | Replaced | Failed}`. A pending job can
/// also go straight to `Failed` when an upstream job will never resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Resolved,
    Replaced,
    Failed,
}

/// Arena record for one job of a run.
#[derive(Debug, Clone)]
pub struct Task {
    pub job: Job,
    pub state: JobState,
    /// 0 for jobs of the submitted flow, d+1 for jobs injected by a job at depth d.
    pub depth: usize,
    /// Response wrappers are bookkeeping and never reported.
    pub bookkeeping: bool,
}

impl Task {
    pub fn new(job: Job, depth: usize) -> Self {
        Self {
            job,
            state: JobState::Pending,
            depth,
            bookkeeping: false,
        }
    }

    pub fn bookkeeping(job: Job, depth: usize) -> Self {
        Self {
            bookkeeping: true,
            ..Self::new(job, depth)
        }
    }
}
