use std::collections::HashSet;

use crate::actions::builtin::FORWARD_OUTPUT;
use crate::compiler::core::Compiler;
use crate::dsl::{Flow, Job, JobId, OutputReference};
use crate::error::JobError;

/// 替换展开计划
pub struct SplicePlan {
    /// The injected flow after metadata inheritance.
    pub flow: Flow,
    /// Members of `flow`, flattened in declaration order.
    pub jobs: Vec<Job>,
    /// Response wrapper whose output becomes the originating job's output.
    pub forward: Job,
    /// Where references to the originating job now point.
    pub redirect: OutputReference,
}

/// Turns a job's replacement flow into a [`SplicePlan`].
pub struct Expander<'a> {
    known: &'a HashSet<JobId>,
}

impl<'a> Expander<'a> {
    /// `known` holds every job id already in the run.
    pub fn new(known: &'a HashSet<JobId>) -> Self {
        Self { known }
    }

    pub fn expand(&self, origin: &Job, mut flow: Flow) -> Result<SplicePlan, JobError> {
        let output = flow.output.clone().ok_or_else(|| {
            JobError::MalformedReplacement(format!(
                "replacement flow '{}' declares no output",
                flow.name
            ))
        })?;

        // 替换子图不能依赖被替换的作业本身
        if let Some(job) = flow
            .iter_jobs()
            .find(|j| j.references().any(|r| r.job_id == origin.id))
        {
            return Err(JobError::MalformedReplacement(format!(
                "job '{}' of the replacement references the job it replaces",
                job.name
            )));
        }

        flow.update_metadata(&origin.metadata);

        let blueprint = Compiler::with_known(self.known.iter().copied())
            .compile(flow.clone())
            .map_err(|e| JobError::MalformedReplacement(e.to_string()))?;

        let mut forward = Job::new(&origin.name, FORWARD_OUTPUT).with_input("value", output);
        forward.metadata = origin.metadata.clone();
        let redirect = forward.output();

        Ok(SplicePlan {
            flow,
            jobs: blueprint.jobs,
            forward,
            redirect,
        })
    }
}
