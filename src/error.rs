use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dsl::{JobId, Metadata};

/// Errors raised while building, validating or running a flow.
///
/// Everything here is reported to the caller directly. Failures of a single
/// job during a run are carried by [`JobError`] inside a [`JobFailure`].
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("failed to read structure file {path}: {source}")]
    StructureRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse structure file {path}: {reason}")]
    StructureParse { path: PathBuf, reason: String },

    #[error("unknown sorbate '{0}': no kinetic diameter on record")]
    UnknownSorbate(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("duplicate job id {0}")]
    DuplicateJob(JobId),

    #[error("job '{name}' ({job}) references unknown job {target}")]
    DanglingReference {
        job: JobId,
        name: String,
        target: JobId,
    },

    #[error("flow '{0}' has no members and no output")]
    EmptyFlow(String),

    #[error("output of flow '{flow}' points at job {target}, which is not a member")]
    UnreachableOutput { flow: String, target: JobId },

    #[error("dependency cycle through job {0}")]
    Cycle(JobId),

    #[error("no handler registered for function '{0}'")]
    UnknownFunction(String),

    #[error("run failed: {} job(s) failed", .0.len())]
    RunFailed(Vec<JobFailure>),

    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

/// Failure of an external scientific binary.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq)]
#[error("{tool} exited with code {exit_code:?}\nstdout: {stdout}\nstderr: {stderr}")]
pub struct ToolError {
    pub tool: String,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Diagnostic attached to a job that reached the FAILED state.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum JobError {
    #[error(transparent)]
    Tool(ToolError),

    #[error("{0}")]
    Handler(String),

    #[error("malformed replacement: {0}")]
    MalformedReplacement(String),

    #[error("replacement depth {depth} exceeds the limit of {limit}")]
    DepthExceeded { depth: usize, limit: usize },

    #[error("input '{input}' could not be resolved: {reason}")]
    InvalidInput { input: String, reason: String },

    #[error("upstream job {0} did not resolve")]
    Upstream(JobId),

    #[error("inputs can never resolve")]
    Unresolvable,

    #[error("no handler registered for function '{0}'")]
    UnknownFunction(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("handler task aborted: {0}")]
    Aborted(String),
}

impl JobError {
    /// Converts a handler error, keeping tool diagnostics intact even when the
    /// tool failure is wrapped by context or a partial assessment.
    pub fn from_handler(err: anyhow::Error) -> Self {
        match err.chain().find_map(|e| e.downcast_ref::<ToolError>()) {
            Some(tool) => JobError::Tool(tool.clone()),
            None => JobError::Handler(format!("{:#}", err)),
        }
    }
}

/// Everything a caller needs to retry the workflow a failed job belonged to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobFailure {
    pub job_id: JobId,
    pub name: String,
    pub function: String,
    pub metadata: Metadata,
    /// Replacement depth the job was created at (0 for the submitted flow).
    pub depth: usize,
    pub error: JobError,
}
