use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::actions::FunctionHandler;
use crate::actions::builtin::ForwardOutput;
use crate::compiler::core::Compiler;
use crate::compiler::expander::Expander;
use crate::config::EngineSettings;
use crate::dsl::{Flow, Input, Job, JobId, OutputReference};
use crate::error::{FlowError, JobError, JobFailure};
use crate::runtime::blueprint::Submission;
use crate::runtime::context::Context;
use crate::runtime::response::Response;
use crate::runtime::storage::{InMemoryStateStore, StateStore};
use crate::runtime::task::{JobState, Task};
use crate::runtime::trace::{ExecutionTrace, Replacement};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    Failed,
    Cancelled,
}

/// Result of one run.
#[derive(Debug, Clone)]
pub struct Execution {
    pub run_id: Uuid,
    pub status: RunStatus,
    /// Resolved jobs, excluding replaced originals and response wrappers.
    pub outputs: HashMap<JobId, Value>,
    /// The submitted flow's designated output, if it resolved.
    pub output: Option<Value>,
    pub failures: Vec<JobFailure>,
    pub trace: ExecutionTrace,
    values: HashMap<JobId, Value>,
    redirects: HashMap<JobId, OutputReference>,
}

impl Execution {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// Number of jobs that entered the arena, bookkeeping included.
    pub fn job_count(&self) -> usize {
        self.trace.created.len()
    }

    /// Resolves a reference the way a downstream job would see it, following
    /// replacements.
    pub fn resolve(&self, reference: &OutputReference) -> Option<Value> {
        let mut current = reference.clone();
        while let Some(target) = self.redirects.get(&current.job_id) {
            current = current.rebase(target);
        }
        self.values
            .get(&current.job_id)
            .and_then(|v| current.extract(v))
    }

    pub fn output_of(&self, job_id: JobId) -> Option<Value> {
        self.resolve(&OutputReference::new(job_id))
    }

    pub fn into_outputs(self) -> Result<HashMap<JobId, Value>, FlowError> {
        if self.failures.is_empty() {
            Ok(self.outputs)
        } else {
            Err(FlowError::RunFailed(self.failures))
        }
    }
}

enum Lookup {
    Ready(Value),
    Waiting,
    Failed(JobId),
    MissingField(OutputReference),
}

enum Readiness {
    Ready(Value),
    Waiting,
    Blocked(JobError),
}

/// 单次运行的作业竞技场
struct RunState {
    run_id: Uuid,
    tasks: HashMap<JobId, Task>,
    order: Vec<JobId>,
    values: HashMap<JobId, Value>,
    redirects: HashMap<JobId, OutputReference>,
    failures: Vec<JobFailure>,
    trace: ExecutionTrace,
}

impl RunState {
    fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            tasks: HashMap::new(),
            order: Vec::new(),
            values: HashMap::new(),
            redirects: HashMap::new(),
            failures: Vec::new(),
            trace: ExecutionTrace::default(),
        }
    }

    fn insert(&mut self, task: Task) {
        let id = task.job.id;
        self.order.push(id);
        self.trace.created.push(id);
        self.tasks.insert(id, task);
    }

    fn state(&self, id: JobId) -> Option<JobState> {
        self.tasks.get(&id).map(|t| t.state)
    }

    fn pending(&self) -> Vec<JobId> {
        self.order
            .iter()
            .copied()
            .filter(|id| self.state(*id) == Some(JobState::Pending))
            .collect()
    }

    fn lookup(&self, reference: &OutputReference) -> Lookup {
        let mut current = reference.clone();
        while let Some(target) = self.redirects.get(&current.job_id) {
            current = current.rebase(target);
        }
        match self.state(current.job_id) {
            None | Some(JobState::Failed) => Lookup::Failed(current.job_id),
            Some(JobState::Resolved) => match self
                .values
                .get(&current.job_id)
                .and_then(|v| current.extract(v))
            {
                Some(v) => Lookup::Ready(v),
                None => Lookup::MissingField(current),
            },
            Some(_) => Lookup::Waiting,
        }
    }

    fn resolve_input(&self, input: &Input) -> Option<Value> {
        match input {
            Input::Value(v) => Some(v.clone()),
            Input::Reference(r) => match self.lookup(r) {
                Lookup::Ready(v) => Some(v),
                _ => None,
            },
        }
    }

    fn readiness(&self, id: JobId) -> Readiness {
        let Some(task) = self.tasks.get(&id) else {
            return Readiness::Blocked(JobError::Unresolvable);
        };
        let mut params = Map::new();
        let mut waiting = false;

        for (key, input) in &task.job.inputs {
            match input {
                Input::Value(v) => {
                    params.insert(key.clone(), v.clone());
                }
                Input::Reference(r) => match self.lookup(r) {
                    Lookup::Ready(v) => {
                        params.insert(key.clone(), v);
                    }
                    Lookup::Waiting => waiting = true,
                    Lookup::Failed(upstream) => {
                        return Readiness::Blocked(JobError::Upstream(upstream));
                    }
                    Lookup::MissingField(at) => {
                        return Readiness::Blocked(JobError::InvalidInput {
                            input: key.clone(),
                            reason: format!("output of job {} has no field {:?}", at.job_id, at.path),
                        });
                    }
                },
            }
        }

        if waiting {
            Readiness::Waiting
        } else {
            Readiness::Ready(Value::Object(params))
        }
    }
}

type Completion = (JobId, Result<Response, JobError>);

enum Event {
    Joined(Option<Result<(tokio::task::Id, Completion), tokio::task::JoinError>>),
    Cancelled,
}

/// 动态 DAG 执行引擎
///
/// Jobs reference handlers by function name. A run walks the graph in
/// dependency order, runs ready jobs on a bounded pool and applies each
/// completion (result, replacement or failure) from the scheduling loop only,
/// so splicing is atomic from the scheduler's point of view.
pub struct Engine {
    handlers: HashMap<String, Arc<dyn FunctionHandler>>,
    store: Arc<dyn StateStore>,
    settings: EngineSettings,
    cancel: CancellationToken,
}

impl Engine {
    pub fn new(settings: EngineSettings) -> Self {
        Self::new_with_storage(settings, Arc::new(InMemoryStateStore::new()))
    }

    pub fn new_with_storage(settings: EngineSettings, store: Arc<dyn StateStore>) -> Self {
        let mut engine = Self {
            handlers: HashMap::new(),
            store,
            settings,
            cancel: CancellationToken::new(),
        };
        engine.register_function(Arc::new(ForwardOutput));
        engine
    }

    pub fn register_function(&mut self, handler: Arc<dyn FunctionHandler>) {
        self.handlers.insert(handler.name().to_string(), handler);
    }

    pub fn store(&self) -> Arc<dyn StateStore> {
        self.store.clone()
    }

    /// Cancelling this token stops scheduling for every run on this engine.
    /// Running handlers finish and their results are kept.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(&self, flow: Flow) -> Result<Execution, FlowError> {
        self.run_with_id(Uuid::new_v4(), flow).await
    }

    pub async fn run_submission(&self, submission: Submission) -> Result<Execution, FlowError> {
        self.run_with_id(submission.id, submission.blueprint.into_flow())
            .await
    }

    pub async fn run_with_id(&self, run_id: Uuid, flow: Flow) -> Result<Execution, FlowError> {
        let blueprint = Compiler::new().compile(flow)?;
        if let Some(job) = blueprint
            .jobs
            .iter()
            .find(|j| !self.handlers.contains_key(&j.function))
        {
            return Err(FlowError::UnknownFunction(job.function.clone()));
        }
        self.validate_constant_jobs(&blueprint.jobs)?;

        let mut run = RunState::new(run_id);
        for job in blueprint.jobs {
            run.insert(Task::new(job, 0));
        }
        info!(run_id = %run_id, flow = %blueprint.name, jobs = run.order.len(), "Run started");

        let cancelled = self.drive(&mut run).await;

        let output = blueprint.output.as_ref().and_then(|o| run.resolve_input(o));
        let status = if cancelled {
            RunStatus::Cancelled
        } else if run.failures.is_empty() {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };
        let outputs = run
            .values
            .iter()
            .filter(|(id, _)| run.tasks.get(*id).is_some_and(|t| !t.bookkeeping))
            .map(|(id, v)| (*id, v.clone()))
            .collect();

        info!(
            run_id = %run_id,
            status = ?status,
            created = run.trace.created.len(),
            replacements = run.trace.replacements.len(),
            failed = run.failures.len(),
            "Run finished"
        );

        Ok(Execution {
            run_id,
            status,
            outputs,
            output,
            failures: run.failures,
            trace: run.trace,
            values: run.values,
            redirects: run.redirects,
        })
    }

    /// Jobs whose inputs are all constants are checked before anything runs;
    /// the rest are checked once their references resolve.
    fn validate_constant_jobs(&self, jobs: &[Job]) -> Result<(), FlowError> {
        for job in jobs {
            let Some(handler) = self.handlers.get(&job.function) else {
                continue;
            };
            let mut params = Map::new();
            for (key, input) in &job.inputs {
                let Input::Value(v) = input else {
                    break;
                };
                params.insert(key.clone(), v.clone());
            }
            if params.len() != job.inputs.len() {
                continue;
            }
            if let Err(err) = handler.validate(&Value::Object(params)) {
                return Err(match err.downcast::<FlowError>() {
                    Ok(flow_err) => flow_err,
                    Err(other) => FlowError::Config(format!("job '{}' ({}): {:#}", job.name, job.id, other)),
                });
            }
        }
        Ok(())
    }

    /// Returns `true` if the run was cancelled.
    async fn drive(&self, run: &mut RunState) -> bool {
        let mut running: JoinSet<Completion> = JoinSet::new();
        let mut in_flight: HashMap<tokio::task::Id, JobId> = HashMap::new();
        let mut cancelled = false;

        loop {
            if !cancelled && self.cancel.is_cancelled() {
                cancelled = true;
            }
            if !cancelled {
                self.schedule(run, &mut running, &mut in_flight).await;
            }

            if running.is_empty() {
                if !cancelled {
                    for id in run.pending() {
                        self.fail(run, id, JobError::Unresolvable).await;
                    }
                }
                break;
            }

            let event = tokio::select! {
                joined = running.join_next_with_id() => Event::Joined(joined),
                _ = self.cancel.cancelled(), if !cancelled => Event::Cancelled,
            };

            match event {
                Event::Cancelled => {
                    warn!(run_id = %run.run_id, in_flight = running.len(), "Run cancelled, draining running jobs");
                    cancelled = true;
                }
                Event::Joined(Some(Ok((task_id, (job_id, result))))) => {
                    in_flight.remove(&task_id);
                    self.apply(run, job_id, result).await;
                }
                Event::Joined(Some(Err(e))) => {
                    if let Some(job_id) = in_flight.remove(&e.id()) {
                        self.fail(run, job_id, JobError::Aborted(e.to_string())).await;
                    }
                }
                Event::Joined(None) => {}
            }
        }

        cancelled
    }

    async fn schedule(
        &self,
        run: &mut RunState,
        running: &mut JoinSet<Completion>,
        in_flight: &mut HashMap<tokio::task::Id, JobId>,
    ) {
        // Failures cascade to dependents that may sit earlier in creation order.
        loop {
            let mut changed = false;
            for id in run.pending() {
                if running.len() >= self.settings.max_concurrency {
                    return;
                }
                match run.readiness(id) {
                    Readiness::Waiting => {}
                    Readiness::Blocked(err) => {
                        self.fail(run, id, err).await;
                        changed = true;
                    }
                    Readiness::Ready(params) => {
                        if let Err(err) = self.spawn(run, id, params, running, in_flight) {
                            self.fail(run, id, err).await;
                            changed = true;
                        }
                    }
                }
            }
            if !changed {
                return;
            }
        }
    }

    fn spawn(
        &self,
        run: &mut RunState,
        id: JobId,
        params: Value,
        running: &mut JoinSet<Completion>,
        in_flight: &mut HashMap<tokio::task::Id, JobId>,
    ) -> Result<(), JobError> {
        let run_id = run.run_id;
        let task = run.tasks.get_mut(&id).ok_or(JobError::Unresolvable)?;
        let handler = self
            .handlers
            .get(&task.job.function)
            .cloned()
            .ok_or_else(|| JobError::UnknownFunction(task.job.function.clone()))?;

        task.state = JobState::Running;
        debug!(run_id = %run_id, job = %id, name = %task.job.name, function = %task.job.function, "Job started");

        let ctx = Context::new(
            run_id,
            id,
            task.job.name.clone(),
            task.job.metadata.clone(),
            task.depth,
            self.store.clone(),
        );
        let limit = self.settings.job_timeout_secs.map(Duration::from_secs);

        let handle = running.spawn(async move {
            let result = invoke(handler, params, ctx, limit).await;
            (id, result)
        });
        in_flight.insert(handle.id(), id);
        Ok(())
    }

    async fn apply(&self, run: &mut RunState, id: JobId, result: Result<Response, JobError>) {
        match result {
            Ok(Response::Done(value)) => self.resolve(run, id, value).await,
            Ok(Response::Replace(flow)) => {
                if let Err(err) = self.splice(run, id, flow) {
                    self.fail(run, id, err).await;
                }
            }
            Err(err) => self.fail(run, id, err).await,
        }
    }

    async fn resolve(&self, run: &mut RunState, id: JobId, value: Value) {
        let Some(task) = run.tasks.get_mut(&id) else {
            return;
        };
        task.state = JobState::Resolved;
        debug!(run_id = %run.run_id, job = %id, name = %task.job.name, "Job resolved");

        if !task.bookkeeping {
            if let Err(e) = self.store.put_output(run.run_id, id, &value).await {
                error!(run_id = %run.run_id, job = %id, error = %e, "Failed to record output");
            }
        }
        run.values.insert(id, value);
    }

    fn splice(&self, run: &mut RunState, id: JobId, flow: Flow) -> Result<(), JobError> {
        let task = run.tasks.get(&id).ok_or(JobError::Unresolvable)?;
        let depth = task.depth + 1;
        let limit = self.settings.max_replacement_depth;
        if depth > limit {
            return Err(JobError::DepthExceeded { depth, limit });
        }

        let known: HashSet<JobId> = run.tasks.keys().copied().collect();
        let plan = Expander::new(&known).expand(&task.job, flow)?;
        info!(
            run_id = %run.run_id,
            job = %id,
            name = %task.job.name,
            depth,
            injected = plan.jobs.len(),
            "Replacement spliced"
        );

        let forward_id = plan.forward.id;
        for job in plan.jobs {
            run.insert(Task::new(job, depth));
        }
        run.insert(Task::bookkeeping(plan.forward, depth));
        run.redirects.insert(id, plan.redirect);
        if let Some(task) = run.tasks.get_mut(&id) {
            task.state = JobState::Replaced;
        }
        run.trace.replacements.push(Replacement {
            origin: id,
            depth,
            flow: plan.flow,
            forward: forward_id,
        });
        Ok(())
    }

    async fn fail(&self, run: &mut RunState, id: JobId, err: JobError) {
        let Some(task) = run.tasks.get_mut(&id) else {
            return;
        };
        task.state = JobState::Failed;

        match &err {
            JobError::Upstream(_) | JobError::Unresolvable => {
                warn!(run_id = %run.run_id, job = %id, name = %task.job.name, error = %err, "Job blocked")
            }
            _ => error!(run_id = %run.run_id, job = %id, name = %task.job.name, error = %err, "Job failed"),
        }

        let failure = JobFailure {
            job_id: id,
            name: task.job.name.clone(),
            function: task.job.function.clone(),
            metadata: task.job.metadata.clone(),
            depth: task.depth,
            error: err,
        };
        if let Err(e) = self.store.put_failure(run.run_id, &failure).await {
            error!(run_id = %run.run_id, job = %id, error = %e, "Failed to record failure");
        }
        run.failures.push(failure);
    }
}

async fn invoke(
    handler: Arc<dyn FunctionHandler>,
    params: Value,
    ctx: Context,
    limit: Option<Duration>,
) -> Result<Response, JobError> {
    handler.validate(&params).map_err(JobError::from_handler)?;
    let fut = handler.execute(params, &ctx);
    match limit {
        Some(d) => match timeout(d, fut).await {
            Ok(result) => result.map_err(JobError::from_handler),
            Err(_) => Err(JobError::Timeout(d)),
        },
        None => fut.await.map_err(JobError::from_handler),
    }
}
