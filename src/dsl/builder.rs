use crate::dsl::{Flow, FlowNode, Input, Job, JobId, Metadata, OutputReference};
use serde_json::Value;

pub struct FlowBuilder {
    name: String,
    metadata: Metadata,
    nodes: Vec<FlowNode>,
    output: Option<Input>,
    last_job: Option<JobId>,
}

impl FlowBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            metadata: Metadata::new(),
            nodes: Vec::new(),
            output: None,
            last_job: None,
        }
    }

    pub fn metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn job(mut self, job: Job) -> Self {
        self.last_job = Some(job.id);
        self.nodes.push(FlowNode::Job(job));
        self
    }

    /// 添加嵌套子 Flow
    pub fn flow(mut self, flow: Flow) -> Self {
        self.nodes.push(FlowNode::Flow(flow));
        self
    }

    pub fn function(self, name: &str, function: &str) -> JobBuilder {
        JobBuilder {
            flow_builder: self,
            job: Job::new(name, function),
        }
    }

    /// Output of the most recently added job.
    pub fn last_output(&self) -> Option<OutputReference> {
        self.last_job.map(OutputReference::new)
    }

    pub fn output(mut self, output: impl Into<Input>) -> Self {
        self.output = Some(output.into());
        self
    }

    /// Uses the most recently added job's output as the flow output.
    pub fn output_last(mut self) -> Self {
        self.output = self.last_output().map(Input::Reference);
        self
    }

    pub fn build(self) -> Flow {
        let mut flow = Flow::new(&self.name, self.nodes, self.output);
        flow.metadata = self.metadata;
        flow
    }
}

pub struct JobBuilder {
    flow_builder: FlowBuilder,
    job: Job,
}

impl JobBuilder {
    pub fn input(mut self, key: &str, input: impl Into<Input>) -> Self {
        self.job.inputs.insert(key.to_string(), input.into());
        self
    }

    pub fn metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.job.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn id(&self) -> JobId {
        self.job.id
    }

    pub fn build(self) -> FlowBuilder {
        self.flow_builder.job(self.job)
    }
}
