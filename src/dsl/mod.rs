pub mod builder;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub type JobId = Uuid;

/// Metadata bag carried by jobs and flows.
pub type Metadata = serde_json::Map<String, Value>;

/// 对另一个 Job 未来输出的引用
///
/// `path` selects a sub-field of the source job's output: object keys, or array
/// indices written as decimal strings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct OutputReference {
    pub job_id: JobId,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<String>,
}

impl OutputReference {
    pub fn new(job_id: JobId) -> Self {
        Self { job_id, path: Vec::new() }
    }

    /// Reference to a field of this output.
    pub fn field(mut self, key: &str) -> Self {
        self.path.push(key.to_string());
        self
    }

    /// Re-roots this reference onto `target`, keeping the field path.
    /// Used when the referenced job has been replaced.
    pub fn rebase(&self, target: &OutputReference) -> OutputReference {
        let mut path = target.path.clone();
        path.extend(self.path.iter().cloned());
        OutputReference { job_id: target.job_id, path }
    }

    /// Extracts the referenced field from a resolved output.
    pub fn extract(&self, output: &Value) -> Option<Value> {
        select_path(output, &self.path)
    }
}

pub(crate) fn select_path(value: &Value, path: &[String]) -> Option<Value> {
    let mut current = value;
    for key in path {
        current = match current {
            Value::Object(map) => map.get(key)?,
            Value::Array(items) => items.get(key.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}

/// A declared job input: either concrete data or a forward reference.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Input {
    Value(Value),
    Reference(OutputReference),
}

impl Input {
    pub fn reference(&self) -> Option<&OutputReference> {
        match self {
            Input::Reference(r) => Some(r),
            Input::Value(_) => None,
        }
    }
}

impl From<OutputReference> for Input {
    fn from(r: OutputReference) -> Self {
        Input::Reference(r)
    }
}

impl From<Value> for Input {
    fn from(v: Value) -> Self {
        Input::Value(v)
    }
}

impl From<&str> for Input {
    fn from(s: &str) -> Self {
        Input::Value(Value::String(s.to_string()))
    }
}

impl From<String> for Input {
    fn from(s: String) -> Self {
        Input::Value(Value::String(s))
    }
}

impl From<bool> for Input {
    fn from(b: bool) -> Self {
        Input::Value(Value::Bool(b))
    }
}

impl From<i64> for Input {
    fn from(n: i64) -> Self {
        Input::Value(Value::from(n))
    }
}

impl From<f64> for Input {
    fn from(n: f64) -> Self {
        Input::Value(Value::from(n))
    }
}

/// 单个延迟计算单元
///
/// `function` names a handler registered on the engine, so a job stays plain
/// data and can be shipped to a remote worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub function: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, Input>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Job {
    /// Creates a job with a fresh id.
    pub fn new(name: &str, function: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            function: function.to_string(),
            inputs: BTreeMap::new(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_input(mut self, key: &str, input: impl Into<Input>) -> Self {
        self.inputs.insert(key.to_string(), input.into());
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Reference to this job's whole output.
    pub fn output(&self) -> OutputReference {
        OutputReference::new(self.id)
    }

    pub fn references(&self) -> impl Iterator<Item = &OutputReference> {
        self.inputs.values().filter_map(Input::reference)
    }

    pub fn append_name(&mut self, affix: &str, prepend: bool) {
        self.name = if prepend {
            format!("{}{}", affix, self.name)
        } else {
            format!("{}{}", self.name, affix)
        };
    }

    pub fn update_metadata(&mut self, extra: &Metadata) {
        for (k, v) in extra {
            self.metadata.insert(k.clone(), v.clone());
        }
    }
}

/// Member of a flow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum FlowNode {
    Job(Job),
    Flow(Flow),
}

impl FlowNode {
    pub fn name(&self) -> &str {
        match self {
            FlowNode::Job(j) => &j.name,
            FlowNode::Flow(f) => &f.name,
        }
    }

    /// Nested members; a job has none.
    pub fn children(&self) -> &[FlowNode] {
        match self {
            FlowNode::Job(_) => &[],
            FlowNode::Flow(f) => &f.jobs,
        }
    }

    fn append_name(&mut self, affix: &str, prepend: bool) {
        match self {
            FlowNode::Job(j) => j.append_name(affix, prepend),
            FlowNode::Flow(f) => f.append_name(affix, prepend),
        }
    }

    fn update_metadata(&mut self, extra: &Metadata) {
        match self {
            FlowNode::Job(j) => j.update_metadata(extra),
            FlowNode::Flow(f) => f.update_metadata(extra),
        }
    }
}

impl From<Job> for FlowNode {
    fn from(j: Job) -> Self {
        FlowNode::Job(j)
    }
}

impl From<Flow> for FlowNode {
    fn from(f: Flow) -> Self {
        FlowNode::Flow(f)
    }
}

/// 由 Job 与子 Flow 组成的有序图
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Flow {
    pub id: Uuid,
    pub name: String,
    pub jobs: Vec<FlowNode>,
    #[serde(default)]
    pub output: Option<Input>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Flow {
    pub fn new(name: &str, jobs: Vec<FlowNode>, output: Option<Input>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            jobs,
            output,
            metadata: Metadata::new(),
        }
    }

    /// Prefixes (or suffixes) the display name of this flow and every member.
    pub fn append_name(&mut self, affix: &str, prepend: bool) {
        self.name = if prepend {
            format!("{}{}", affix, self.name)
        } else {
            format!("{}{}", self.name, affix)
        };
        for node in &mut self.jobs {
            node.append_name(affix, prepend);
        }
    }

    /// Merges `extra` into this flow and every member. Keys already present
    /// are overwritten.
    pub fn update_metadata(&mut self, extra: &Metadata) {
        for (k, v) in extra {
            self.metadata.insert(k.clone(), v.clone());
        }
        for node in &mut self.jobs {
            node.update_metadata(extra);
        }
    }

    /// Depth-first iterator over every job, in declaration order.
    pub fn iter_jobs(&self) -> JobIter<'_> {
        JobIter { stack: vec![self.jobs.iter()] }
    }

    pub fn job_ids(&self) -> Vec<JobId> {
        self.iter_jobs().map(|j| j.id).collect()
    }

    pub fn find_job(&self, id: JobId) -> Option<&Job> {
        self.iter_jobs().find(|j| j.id == id)
    }

    /// Consumes the flow and returns its jobs flattened in declaration order.
    pub fn into_jobs(self) -> Vec<Job> {
        let mut out = Vec::new();
        flatten_into(self.jobs, &mut out);
        out
    }
}

fn flatten_into(nodes: Vec<FlowNode>, out: &mut Vec<Job>) {
    for node in nodes {
        match node {
            FlowNode::Job(j) => out.push(j),
            FlowNode::Flow(f) => flatten_into(f.jobs, out),
        }
    }
}

pub struct JobIter<'a> {
    stack: Vec<std::slice::Iter<'a, FlowNode>>,
}

impl<'a> Iterator for JobIter<'a> {
    type Item = &'a Job;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let iter = self.stack.last_mut()?;
            match iter.next() {
                Some(FlowNode::Job(j)) => return Some(j),
                Some(FlowNode::Flow(f)) => self.stack.push(f.jobs.iter()),
                None => {
                    self.stack.pop();
                }
            }
        }
    }
}
