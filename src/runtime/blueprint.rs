use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dsl::{Flow, FlowNode, Input, Job, Metadata};

/// 编译后的蓝图 (中间表示，可序列化)
///
/// A validated flow with its members flattened in declaration order. Names and
/// metadata applied by enclosing flows are already baked into each job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Blueprint {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub metadata: Metadata,
    pub jobs: Vec<Job>,
    #[serde(default)]
    pub output: Option<Input>,
}

impl Blueprint {
    /// Rebuilds a single-level flow. Ids are kept, so references stay valid.
    pub fn into_flow(self) -> Flow {
        Flow {
            id: self.id,
            name: self.name,
            jobs: self.jobs.into_iter().map(FlowNode::Job).collect(),
            output: self.output,
            metadata: self.metadata,
        }
    }
}

/// Unit handed to a queue scheduler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Submission {
    pub id: Uuid,
    pub name: String,
    /// Caller tags (structure id, priority, attempt count).
    #[serde(default)]
    pub metadata: Metadata,
    pub blueprint: Blueprint,
}

impl Submission {
    pub fn new(blueprint: Blueprint, metadata: Metadata) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: blueprint.name.clone(),
            metadata,
            blueprint,
        }
    }

    pub fn priority(&self) -> Option<i64> {
        self.metadata.get("_priority").and_then(|v| v.as_i64())
    }
}
