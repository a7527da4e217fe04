use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dsl::Flow;

/// What a handler hands back to the engine.
///
/// `Replace` splices `flow` in place of the calling job; the job's effective
/// output becomes the flow's designated output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "response", content = "body", rename_all = "snake_case")]
pub enum Response {
    Done(Value),
    Replace(Flow),
}

impl Response {
    pub fn done(value: impl Into<Value>) -> Self {
        Response::Done(value.into())
    }

    pub fn replace(flow: Flow) -> Self {
        Response::Replace(flow)
    }

    /// Builds a response from its optional parts. Without a flow this is a
    /// plain terminal result (`null` if no value either).
    pub fn from_parts(output: Option<Value>, replace: Option<Flow>) -> Self {
        match replace {
            Some(flow) => Response::Replace(flow),
            None => Response::Done(output.unwrap_or(Value::Null)),
        }
    }

    pub fn is_replace(&self) -> bool {
        matches!(self, Response::Replace(_))
    }
}

impl From<Value> for Response {
    fn from(v: Value) -> Self {
        Response::Done(v)
    }
}

impl From<Flow> for Response {
    fn from(f: Flow) -> Self {
        Response::Replace(f)
    }
}
