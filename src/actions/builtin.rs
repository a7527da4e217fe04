use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::actions::FunctionHandler;
use crate::runtime::context::Context;
use crate::runtime::response::Response;

pub const FORWARD_OUTPUT: &str = "forward_output";

/// Response wrapper: passes its `value` input through unchanged.
///
/// The engine injects one per replacement; it stands in for the replaced job.
#[derive(Debug)]
pub struct ForwardOutput;

#[async_trait]
impl FunctionHandler for ForwardOutput {
    fn name(&self) -> &str {
        FORWARD_OUTPUT
    }

    async fn execute(&self, params: Value, _ctx: &Context) -> Result<Response> {
        Ok(Response::Done(params.get("value").cloned().unwrap_or(Value::Null)))
    }
}
