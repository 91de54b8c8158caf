use async_trait::async_trait;

use super::modes::{ExecutionMode, RoundInput, RoundPlan};

/// Structured tool calling: the model sees the rendered context as its
/// instructions and calls the round's tools directly.
pub struct ToolCallingMode;

#[async_trait]
impl ExecutionMode for ToolCallingMode {
    fn id(&self) -> &str {
        "tools"
    }

    fn description(&self) -> &str {
        "Structured tool calling"
    }

    async fn plan_round(&self, input: RoundInput<'_>) -> anyhow::Result<RoundPlan> {
        Ok(RoundPlan {
            instructions: input.context.render(),
            tools: input.tools,
        })
    }
}
