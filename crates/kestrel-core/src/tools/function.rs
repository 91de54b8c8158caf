//! Closure-backed tools
//!
//! Lets plugins declare a tool inline instead of writing a `Tool` impl.

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;

use crate::tools::registry::{ApprovalPolicy, Tool, ToolContext, ToolResult};

type Handler = Arc<dyn Fn(Value, ToolContext) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

#[derive(Clone)]
pub struct FunctionTool {
    name: String,
    description: String,
    input_schema: Value,
    output_schema: Value,
    approval: ApprovalPolicy,
    handler: Handler,
}

impl FunctionTool {
    /// Tool backed by an async closure.
    pub fn new<F, Fut>(name: impl Into<String>, description: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Value, ToolContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: json!({ "type": "object" }),
            output_schema: json!({}),
            approval: ApprovalPolicy::Never,
            handler: Arc::new(move |input, ctx| handler(input, ctx).boxed()),
        }
    }

    /// Tool backed by a synchronous closure.
    pub fn sync<F>(name: impl Into<String>, description: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Value, &ToolContext) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        Self::new(name, description, move |input, ctx| {
            let handler = handler.clone();
            async move { handler(input, &ctx) }
        })
    }

    pub fn with_input_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }

    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.output_schema = schema;
        self
    }

    pub fn with_approval(mut self, approval: ApprovalPolicy) -> Self {
        self.approval = approval;
        self
    }

    pub fn into_arc(self) -> Arc<dyn Tool> {
        Arc::new(self)
    }
}

#[async_trait]
impl Tool for FunctionTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        self.input_schema.clone()
    }

    fn output_schema(&self) -> Value {
        self.output_schema.clone()
    }

    fn approval(&self) -> ApprovalPolicy {
        self.approval.clone()
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult {
        match (self.handler)(params, ctx.clone()).await {
            Ok(output) => ToolResult::success(output),
            Err(e) => ToolResult::error(format!("{e:#}")),
        }
    }
}
