//! Code execution mode
//!
//! The model writes a script instead of calling tools one by one. Every tool
//! of the round becomes a sandbox global under an identifier-safe name, and
//! the model gets a single `execute_code` tool.
//!
//! Approval is enforced where a tool global is called: a gated tool throws
//! into the guest unless the `execute_code` call itself was approved. Scripts
//! that name a gated tool in their source ask for that approval up front.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use super::modes::{ExecutionMode, RoundInput, RoundPlan};
use crate::ai::AiToolCall;
use crate::sandbox::{ExecutionRequest, HostFunction, Sandbox, SandboxLimits};
use crate::tools::{ApprovalPolicy, FunctionTool, Tool, ToolContext, ToolRegistry, ToolSet};

pub const EXECUTE_CODE_TOOL: &str = "execute_code";

/// Options read from the prompt's mode switches.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CodeSwitches {
    timeout_ms: Option<u64>,
    /// Importable module sources, by name.
    modules: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct ExecuteCodeParams {
    code: String,
    #[serde(default)]
    input: Option<Value>,
}

/// Source-level hint that a script will call a gated tool.
struct GatedFunction {
    reference: Regex,
    reason: String,
}

/// What one round's scripts run against. A fresh sandbox is built per
/// `execute_code` call so tool globals act with that call's context.
struct ScriptHost {
    tools: Vec<Arc<dyn Tool>>,
    registry: Arc<ToolRegistry>,
    limits: SandboxLimits,
    modules: BTreeMap<String, String>,
}

impl ScriptHost {
    fn sandbox(&self, ctx: &ToolContext) -> Sandbox {
        let mut builder = Sandbox::builder().limits(self.limits);
        for tool in &self.tools {
            builder = builder.function(host_function(
                tool.clone(),
                self.registry.clone(),
                ctx.clone(),
            ));
        }
        for (name, source) in &self.modules {
            builder = builder.module(name.clone(), source.clone());
        }
        builder.build()
    }
}

pub struct CodeMode;

#[async_trait]
impl ExecutionMode for CodeMode {
    fn id(&self) -> &str {
        "code"
    }

    fn description(&self) -> &str {
        "Write a script that calls tools as functions inside a sandbox"
    }

    async fn plan_round(&self, input: RoundInput<'_>) -> anyhow::Result<RoundPlan> {
        let registry = input.container.get::<ToolRegistry>().await?;
        let switches: CodeSwitches = match input.switches.get("code") {
            Some(options) => serde_json::from_value(options.clone())?,
            None => CodeSwitches::default(),
        };

        let mut limits = SandboxLimits::from(&input.container.config().sandbox);
        if let Some(ms) = switches.timeout_ms {
            limits.timeout = Duration::from_millis(ms);
        }

        let mut gated = Vec::new();
        for tool in input.tools.iter() {
            if let Some(reason) = gate_reason(tool.as_ref()) {
                gated.push(GatedFunction {
                    reference: Regex::new(&format!(
                        r"(?:^|[^\w$]){}(?:$|[^\w$])",
                        regex::escape(&identifier(tool.name()))
                    ))?,
                    reason,
                });
            }
        }
        let host = Arc::new(ScriptHost {
            tools: input.tools.iter().cloned().collect(),
            registry,
            limits,
            modules: switches.modules,
        });

        let mut instructions = input.context.render();
        if !instructions.is_empty() {
            instructions.push_str("\n\n");
        }
        let preview = host.sandbox(&ToolContext::for_user(&input.prompt.user_id));
        instructions.push_str(&guide(&preview));

        let mut tools = ToolSet::new();
        tools.push(execute_code_tool(host, gated).into_arc());
        Ok(RoundPlan {
            instructions,
            tools,
        })
    }
}

/// Map a tool id onto a valid ECMAScript identifier.
pub fn identifier(name: &str) -> String {
    let mut ident: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '$' { c } else { '_' })
        .collect();
    if ident.is_empty() || ident.starts_with(|c: char| c.is_ascii_digit()) {
        ident.insert(0, '_');
    }
    ident
}

fn gate_reason(tool: &dyn Tool) -> Option<String> {
    match tool.approval() {
        ApprovalPolicy::Never => None,
        ApprovalPolicy::Always { reason } => Some(format!("script calls {}: {}", tool.name(), reason)),
        ApprovalPolicy::When(_) => Some(format!("script calls {}, which may require approval", tool.name())),
    }
}

fn host_function(tool: Arc<dyn Tool>, registry: Arc<ToolRegistry>, ctx: ToolContext) -> HostFunction {
    let ident = identifier(tool.name());
    let description = tool.description().to_string();
    HostFunction::asynchronous(ident, description, move |args: Vec<Value>| {
        let tool = tool.clone();
        let registry = registry.clone();
        let ctx = ctx.clone();
        async move {
            let params = match args.into_iter().next() {
                None | Some(Value::Null) => json!({}),
                Some(params) => params,
            };
            if !ctx.approved {
                let call = AiToolCall {
                    id: ctx.tool_call_id.clone().unwrap_or_default(),
                    name: tool.name().to_string(),
                    arguments: params.clone(),
                };
                if let Some(reason) = tool.approval().evaluate(&call) {
                    warn!(
                        tool = tool.name(),
                        prompt_id = ctx.prompt_id.as_deref().unwrap_or(""),
                        "Script called a gated tool without approval"
                    );
                    anyhow::bail!("{} requires approval: {}", tool.name(), reason);
                }
            }
            let result = registry.dispatch(tool.as_ref(), params, &ctx).await;
            if result.is_error {
                let message = result
                    .error_message()
                    .map(str::to_string)
                    .unwrap_or_else(|| result.to_model_text());
                anyhow::bail!("{}: {}", tool.name(), message);
            }
            Ok(result.output)
        }
    })
}

fn execute_code_tool(host: Arc<ScriptHost>, gated: Vec<GatedFunction>) -> FunctionTool {
    let approval = if gated.is_empty() {
        ApprovalPolicy::Never
    } else {
        ApprovalPolicy::when(move |call| {
            let code = call.arguments.get("code")?.as_str()?;
            let reasons: Vec<&str> = gated
                .iter()
                .filter(|g| g.reference.is_match(code))
                .map(|g| g.reason.as_str())
                .collect();
            (!reasons.is_empty()).then(|| reasons.join("; "))
        })
    };

    FunctionTool::new(
        EXECUTE_CODE_TOOL,
        "Run an ECMAScript program in a sandbox. Tools are available as global functions taking one object argument; the value of the last expression is returned. `input` holds the optional input value.",
        move |params: Value, ctx: ToolContext| {
            let host = host.clone();
            async move {
                let params: ExecuteCodeParams = serde_json::from_value(params)?;
                let mut request = ExecutionRequest::new(params.code);
                if let Some(input) = params.input {
                    request = request.with_input(input);
                }
                Ok(host.sandbox(&ctx).execute(request).await)
            }
        },
    )
    .with_input_schema(json!({
        "type": "object",
        "properties": {
            "code": { "type": "string", "description": "Program source" },
            "input": { "description": "Value bound to the global `input`" }
        },
        "required": ["code"]
    }))
    .with_approval(approval)
}

/// Instruction block describing the sandbox globals and modules.
fn guide(sandbox: &Sandbox) -> String {
    let mut text = format!(
        "Use the `{EXECUTE_CODE_TOOL}` tool to run ECMAScript. Calls are synchronous; do not await them."
    );
    let functions = sandbox.functions();
    if !functions.is_empty() {
        text.push_str("\n\nFunctions:");
        for function in functions {
            text.push_str(&format!("\n- {}(args): {}", function.name, function.description));
        }
    }
    let modules = sandbox.modules();
    if !modules.is_empty() {
        text.push_str(&format!("\n\nImportable modules: {}", modules.join(", ")));
    }
    text
}
