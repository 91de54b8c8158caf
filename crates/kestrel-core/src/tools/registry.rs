//! Tool registry for managing available tools
//!
//! Global registrations live in [`ToolRegistry`]; each round works from a
//! [`ToolSet`] snapshot that plugins extend during `prepare`. Execution goes
//! through the registry so input validation, timeouts and pre/post hooks
//! apply no matter where the tool came from.

use anyhow::Context as _;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::ai::types::{AiTool, AiToolCall};
use crate::container::{Container, Service};
use crate::schema::Schema;
use crate::secrets::{SecretsProvider, StaticSecrets};
use crate::tools::hooks::{DenyListHook, HookResult, LoggingHook, PostToolHook, PreToolHook};

/// Tool execution result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub output: Value,
    pub is_error: bool,
}

impl ToolResult {
    /// Create a success result
    pub fn success(output: Value) -> Self {
        Self {
            output,
            is_error: false,
        }
    }

    pub fn success_text(text: impl Into<String>) -> Self {
        Self::success(Value::String(text.into()))
    }

    /// Create a structured error with explicit code.
    pub fn error_with_code(code: &str, msg: impl fmt::Display) -> Self {
        Self {
            output: json!({
                "code": code,
                "message": msg.to_string()
            }),
            is_error: true,
        }
    }

    /// Create an invalid-parameters error.
    pub fn invalid_parameters(msg: impl fmt::Display) -> Self {
        Self::error_with_code("invalid_parameters", msg)
    }

    /// Create an error result, classifying the code from the message
    pub fn error(msg: impl fmt::Display) -> Self {
        let message = msg.to_string();
        let code = classify_error_code(&message);
        Self::error_with_code(code, message)
    }

    /// Error code, for error results.
    pub fn error_code(&self) -> Option<&str> {
        if !self.is_error {
            return None;
        }
        self.output.get("code").and_then(Value::as_str)
    }

    /// Error message, for error results.
    pub fn error_message(&self) -> Option<&str> {
        if !self.is_error {
            return None;
        }
        self.output.get("message").and_then(Value::as_str)
    }

    /// Text form handed back to the model.
    pub fn to_model_text(&self) -> String {
        match &self.output {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        }
    }
}

/// Parse tool parameters, returning a ToolResult error on failure
pub fn parse_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, ToolResult> {
    serde_json::from_value(params)
        .map_err(|e| ToolResult::invalid_parameters(format!("Invalid parameters: {}", e)))
}

fn classify_error_code(message: &str) -> &'static str {
    let lower = message.to_ascii_lowercase();
    if lower.contains("invalid parameters")
        || lower.contains("missing field")
        || lower.contains("unknown field")
    {
        "invalid_parameters"
    } else if lower.contains("timed out") || lower.contains("timeout") {
        "timeout"
    } else if lower.contains("denied") {
        "permission_denied"
    } else if lower.contains("unknown tool") {
        "unknown_tool"
    } else {
        "tool_error"
    }
}

/// Whether a call must wait for a human decision.
#[derive(Clone, Default)]
pub enum ApprovalPolicy {
    #[default]
    Never,
    Always {
        reason: String,
    },
    /// Returns the reason when the given call needs approval.
    When(Arc<dyn Fn(&AiToolCall) -> Option<String> + Send + Sync>),
}

impl ApprovalPolicy {
    pub fn always(reason: impl Into<String>) -> Self {
        Self::Always {
            reason: reason.into(),
        }
    }

    pub fn when(predicate: impl Fn(&AiToolCall) -> Option<String> + Send + Sync + 'static) -> Self {
        Self::When(Arc::new(predicate))
    }

    /// `Some(reason)` when this call requires approval.
    pub fn evaluate(&self, call: &AiToolCall) -> Option<String> {
        match self {
            Self::Never => None,
            Self::Always { reason } => Some(reason.clone()),
            Self::When(predicate) => predicate(call),
        }
    }

    pub fn is_never(&self) -> bool {
        matches!(self, Self::Never)
    }
}

impl fmt::Debug for ApprovalPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Never => f.write_str("Never"),
            Self::Always { reason } => f.debug_struct("Always").field("reason", reason).finish(),
            Self::When(_) => f.write_str("When(..)"),
        }
    }
}

/// Context for tool execution
#[derive(Clone)]
pub struct ToolContext {
    /// Acting user; secrets and stored data are partitioned by it.
    pub user_id: String,
    pub prompt_id: Option<String>,
    pub tool_call_id: Option<String>,
    pub secrets: Arc<dyn SecretsProvider>,
    pub container: Option<Container>,
    /// Optional per-call timeout override
    pub timeout: Option<Duration>,
    /// Set when the call went through an approval and was approved.
    pub approved: bool,
}

impl ToolContext {
    pub fn new(user_id: impl Into<String>, secrets: Arc<dyn SecretsProvider>) -> Self {
        Self {
            user_id: user_id.into(),
            prompt_id: None,
            tool_call_id: None,
            secrets,
            container: None,
            timeout: None,
            approved: false,
        }
    }

    /// Context with no secrets available.
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self::new(user_id, Arc::new(StaticSecrets::new()))
    }

    pub fn with_container(mut self, container: Container) -> Self {
        self.container = Some(container);
        self
    }

    pub fn with_prompt(mut self, prompt_id: impl Into<String>) -> Self {
        self.prompt_id = Some(prompt_id.into());
        self
    }

    pub fn with_call(mut self, tool_call_id: impl Into<String>) -> Self {
        self.tool_call_id = Some(tool_call_id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_approval_granted(mut self) -> Self {
        self.approved = true;
        self
    }

    /// Resolve a secret for the acting user.
    pub async fn secret(&self, id: &str) -> anyhow::Result<Option<String>> {
        self.secrets.get(&self.user_id, id).await
    }
}

/// Trait for tool implementations
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name, unique within a registry
    fn name(&self) -> &str;

    /// Tool description for AI
    fn description(&self) -> &str;

    /// JSON schema for parameters
    fn parameters_schema(&self) -> Value;

    /// JSON schema for successful output
    fn output_schema(&self) -> Value {
        json!({})
    }

    fn approval(&self) -> ApprovalPolicy {
        ApprovalPolicy::Never
    }

    /// Execute the tool
    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult;
}

fn ai_tool(tool: &dyn Tool) -> AiTool {
    AiTool {
        name: tool.name().to_string(),
        description: tool.description().to_string(),
        input_schema: tool.parameters_schema(),
    }
}

/// The tools available for one round. Pushing a name that is already present
/// replaces it in place.
#[derive(Clone, Default)]
pub struct ToolSet {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, tool: Arc<dyn Tool>) {
        match self.tools.iter().position(|t| t.name() == tool.name()) {
            Some(index) => self.tools[index] = tool,
            None => self.tools.push(tool),
        }
    }

    pub fn extend(&mut self, tools: impl IntoIterator<Item = Arc<dyn Tool>>) {
        for tool in tools {
            self.push(tool);
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Tool>> {
        self.tools.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn ai_tools(&self) -> Vec<AiTool> {
        self.tools.iter().map(|t| ai_tool(t.as_ref())).collect()
    }
}

impl fmt::Debug for ToolSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

type RegistrationHook = Arc<dyn Fn(&Arc<dyn Tool>) + Send + Sync>;

/// Registry for managing tools with hook support
pub struct ToolRegistry {
    tools: RwLock<BTreeMap<String, Arc<dyn Tool>>>,
    /// Default timeout for tool execution
    default_timeout: Duration,
    /// Pre-execution hooks (run before each tool)
    pre_hooks: RwLock<Vec<Arc<dyn PreToolHook>>>,
    /// Post-execution hooks (run after each tool)
    post_hooks: RwLock<Vec<Arc<dyn PostToolHook>>>,
    registration_hooks: RwLock<Vec<RegistrationHook>>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::with_timeout(crate::constants::DEFAULT_TOOL_TIMEOUT)
    }

    pub fn with_timeout(default_timeout: Duration) -> Self {
        Self {
            tools: RwLock::new(BTreeMap::new()),
            default_timeout,
            pre_hooks: RwLock::new(Vec::new()),
            post_hooks: RwLock::new(Vec::new()),
            registration_hooks: RwLock::new(Vec::new()),
        }
    }

    /// Register a tool, replacing any tool with the same name
    pub fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.write().insert(name.clone(), tool.clone()).is_some() {
            tracing::debug!(tool = %name, "Replaced registered tool");
        }
        let hooks: Vec<RegistrationHook> = self.registration_hooks.read().clone();
        for hook in hooks {
            hook(&tool);
        }
    }

    /// Called synchronously for every later registration.
    pub fn on_tool_registered(&self, hook: impl Fn(&Arc<dyn Tool>) + Send + Sync + 'static) {
        self.registration_hooks.write().push(Arc::new(hook));
    }

    /// Add a pre-execution hook
    pub fn add_pre_hook(&self, hook: Arc<dyn PreToolHook>) {
        self.pre_hooks.write().push(hook);
    }

    /// Add a post-execution hook
    pub fn add_post_hook(&self, hook: Arc<dyn PostToolHook>) {
        self.post_hooks.write().push(hook);
    }

    /// Get a tool by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.read().keys().cloned().collect()
    }

    /// Snapshot of the global registrations for one round.
    pub fn snapshot(&self) -> ToolSet {
        let mut set = ToolSet::new();
        set.extend(self.tools.read().values().cloned());
        set
    }

    /// Get all tools as AI tool definitions
    pub fn get_ai_tools(&self) -> Vec<AiTool> {
        self.tools
            .read()
            .values()
            .map(|t| ai_tool(t.as_ref()))
            .collect()
    }

    /// Unregister all tools with names starting with the given prefix
    pub fn unregister_by_prefix(&self, prefix: &str) {
        let mut tools = self.tools.write();
        let to_remove: Vec<String> = tools
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect();

        for name in to_remove {
            tools.remove(&name);
            tracing::debug!("Unregistered tool: {}", name);
        }
    }

    /// Execute a registered tool by name with hooks and timeout
    pub async fn execute(
        &self,
        name: &str,
        params: Value,
        ctx: &ToolContext,
    ) -> Option<ToolResult> {
        let tool = self.get(name)?;
        Some(self.dispatch(tool.as_ref(), params, ctx).await)
    }

    /// Validate input, run hooks, and execute `tool` under the timeout.
    pub async fn dispatch(&self, tool: &dyn Tool, params: Value, ctx: &ToolContext) -> ToolResult {
        let name = tool.name();
        let timeout = ctx.timeout.unwrap_or(self.default_timeout);
        let start = Instant::now();

        if let Err(result) = validate_input(tool, &params) {
            tracing::info!(tool = name, "Rejected tool input");
            return result;
        }

        // Run pre-hooks - they can block execution
        let pre_hooks: Vec<Arc<dyn PreToolHook>> = self.pre_hooks.read().clone();
        for hook in &pre_hooks {
            match hook.before_execute(name, &params, ctx).await {
                HookResult::Continue => {}
                HookResult::Block { reason } => {
                    tracing::info!(tool = name, reason = %reason, "Pre-hook blocked execution");
                    return ToolResult::error_with_code("blocked_by_policy", reason);
                }
            }
        }

        // Execute the tool with timeout
        let result = match tokio::time::timeout(timeout, tool.execute(params, ctx)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    tool = name,
                    timeout_secs = timeout.as_secs(),
                    "Tool execution timed out"
                );
                ToolResult::error_with_code(
                    "timeout",
                    format!(
                        "Tool '{}' timed out after {} seconds",
                        name,
                        timeout.as_secs()
                    ),
                )
            }
        };

        if !result.is_error {
            check_output(tool, &result.output);
        }

        let duration = start.elapsed();

        let post_hooks: Vec<Arc<dyn PostToolHook>> = self.post_hooks.read().clone();
        for hook in &post_hooks {
            let _ = hook.after_execute(name, ctx, &result, duration).await;
        }

        result
    }
}

fn validate_input(tool: &dyn Tool, params: &Value) -> Result<(), ToolResult> {
    let schema = Schema::new(tool.parameters_schema()).map_err(|e| {
        ToolResult::error_with_code("invalid_schema", format!("Tool '{}': {}", tool.name(), e))
    })?;
    schema
        .check(params)
        .map_err(|message| ToolResult::invalid_parameters(format!("Invalid parameters: {message}")))
}

fn check_output(tool: &dyn Tool, output: &Value) {
    let Ok(schema) = Schema::new(tool.output_schema()) else {
        return;
    };
    if let Err(message) = schema.check(output) {
        tracing::warn!(tool = tool.name(), %message, "Tool output does not match its schema");
    }
}

#[async_trait]
impl Service for ToolRegistry {
    async fn create(container: &Container) -> anyhow::Result<Self> {
        let config = container.config();
        let registry = Self::with_timeout(config.tool_timeout());
        if !config.disabled_tools.is_empty() {
            let deny = DenyListHook::new(&config.disabled_tools).context("disabled_tools")?;
            registry.add_pre_hook(Arc::new(deny));
        }
        registry.add_post_hook(Arc::new(LoggingHook));
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::hooks::{HookResult, PreToolHook};
    use parking_lot::Mutex;
    use serde_json::json;

    struct TestTool;

    #[async_trait]
    impl Tool for TestTool {
        fn name(&self) -> &str {
            "test_tool"
        }

        fn description(&self) -> &str {
            "Test tool"
        }

        fn parameters_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": { "n": { "type": "integer" } },
                "additionalProperties": false
            })
        }

        async fn execute(&self, params: Value, _ctx: &ToolContext) -> ToolResult {
            ToolResult::success(json!({ "echo": params }))
        }
    }

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }

        fn description(&self) -> &str {
            "Never finishes in time"
        }

        fn parameters_schema(&self) -> Value {
            json!({})
        }

        async fn execute(&self, _params: Value, _ctx: &ToolContext) -> ToolResult {
            tokio::time::sleep(Duration::from_secs(5)).await;
            ToolResult::success_text("late")
        }
    }

    struct AlwaysBlockHook;

    #[async_trait]
    impl PreToolHook for AlwaysBlockHook {
        async fn before_execute(
            &self,
            _name: &str,
            _params: &Value,
            _ctx: &ToolContext,
        ) -> HookResult {
            HookResult::Block {
                reason: "blocked for test".to_string(),
            }
        }
    }

    #[tokio::test]
    async fn test_tool_registry_nonexistent_tool() {
        let registry = ToolRegistry::new();
        let ctx = ToolContext::for_user("u1");

        let result = registry.execute("nonexistent_tool", json!({}), &ctx).await;

        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_execute_validates_input() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(TestTool));
        let ctx = ToolContext::for_user("u1");

        let ok = registry
            .execute("test_tool", json!({"n": 1}), &ctx)
            .await
            .expect("tool");
        assert_eq!(ok, ToolResult::success(json!({"echo": {"n": 1}})));

        let bad = registry
            .execute("test_tool", json!({"n": "one"}), &ctx)
            .await
            .expect("tool");
        assert!(bad.is_error);
        assert_eq!(bad.error_code(), Some("invalid_parameters"));
    }

    #[tokio::test]
    async fn test_pre_hook_can_block_execution() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(TestTool));
        registry.add_pre_hook(Arc::new(AlwaysBlockHook));

        let result = registry
            .execute("test_tool", json!({}), &ToolContext::for_user("u1"))
            .await
            .expect("tool");
        assert_eq!(result.error_code(), Some("blocked_by_policy"));
        assert_eq!(result.error_message(), Some("blocked for test"));
    }

    #[tokio::test]
    async fn test_disabled_tools_from_config_are_blocked() {
        let config = crate::config::Config {
            disabled_tools: vec!["^test_".to_string()],
            ..Default::default()
        };
        let container = Container::new(config, Arc::new(StaticSecrets::new()));
        let registry = container.get::<ToolRegistry>().await.expect("registry");
        registry.register(Arc::new(TestTool));

        let result = registry
            .execute("test_tool", json!({}), &ToolContext::for_user("u1"))
            .await
            .expect("tool");
        assert_eq!(result.error_code(), Some("blocked_by_policy"));
        assert_eq!(result.error_message(), Some("Tool 'test_tool' is disabled"));
    }

    #[tokio::test]
    async fn test_execute_times_out() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(SlowTool));
        let ctx = ToolContext::for_user("u1").with_timeout(Duration::from_millis(20));

        let result = registry.execute("slow", json!({}), &ctx).await.expect("tool");
        assert_eq!(result.error_code(), Some("timeout"));
    }

    #[tokio::test]
    async fn test_registration_replaces_and_notifies() {
        let registry = ToolRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        registry.on_tool_registered(move |tool| s.lock().push(tool.name().to_string()));

        registry.register(Arc::new(TestTool));
        registry.register(Arc::new(TestTool));
        registry.register(Arc::new(SlowTool));

        assert_eq!(*seen.lock(), vec!["test_tool", "test_tool", "slow"]);
        assert_eq!(registry.names(), vec!["slow", "test_tool"]);

        registry.unregister_by_prefix("test");
        assert_eq!(registry.names(), vec!["slow"]);
    }

    #[test]
    fn test_tool_set_last_push_wins_in_place() {
        let mut set = ToolSet::new();
        set.push(Arc::new(TestTool));
        set.push(Arc::new(SlowTool));
        set.push(Arc::new(TestTool));
        assert_eq!(set.names(), vec!["test_tool", "slow"]);
        assert_eq!(set.ai_tools()[1].name, "slow");
    }

    #[test]
    fn test_approval_policy_evaluation() {
        let call = AiToolCall {
            id: "c1".into(),
            name: "shell".into(),
            arguments: json!({"command": "rm -rf build"}),
        };
        assert_eq!(ApprovalPolicy::Never.evaluate(&call), None);
        assert_eq!(
            ApprovalPolicy::always("destructive").evaluate(&call),
            Some("destructive".to_string())
        );
        let policy = ApprovalPolicy::when(|call| {
            call.arguments["command"]
                .as_str()
                .filter(|c| c.starts_with("rm"))
                .map(|c| format!("Runs `{c}`"))
        });
        assert_eq!(policy.evaluate(&call), Some("Runs `rm -rf build`".to_string()));
    }

    #[test]
    fn test_tool_result_error_envelope() {
        let result = ToolResult::error("Test error");
        assert!(result.is_error);
        assert_eq!(result.output["message"], "Test error");
        assert_eq!(result.output["code"], "tool_error");
        assert_eq!(ToolResult::error("Unknown tool: x").error_code(), Some("unknown_tool"));
        assert_eq!(ToolResult::success_text("ok").to_model_text(), "ok");
    }

    #[tokio::test]
    async fn test_parse_params_invalid_json() {
        #[derive(serde::Deserialize, Debug)]
        struct TestParams {
            #[serde(rename = "name")]
            _name: String,
        }

        let params = json!({"name": 123}); // Wrong type
        let err = parse_params::<TestParams>(params).unwrap_err();
        assert!(err.is_error);
        assert_eq!(err.error_code(), Some("invalid_parameters"));
    }
}
