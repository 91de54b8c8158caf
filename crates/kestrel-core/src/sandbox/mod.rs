//! Sandboxed script interpreter
//!
//! Evaluates agent-written ECMAScript in a QuickJS VM created for the call
//! and torn down afterwards. The guest can reach the host only through
//! registered host functions and registered module sources. Every outcome,
//! including guest exceptions and timeouts, comes back as a JSON value.
//!
//! ```text
//!  execute(code, input) ──► spawn_blocking ──► Runtime + Context
//!        │                                          │ input  → global `input`
//!        │ wall-clock timeout                       │ fns    → globals (block_on host futures)
//!        ▼                                          │ import → registered sources only
//!   JSON value ◄──────────── marshal ◄──────────────┘
//! ```

mod engine;
mod errors;
mod marshal;
mod modules;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::SandboxSettings;
use crate::constants::sandbox::{
    DEFAULT_MAX_DEPTH, DEFAULT_MAX_STACK, DEFAULT_MEMORY_LIMIT, DEFAULT_TIMEOUT_MS,
};

/// Slack on top of the guest timeout before the outer race gives up on the
/// worker.
const WORKER_GRACE: Duration = Duration::from_millis(100);

type HostHandler = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// A host capability callable from guest code as `name(...args)`.
pub struct HostFunction {
    name: String,
    description: String,
    handler: HostHandler,
}

impl HostFunction {
    /// Function answering immediately.
    pub fn sync<F>(name: impl Into<String>, description: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            handler: Arc::new(move |args| futures::future::ready(f(args)).boxed()),
        }
    }

    /// Function backed by a future; the guest still calls it synchronously.
    pub fn asynchronous<F, Fut>(name: impl Into<String>, description: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            handler: Arc::new(move |args| f(args).boxed()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

/// Name and description of a registered host function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FunctionInfo {
    pub name: String,
    pub description: String,
}

/// Resource limits applied to every VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SandboxLimits {
    pub timeout: Duration,
    pub memory_limit: usize,
    pub max_stack: usize,
    /// Nesting limit when reading guest values back out.
    pub max_depth: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            memory_limit: DEFAULT_MEMORY_LIMIT,
            max_stack: DEFAULT_MAX_STACK,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl From<&SandboxSettings> for SandboxLimits {
    fn from(settings: &SandboxSettings) -> Self {
        Self {
            timeout: Duration::from_millis(settings.timeout_ms),
            memory_limit: settings.memory_limit_bytes,
            max_stack: settings.max_stack_bytes,
            max_depth: settings.max_marshal_depth,
        }
    }
}

/// One evaluation request.
#[derive(Debug, Clone, Default)]
pub struct ExecutionRequest {
    pub code: String,
    pub input: Option<Value>,
    /// Overrides the sandbox default timeout.
    pub timeout: Option<Duration>,
}

impl ExecutionRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            ..Default::default()
        }
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Default)]
pub struct SandboxBuilder {
    functions: Vec<Arc<HostFunction>>,
    modules: BTreeMap<String, String>,
    limits: SandboxLimits,
}

impl SandboxBuilder {
    /// Register a host function; a later function with the same name wins.
    pub fn function(mut self, function: HostFunction) -> Self {
        self.functions.retain(|f| f.name != function.name);
        self.functions.push(Arc::new(function));
        self
    }

    /// Register importable module source under `name`.
    pub fn module(mut self, name: impl Into<String>, source: impl Into<String>) -> Self {
        self.modules.insert(name.into(), source.into());
        self
    }

    pub fn limits(mut self, limits: SandboxLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn build(self) -> Sandbox {
        Sandbox {
            inner: Arc::new(SandboxInner {
                functions: self.functions,
                modules: Arc::new(self.modules),
                limits: self.limits,
            }),
        }
    }
}

pub(crate) struct SandboxInner {
    functions: Vec<Arc<HostFunction>>,
    modules: modules::ModuleSources,
    limits: SandboxLimits,
}

/// Immutable set of host functions, modules and limits. Each
/// [`Sandbox::execute`] call gets its own VM.
#[derive(Clone)]
pub struct Sandbox {
    inner: Arc<SandboxInner>,
}

impl Sandbox {
    pub fn builder() -> SandboxBuilder {
        SandboxBuilder::default()
    }

    pub fn limits(&self) -> SandboxLimits {
        self.inner.limits
    }

    pub fn functions(&self) -> Vec<FunctionInfo> {
        self.inner
            .functions
            .iter()
            .map(|f| FunctionInfo {
                name: f.name.clone(),
                description: f.description.clone(),
            })
            .collect()
    }

    pub fn modules(&self) -> Vec<String> {
        self.inner.modules.keys().cloned().collect()
    }

    /// Evaluate `request.code` and return its value or a structured error.
    ///
    /// Never fails: guest errors, missing modules and timeouts are all
    /// reported in the returned value.
    pub async fn execute(&self, request: ExecutionRequest) -> Value {
        let timeout = request.timeout.unwrap_or(self.inner.limits.timeout);
        let timeout_ms = timeout.as_millis() as u64;
        let evaluation = engine::Evaluation {
            request,
            deadline: Instant::now() + timeout,
            timeout_ms,
            handle: tokio::runtime::Handle::current(),
        };

        let inner = self.inner.clone();
        let started = Instant::now();
        let worker = tokio::task::spawn_blocking(move || engine::evaluate(&inner, evaluation));
        let value = match tokio::time::timeout(timeout + WORKER_GRACE, worker).await {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => {
                warn!(error = %e, "Sandbox worker failed");
                json!({ "error": format!("Sandbox worker failed: {e}"), "name": "InternalError" })
            }
            Err(_) => {
                warn!(timeout_ms, "Sandbox worker missed its deadline");
                errors::timeout(timeout_ms)
            }
        };
        debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            failed = value.get("error").is_some(),
            "Sandbox evaluation finished"
        );
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox() -> Sandbox {
        Sandbox::builder()
            .function(HostFunction::sync("add", "Add two numbers", |args| {
                let a = args.first().and_then(Value::as_f64).unwrap_or_default();
                let b = args.get(1).and_then(Value::as_f64).unwrap_or_default();
                Ok(json!(a + b))
            }))
            .function(HostFunction::asynchronous(
                "addLater",
                "Add two numbers after a pause",
                |args| async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    let a = args.first().and_then(Value::as_f64).unwrap_or_default();
                    let b = args.get(1).and_then(Value::as_f64).unwrap_or_default();
                    Ok(json!(a + b))
                },
            ))
            .function(HostFunction::sync("explode", "Always fails", |_| {
                anyhow::bail!("boom from host")
            }))
            .module("math", "export function double(x) { return x * 2; }")
            .build()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn input_round_trips() {
        let input = json!({
            "name": "kestrel",
            "count": 3,
            "ratio": 0.25,
            "tags": ["a", "b"],
            "nested": {"ok": true, "none": null}
        });
        let value = sandbox()
            .execute(ExecutionRequest::new("input").with_input(input.clone()))
            .await;
        assert_eq!(value, input);

        let value = sandbox().execute(ExecutionRequest::new("input")).await;
        assert_eq!(value, Value::Null);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn last_expression_is_the_result() {
        let value = sandbox()
            .execute(ExecutionRequest::new("const xs = [1, 2, 3];\nxs.map(x => x * 10)"))
            .await;
        assert_eq!(value, json!([10, 20, 30]));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn executions_are_isolated() {
        let sandbox = sandbox();
        let first = sandbox
            .execute(ExecutionRequest::new("globalThis.leak = 42; leak"))
            .await;
        assert_eq!(first, json!(42));
        let second = sandbox.execute(ExecutionRequest::new("typeof leak")).await;
        assert_eq!(second, json!("undefined"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sync_and_async_host_functions_look_the_same() {
        let sandbox = sandbox();
        assert_eq!(sandbox.execute(ExecutionRequest::new("add(3, 4)")).await, json!(7));
        assert_eq!(sandbox.execute(ExecutionRequest::new("addLater(3, 4)")).await, json!(7));
        assert_eq!(
            sandbox
                .execute(ExecutionRequest::new("addLater(add(1, 2), 4) + 1"))
                .await,
            json!(8)
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn host_errors_are_thrown_into_the_guest() {
        let sandbox = sandbox();
        let caught = sandbox
            .execute(ExecutionRequest::new(
                "let message;\ntry { explode(); } catch (e) { message = e.message; }\nmessage",
            ))
            .await;
        assert_eq!(caught, json!("boom from host"));

        let uncaught = sandbox.execute(ExecutionRequest::new("explode()")).await;
        assert_eq!(uncaught["error"], json!("boom from host"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn infinite_loops_time_out_promptly() {
        let started = Instant::now();
        let value = sandbox()
            .execute(
                ExecutionRequest::new("while (true) {}").with_timeout(Duration::from_millis(100)),
            )
            .await;
        assert_eq!(
            value,
            json!({"error": "Execution timed out after 100ms", "timeout": true})
        );
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unregistered_modules_are_not_found() {
        let value = sandbox()
            .execute(ExecutionRequest::new(
                "import { readFileSync } from 'fs';\nreadFileSync('/etc/passwd')",
            ))
            .await;
        assert_eq!(value, json!({"error": "Module not found: fs"}));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn registered_modules_resolve() {
        let value = sandbox()
            .execute(ExecutionRequest::new(
                "import { double } from 'math';\nexport default double(21);",
            ))
            .await;
        assert_eq!(value, json!({"default": 42}));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn undefined_identifiers_are_localized() {
        let value = sandbox()
            .execute(ExecutionRequest::new(
                "const a = 1;\nconst b = 2;\nconst c = a + b + x;\nc",
            ))
            .await;
        assert_eq!(value["error"], json!("'x' is not defined"));
        assert_eq!(value["name"], json!("ReferenceError"));
        assert_eq!(value["line"], json!(3));
        assert_eq!(value["column"], json!(19));
        assert_eq!(value["context"], json!("const c = a + b + x;"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn thrown_primitives_are_localized() {
        let value = sandbox()
            .execute(ExecutionRequest::new("const a = 1;\nthrow 'plain';"))
            .await;
        assert_eq!(value["error"], json!("plain"));
        assert_eq!(value["line"], json!(2));
        assert_eq!(value["column"], json!(1));
        assert_eq!(value["context"], json!("throw 'plain';"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn module_faults_point_at_the_importing_call() {
        let sandbox = Sandbox::builder()
            .module("util", "export function boom() {\n  throw new Error('kaboom');\n}")
            .build();
        let value = sandbox
            .execute(ExecutionRequest::new(
                "import { boom } from 'util';\nconst x = 1;\nboom(x);",
            ))
            .await;
        assert_eq!(value["error"], json!("kaboom"));
        assert_eq!(value["line"], json!(3));
        assert_eq!(value["context"], json!("boom(x);"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn syntax_errors_are_reported_as_values() {
        let value = sandbox().execute(ExecutionRequest::new("let = ;")).await;
        assert_eq!(value["name"], json!("SyntaxError"));
        assert!(value["error"].is_string());
    }

    #[test]
    fn introspection_lists_functions_and_modules() {
        let sandbox = sandbox();
        let names: Vec<String> = sandbox.functions().into_iter().map(|f| f.name).collect();
        assert_eq!(names, vec!["add", "addLater", "explode"]);
        assert_eq!(sandbox.modules(), vec!["math"]);
    }
}
