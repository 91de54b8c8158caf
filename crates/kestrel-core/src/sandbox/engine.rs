//! One evaluation on a fresh QuickJS runtime
//!
//! Runs on a blocking worker. The runtime, context and every guest value
//! are dropped when [`evaluate`] returns, whatever the outcome.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use once_cell::sync::Lazy;
use regex::Regex;
use rquickjs::function::Rest;
use rquickjs::{Context, Ctx, Exception, Function, Module, Object, Runtime, Value};
use serde_json::Value as Json;
use tokio::runtime::Handle;

use super::errors::{self, Failure};
use super::marshal::{js_to_json, json_to_js};
use super::modules::{MissingModule, RegisteredLoader, RegisteredResolver};
use super::{ExecutionRequest, HostFunction, SandboxInner};
use crate::constants::sandbox::{INPUT_BINDING, MAIN_MODULE};

/// Code with top-level `import`/`export` statements runs as a module.
static MODULE_SYNTAX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?m)^\s*(?:import\s*[{*'"]|import\s+[\w$]|export\s)"#).unwrap());

pub(crate) fn is_module(code: &str) -> bool {
    MODULE_SYNTAX.is_match(code)
}

pub(crate) struct Evaluation {
    pub request: ExecutionRequest,
    pub deadline: Instant,
    pub timeout_ms: u64,
    pub handle: Handle,
}

pub(crate) fn evaluate(inner: &SandboxInner, evaluation: Evaluation) -> Json {
    let timeout_ms = evaluation.timeout_ms;
    let timed_out = Arc::new(AtomicBool::new(false));
    let missing = MissingModule::default();

    let outcome = run(inner, &evaluation, &timed_out, &missing);

    // An interrupted VM surfaces as an arbitrary exception; the flag decides.
    if timed_out.load(Ordering::SeqCst) {
        return errors::timeout(timeout_ms);
    }
    if let Some(name) = missing.take() {
        return Failure::ModuleNotFound(name).into_value(timeout_ms);
    }
    match outcome {
        Ok(value) => value,
        Err(failure) => failure.into_value(timeout_ms),
    }
}

fn run(
    inner: &SandboxInner,
    evaluation: &Evaluation,
    timed_out: &Arc<AtomicBool>,
    missing: &MissingModule,
) -> Result<Json, Failure> {
    let engine = |e: rquickjs::Error| Failure::Engine(e.to_string());
    let runtime = Runtime::new().map_err(engine)?;
    runtime.set_memory_limit(inner.limits.memory_limit);
    runtime.set_max_stack_size(inner.limits.max_stack);

    let deadline = evaluation.deadline;
    let flag = timed_out.clone();
    runtime.set_interrupt_handler(Some(Box::new(move || {
        if Instant::now() >= deadline {
            flag.store(true, Ordering::SeqCst);
            return true;
        }
        false
    })));
    runtime.set_loader(
        RegisteredResolver {
            sources: inner.modules.clone(),
            missing: missing.clone(),
        },
        RegisteredLoader {
            sources: inner.modules.clone(),
        },
    );

    let context = Context::full(&runtime).map_err(engine)?;
    let max_depth = inner.limits.max_depth;
    let code = evaluation.request.code.as_str();

    context.with(|ctx| {
        let result = install_globals(&ctx, inner, evaluation, timed_out).and_then(|()| {
            if is_module(code) {
                eval_module(&ctx, code)
            } else {
                eval_script(&ctx, code)
            }
        });
        match result {
            Ok(value) => Ok(js_to_json(&value, max_depth)),
            Err(rquickjs::Error::Exception) => {
                Err(Failure::Guest(errors::capture(&ctx, code, max_depth)))
            }
            Err(e) => Err(Failure::Engine(e.to_string())),
        }
    })
}

fn eval_script<'js>(ctx: &Ctx<'js>, code: &str) -> rquickjs::Result<Value<'js>> {
    let value: Value = ctx.eval(code)?;
    match value.as_promise() {
        Some(promise) => promise.finish::<Value>(),
        None => Ok(value),
    }
}

/// Evaluate module code; the result is its namespace object.
fn eval_module<'js>(ctx: &Ctx<'js>, code: &str) -> rquickjs::Result<Value<'js>> {
    let (module, promise) = Module::declare(ctx.clone(), MAIN_MODULE, code)?.eval()?;
    promise.finish::<Value>()?;
    Ok(module.namespace()?.into_value())
}

fn install_globals<'js>(
    ctx: &Ctx<'js>,
    inner: &SandboxInner,
    evaluation: &Evaluation,
    timed_out: &Arc<AtomicBool>,
) -> rquickjs::Result<()> {
    let globals = ctx.globals();
    let input = evaluation.request.input.clone().unwrap_or(Json::Null);
    globals.set(INPUT_BINDING, json_to_js(ctx, &input)?)?;
    globals.set("console", console(ctx, inner.limits.max_depth)?)?;

    for function in inner.functions.iter() {
        let binding = host_binding(
            ctx,
            function.clone(),
            evaluation,
            timed_out,
            inner.limits.max_depth,
        )?;
        globals.set(function.name.as_str(), binding)?;
    }
    Ok(())
}

/// Guest-callable wrapper around a host function.
///
/// The guest sees a plain synchronous call: arguments are marshalled out,
/// the host future runs to completion on the tokio runtime (bounded by the
/// remaining time budget), and the result is marshalled back in.
fn host_binding<'js>(
    ctx: &Ctx<'js>,
    function: Arc<HostFunction>,
    evaluation: &Evaluation,
    timed_out: &Arc<AtomicBool>,
    max_depth: usize,
) -> rquickjs::Result<Function<'js>> {
    let handle = evaluation.handle.clone();
    let deadline = evaluation.deadline;
    let timed_out = timed_out.clone();
    Function::new(
        ctx.clone(),
        move |ctx: Ctx<'js>, args: Rest<Value<'js>>| -> rquickjs::Result<Value<'js>> {
            let args: Vec<Json> = args.0.iter().map(|arg| js_to_json(arg, max_depth)).collect();
            let remaining = deadline.saturating_duration_since(Instant::now());
            let call = (function.handler)(args);
            match handle.block_on(async { tokio::time::timeout(remaining, call).await }) {
                Ok(Ok(value)) => json_to_js(&ctx, &value),
                Ok(Err(e)) => Err(Exception::throw_message(&ctx, &format!("{e:#}"))),
                Err(_) => {
                    timed_out.store(true, Ordering::SeqCst);
                    Err(Exception::throw_message(
                        &ctx,
                        &format!("host function '{}' ran past the deadline", function.name),
                    ))
                }
            }
        },
    )
}

/// `console.log` and friends, forwarded to tracing.
fn console<'js>(ctx: &Ctx<'js>, max_depth: usize) -> rquickjs::Result<Object<'js>> {
    let console = Object::new(ctx.clone())?;
    for level in ["log", "info", "debug", "warn", "error"] {
        let method = Function::new(ctx.clone(), move |args: Rest<Value<'js>>| {
            let line = args
                .0
                .iter()
                .map(|arg| match js_to_json(arg, max_depth) {
                    Json::String(text) => text,
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join(" ");
            match level {
                "warn" => tracing::warn!(target: "kestrel::sandbox", "{line}"),
                "error" => tracing::error!(target: "kestrel::sandbox", "{line}"),
                "debug" => tracing::debug!(target: "kestrel::sandbox", "{line}"),
                _ => tracing::info!(target: "kestrel::sandbox", "{line}"),
            }
        })?;
        console.set(level, method)?;
    }
    Ok(console)
}
