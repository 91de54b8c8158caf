//! `kestrel eval`

use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Args;
use kestrel_core::sandbox::{SandboxBuilder, SandboxLimits};
use kestrel_core::{Config, ExecutionRequest, HostFunction, Sandbox};
use serde_json::{json, Value};

#[derive(Args)]
pub struct EvalArgs {
    /// Script file, or `-` for stdin
    pub file: String,

    /// JSON value bound to the global `input`
    #[arg(long)]
    pub input: Option<String>,

    /// Override the sandbox timeout
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Importable module as `name=path`; repeatable
    #[arg(long = "module", value_name = "NAME=PATH")]
    pub modules: Vec<String>,
}

/// Print the outcome; `false` when the script failed.
pub async fn run(args: EvalArgs, config: &Config) -> Result<bool> {
    let code = read_source(&args.file)?;
    let limits = SandboxLimits::from(&config.sandbox);
    let mut builder = host_functions(Sandbox::builder().limits(limits));
    for spec in &args.modules {
        let (name, path) = parse_module(spec)?;
        let source = std::fs::read_to_string(&path)
            .with_context(|| format!("reading module {}", path.display()))?;
        builder = builder.module(name, source);
    }
    let sandbox = builder.build();

    let mut request = ExecutionRequest::new(code);
    if let Some(input) = &args.input {
        let input: Value = serde_json::from_str(input).context("--input is not valid JSON")?;
        request = request.with_input(input);
    }
    if let Some(ms) = args.timeout_ms {
        request = request.with_timeout(Duration::from_millis(ms));
    }

    let outcome = sandbox.execute(request).await;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(!is_failure(&outcome))
}

/// Host functions available to `eval` scripts.
fn host_functions(builder: SandboxBuilder) -> SandboxBuilder {
    builder
        .function(HostFunction::sync("now", "Current time as RFC 3339", |_| {
            Ok(json!(chrono::Utc::now().to_rfc3339()))
        }))
        .function(HostFunction::asynchronous(
            "sleep",
            "Pause for the given number of milliseconds",
            |args| async move {
                let ms = args.first().and_then(Value::as_u64).unwrap_or_default();
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(Value::Null)
            },
        ))
}

fn read_source(file: &str) -> Result<String> {
    if file == "-" {
        let mut code = String::new();
        std::io::stdin().read_to_string(&mut code)?;
        return Ok(code);
    }
    std::fs::read_to_string(file).with_context(|| format!("reading {file}"))
}

fn parse_module(spec: &str) -> Result<(String, PathBuf)> {
    let (name, path) = spec
        .split_once('=')
        .ok_or_else(|| anyhow!("module must be NAME=PATH, got '{spec}'"))?;
    if name.trim().is_empty() || path.trim().is_empty() {
        return Err(anyhow!("module must be NAME=PATH, got '{spec}'"));
    }
    Ok((name.trim().to_string(), PathBuf::from(path.trim())))
}

/// Sandbox failures are objects with an `error` string.
fn is_failure(outcome: &Value) -> bool {
    outcome.get("error").is_some_and(Value::is_string)
}
