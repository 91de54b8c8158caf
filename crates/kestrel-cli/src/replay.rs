//! `kestrel replay`

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use kestrel_core::secrets::{EnvSecrets, FileSecrets};
use kestrel_core::storage::{Database, SqlitePromptStore};
use kestrel_core::{
    paths, Config, Container, CreatePrompt, EventBus, ExecutorState, ModelClient, PluginHost,
    PromptService, PromptStore, ScriptedModel, SecretsProvider,
};
use serde_json::json;
use tracing::info;

use crate::plugins::{ClockPlugin, NotesPlugin};

#[derive(Args)]
pub struct ReplayArgs {
    /// JSON file with the scripted model steps
    pub script: PathBuf,

    /// Execution mode (defaults to the configured one)
    #[arg(long)]
    pub mode: Option<String>,

    /// Approve every tool call without asking
    #[arg(long)]
    pub auto_approve: bool,

    #[arg(long, default_value = "local")]
    pub user: String,

    /// Prompt input
    #[arg(long, default_value = "")]
    pub input: String,
}

/// Run one prompt to completion; `false` when it ended with an error.
pub async fn run(args: ReplayArgs, config: Config) -> Result<bool> {
    let script = std::fs::read_to_string(&args.script)
        .with_context(|| format!("reading {}", args.script.display()))?;
    let model = ScriptedModel::from_json(&script).context("parsing model script")?;

    let container = Container::new(config.clone(), secrets()?);
    if let Some(path) = &config.database_path {
        let db = Database::new(path)?;
        container.set::<dyn PromptStore>(Arc::new(SqlitePromptStore::new(Arc::new(db))));
    }
    container.set::<dyn ModelClient>(Arc::new(model));

    let host = container.get::<PluginHost>().await?;
    host.register_from_config(Arc::new(ClockPlugin)).await?;
    host.register_from_config(Arc::new(NotesPlugin::new())).await?;
    host.start().await?;

    let bus = container.get::<EventBus>().await?;
    let listener = bus.listen_all(|envelope| {
        if let Ok(line) = serde_json::to_string(envelope) {
            println!("{line}");
        }
    });

    let service = container.get::<PromptService>().await?;
    let mut request = CreatePrompt::new(&args.user, &args.input);
    if let Some(mode) = &args.mode {
        request = request.with_mode(mode);
    }
    let handle = service.create(request).await?;
    info!(prompt_id = %handle.id(), "Replaying prompt");

    let mut run = handle.run()?;
    loop {
        let ExecutorState::WaitingApproval { call_id, tool, reason } = run.wait_for_approval().await
        else {
            break;
        };
        if args.auto_approve || ask(&tool, &reason).await? {
            handle.approve(&call_id)?;
        } else {
            handle.reject(&call_id, "declined by operator")?;
        }
    }

    let (prompt, _) = run.wait().await?;
    listener.cancel();
    println!(
        "{}",
        json!({
            "prompt_id": prompt.id,
            "rounds": prompt.rounds,
            "text": prompt.text(),
            "usage": prompt.usage,
            "error": prompt.error,
        })
    );
    container.destroy().await;
    Ok(prompt.error.is_none())
}

fn secrets() -> Result<Arc<dyn SecretsProvider>> {
    if paths::secrets_path().exists() {
        return Ok(Arc::new(FileSecrets::load()?));
    }
    Ok(Arc::new(EnvSecrets::default()))
}

/// Ask on the terminal; anything but `y` declines.
async fn ask(tool: &str, reason: &str) -> Result<bool> {
    let question = format!("Run {tool}? ({reason}) [y/N] ");
    let answer = tokio::task::spawn_blocking(move || -> std::io::Result<String> {
        let mut stderr = std::io::stderr();
        stderr.write_all(question.as_bytes())?;
        stderr.flush()?;
        let mut line = String::new();
        std::io::stdin().lock().read_line(&mut line)?;
        Ok(line)
    })
    .await??;
    Ok(answer.trim().eq_ignore_ascii_case("y"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(dir: &tempfile::TempDir, script: &str) -> ReplayArgs {
        let path = dir.path().join("script.json");
        std::fs::write(&path, script).expect("write script");
        ReplayArgs {
            script: path,
            mode: None,
            auto_approve: true,
            user: "tester".into(),
            input: "remember to buy milk".into(),
        }
    }

    #[tokio::test]
    async fn scripted_tool_calls_run_against_the_demo_plugins() {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = r#"[
            {"tool_calls": [{"id": "c1", "name": "notes.add", "arguments": {"text": "buy milk"}}]},
            {"tool_calls": [{"id": "c2", "name": "notes.delete", "arguments": {"id": 1}}]},
            {"text": "Done"}
        ]"#;
        let config = Config {
            database_path: Some(dir.path().join("kestrel.db")),
            ..Config::default()
        };

        let ok = run(args(&dir, script), config).await.expect("replay");
        assert!(ok);
        assert!(dir.path().join("kestrel.db").exists());
    }

    #[tokio::test]
    async fn model_failures_report_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ok = run(args(&dir, r#"[{"error": "provider unavailable"}]"#), Config::default())
            .await
            .expect("replay");
        assert!(!ok);
    }

    #[tokio::test]
    async fn malformed_scripts_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(run(args(&dir, "{ not json"), Config::default()).await.is_err());
    }
}
