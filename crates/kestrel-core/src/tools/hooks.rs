//! Pre/post tool execution hooks
//!
//! Pre-hooks may veto a call before the tool body runs; post-hooks observe
//! the result. The registry installs `LoggingHook` always, and
//! `DenyListHook` when `disabled_tools` is configured.

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use std::time::Duration;

use crate::tools::registry::{ToolContext, ToolResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookResult {
    Continue,
    /// Veto the call; the reason becomes a `blocked_by_policy` error.
    Block { reason: String },
}

#[async_trait]
pub trait PreToolHook: Send + Sync {
    async fn before_execute(&self, name: &str, params: &Value, ctx: &ToolContext) -> HookResult;
}

/// Observes finished calls. The returned value is ignored by the registry.
#[async_trait]
pub trait PostToolHook: Send + Sync {
    async fn after_execute(
        &self,
        name: &str,
        ctx: &ToolContext,
        result: &ToolResult,
        duration: Duration,
    ) -> HookResult;
}

/// Blocks tools whose name matches any pattern.
pub struct DenyListHook {
    patterns: Vec<Regex>,
}

impl DenyListHook {
    pub fn new<I, S>(patterns: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|p| Regex::new(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }
}

#[async_trait]
impl PreToolHook for DenyListHook {
    async fn before_execute(&self, name: &str, _params: &Value, ctx: &ToolContext) -> HookResult {
        let Some(pattern) = self.patterns.iter().find(|p| p.is_match(name)) else {
            return HookResult::Continue;
        };
        tracing::warn!(
            tool = name,
            user_id = %ctx.user_id,
            pattern = pattern.as_str(),
            "Deny list blocked tool"
        );
        HookResult::Block {
            reason: format!("Tool '{name}' is disabled"),
        }
    }
}

/// One `info!` line per finished call, tagged with the prompt and call ids.
#[derive(Default)]
pub struct LoggingHook;

#[async_trait]
impl PostToolHook for LoggingHook {
    async fn after_execute(
        &self,
        name: &str,
        ctx: &ToolContext,
        result: &ToolResult,
        duration: Duration,
    ) -> HookResult {
        tracing::info!(
            tool = name,
            user_id = %ctx.user_id,
            prompt_id = ctx.prompt_id.as_deref().unwrap_or(""),
            call_id = ctx.tool_call_id.as_deref().unwrap_or(""),
            duration_ms = duration.as_millis() as u64,
            error_code = result.error_code().unwrap_or(""),
            "Tool call finished"
        );
        HookResult::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn deny_list_blocks_matching_tools() {
        let hook = DenyListHook::new(["^shell\\.", "^delete_"]).expect("patterns");
        let ctx = ToolContext::for_user("u1");

        let blocked = hook.before_execute("shell.exec", &json!({}), &ctx).await;
        assert_eq!(
            blocked,
            HookResult::Block {
                reason: "Tool 'shell.exec' is disabled".into()
            }
        );

        let allowed = hook.before_execute("notes.list", &json!({}), &ctx).await;
        assert_eq!(allowed, HookResult::Continue);
    }

    #[test]
    fn invalid_patterns_are_rejected() {
        assert!(DenyListHook::new(["("]).is_err());
    }

    #[tokio::test]
    async fn logging_hook_never_blocks() {
        let ctx = ToolContext::for_user("u1").with_prompt("p1").with_call("c1");
        let result = LoggingHook
            .after_execute("notes.list", &ctx, &ToolResult::error("boom"), Duration::from_millis(3))
            .await;
        assert_eq!(result, HookResult::Continue);
    }
}
