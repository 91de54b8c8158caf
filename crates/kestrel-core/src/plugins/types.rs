use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::container::Container;
use crate::context::Context;
use crate::prompt::Prompt;
use crate::secrets::SecretsProvider;
use crate::state::StateSlot;
use crate::tools::ToolSet;

/// Which lifecycle hooks a plugin implements. The host only calls hooks
/// whose flag is set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PluginHooks {
    pub setup: bool,
    pub prepare: bool,
    pub ready: bool,
}

impl PluginHooks {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_setup(mut self) -> Self {
        self.setup = true;
        self
    }

    pub fn with_prepare(mut self) -> Self {
        self.prepare = true;
        self
    }

    pub fn with_ready(mut self) -> Self {
        self.ready = true;
        self
    }
}

/// Passed to [`Plugin::setup`] once per registration.
pub struct SetupContext<'a> {
    pub container: &'a Container,
    pub secrets: Arc<dyn SecretsProvider>,
    /// Validated plugin config.
    pub config: &'a Value,
}

/// Passed to [`Plugin::ready`] once all plugins are registered.
pub struct ReadyContext<'a> {
    pub container: &'a Container,
    pub config: &'a Value,
}

/// Passed to [`Plugin::prepare`] at the start of every model round.
pub struct PrepareContext<'a> {
    pub config: &'a Value,
    /// Shared context buffer for this round; push to contribute.
    pub context: &'a mut Context,
    /// This round's tools; pushing an existing name replaces it.
    pub tools: &'a mut ToolSet,
    /// This plugin's own state record.
    pub state: StateSlot<'a>,
    /// Earlier prompts of the acting user, oldest first.
    pub history: &'a [Prompt],
    pub user_id: &'a str,
    pub prompt_id: &'a str,
    pub input: &'a str,
    /// 1-based round number.
    pub round: usize,
    pub container: &'a Container,
}

/// Extension point contributing context, tools and state to every round.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Unique identifier; also the plugin's state key.
    fn id(&self) -> &str;

    fn name(&self) -> Option<&str> {
        None
    }

    fn description(&self) -> Option<&str> {
        None
    }

    /// JSON schema for the plugin config. Accepts anything by default.
    fn config_schema(&self) -> Value {
        json!({})
    }

    /// JSON schema for the plugin's state record.
    fn state_schema(&self) -> Value {
        json!({})
    }

    fn hooks(&self) -> PluginHooks {
        PluginHooks::none()
    }

    async fn setup(&self, _ctx: SetupContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn prepare(&self, _ctx: PrepareContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn ready(&self, _ctx: ReadyContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }
}
