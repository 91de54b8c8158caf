//! Execution modes
//!
//! A mode decides, per round, what instructions the model sees and which
//! tools it may call. The executor loop is the same for every mode.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;

use super::code::CodeMode;
use super::executor::{ExecutorContext, PromptExecutor};
use super::tool_calling::ToolCallingMode;
use crate::container::{Container, Service};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::prompt::Prompt;
use crate::tools::ToolSet;

/// Everything a mode sees when planning one round.
pub struct RoundInput<'a> {
    pub prompt: &'a Prompt,
    pub context: &'a Context,
    /// Registry tools plus whatever plugins added this round.
    pub tools: ToolSet,
    /// Per-prompt mode options.
    pub switches: &'a Value,
    pub container: &'a Container,
}

pub struct RoundPlan {
    /// System instruction for the model call.
    pub instructions: String,
    /// Tools offered to the model and dispatched by the executor.
    pub tools: ToolSet,
}

#[async_trait]
pub trait ExecutionMode: Send + Sync {
    fn id(&self) -> &str;

    fn description(&self) -> &str;

    async fn plan_round(&self, input: RoundInput<'_>) -> anyhow::Result<RoundPlan>;
}

/// Registered execution modes, keyed by id.
#[derive(Default)]
pub struct ModeRegistry {
    modes: RwLock<BTreeMap<String, Arc<dyn ExecutionMode>>>,
}

impl ModeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `tools` and `code` modes.
    pub fn with_builtin_modes() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(ToolCallingMode));
        registry.register(Arc::new(CodeMode));
        registry
    }

    /// Register a mode, replacing any mode with the same id.
    pub fn register(&self, mode: Arc<dyn ExecutionMode>) {
        let id = mode.id().to_string();
        if self.modes.write().insert(id.clone(), mode).is_some() {
            debug!(mode = %id, "Replaced execution mode");
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ExecutionMode>> {
        self.modes.read().get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        self.modes.read().keys().cloned().collect()
    }

    /// `(id, description)` pairs, sorted by id.
    pub fn describe(&self) -> Vec<(String, String)> {
        self.modes
            .read()
            .values()
            .map(|mode| (mode.id().to_string(), mode.description().to_string()))
            .collect()
    }

    pub fn create_executor(&self, mode_id: &str, context: ExecutorContext) -> Result<PromptExecutor> {
        let mode = self
            .get(mode_id)
            .ok_or_else(|| Error::UnknownMode(mode_id.to_string()))?;
        Ok(PromptExecutor::new(mode, context))
    }
}

#[async_trait]
impl Service for ModeRegistry {
    async fn create(_container: &Container) -> anyhow::Result<Self> {
        Ok(Self::with_builtin_modes())
    }
}
