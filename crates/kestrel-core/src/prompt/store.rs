//! Prompt and plugin-state persistence capability

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::prompt::types::Prompt;

/// Durable home for prompts and per-user plugin state records.
#[async_trait]
pub trait PromptStore: Send + Sync {
    async fn load_prompt(&self, id: &str) -> Result<Option<Prompt>>;

    async fn save_prompt(&self, prompt: &Prompt) -> Result<()>;

    /// The user's most recent prompts, oldest first.
    async fn recent_prompts(&self, user_id: &str, limit: usize) -> Result<Vec<Prompt>>;

    async fn load_state(&self, user_id: &str, plugin_id: &str) -> Result<Option<Value>>;

    async fn save_state(&self, user_id: &str, plugin_id: &str, record: &Value) -> Result<()>;
}

/// Process-local store; the container default.
#[derive(Default)]
pub struct MemoryPromptStore {
    prompts: DashMap<String, Prompt>,
    states: DashMap<(String, String), Value>,
}

#[async_trait]
impl PromptStore for MemoryPromptStore {
    async fn load_prompt(&self, id: &str) -> Result<Option<Prompt>> {
        Ok(self.prompts.get(id).map(|p| p.value().clone()))
    }

    async fn save_prompt(&self, prompt: &Prompt) -> Result<()> {
        self.prompts.insert(prompt.id.clone(), prompt.clone());
        Ok(())
    }

    async fn recent_prompts(&self, user_id: &str, limit: usize) -> Result<Vec<Prompt>> {
        let mut prompts: Vec<Prompt> = self
            .prompts
            .iter()
            .filter(|p| p.user_id == user_id)
            .map(|p| p.value().clone())
            .collect();
        prompts.sort_by_key(|p| p.created_at);
        let skip = prompts.len().saturating_sub(limit);
        Ok(prompts.into_iter().skip(skip).collect())
    }

    async fn load_state(&self, user_id: &str, plugin_id: &str) -> Result<Option<Value>> {
        Ok(self
            .states
            .get(&(user_id.to_string(), plugin_id.to_string()))
            .map(|v| v.value().clone()))
    }

    async fn save_state(&self, user_id: &str, plugin_id: &str, record: &Value) -> Result<()> {
        self.states
            .insert((user_id.to_string(), plugin_id.to_string()), record.clone());
        Ok(())
    }
}
