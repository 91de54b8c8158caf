//! SQLite-backed prompt store
//!
//! Prompts are stored as JSON bodies keyed by id; plugin state by
//! `(user_id, plugin_id)`.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde_json::Value;

use super::database::SharedDatabase;
use crate::prompt::{Prompt, PromptStatus, PromptStore};

pub struct SqlitePromptStore {
    db: SharedDatabase,
}

impl SqlitePromptStore {
    pub fn new(db: SharedDatabase) -> Self {
        Self { db }
    }
}

fn status_str(status: PromptStatus) -> &'static str {
    match status {
        PromptStatus::Running => "running",
        PromptStatus::Completed => "completed",
    }
}

#[async_trait]
impl PromptStore for SqlitePromptStore {
    async fn load_prompt(&self, id: &str) -> Result<Option<Prompt>> {
        let body: Option<String> = self
            .db
            .conn()
            .query_row("SELECT body FROM prompts WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .optional()?;
        body.map(|b| serde_json::from_str(&b).map_err(Into::into))
            .transpose()
    }

    async fn save_prompt(&self, prompt: &Prompt) -> Result<()> {
        let body = serde_json::to_string(prompt)?;
        self.db.conn().execute(
            "INSERT INTO prompts (id, user_id, status, body, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                 status = excluded.status,
                 body = excluded.body,
                 updated_at = excluded.updated_at",
            params![
                prompt.id,
                prompt.user_id,
                status_str(prompt.status),
                body,
                prompt.created_at.to_rfc3339(),
                prompt.updated_at.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    async fn recent_prompts(&self, user_id: &str, limit: usize) -> Result<Vec<Prompt>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT body FROM prompts WHERE user_id = ?1
             ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![user_id, limit as i64], |row| row.get::<_, String>(0))?;
        let mut prompts = rows
            .map(|body| Ok(serde_json::from_str::<Prompt>(&body?)?))
            .collect::<Result<Vec<_>>>()?;
        prompts.reverse();
        Ok(prompts)
    }

    async fn load_state(&self, user_id: &str, plugin_id: &str) -> Result<Option<Value>> {
        let record: Option<String> = self
            .db
            .conn()
            .query_row(
                "SELECT record FROM plugin_state WHERE user_id = ?1 AND plugin_id = ?2",
                params![user_id, plugin_id],
                |row| row.get(0),
            )
            .optional()?;
        record
            .map(|r| serde_json::from_str(&r).map_err(Into::into))
            .transpose()
    }

    async fn save_state(&self, user_id: &str, plugin_id: &str, record: &Value) -> Result<()> {
        self.db.conn().execute(
            "INSERT INTO plugin_state (user_id, plugin_id, record, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id, plugin_id) DO UPDATE SET
                 record = excluded.record,
                 updated_at = excluded.updated_at",
            params![user_id, plugin_id, record.to_string(), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}
