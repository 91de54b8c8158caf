//! Demo plugins wired into `kestrel replay`
//!
//! - `clock` adds the current time to every round and a `clock.now` tool
//! - `notes` keeps a per-user notebook in its plugin state

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Context as _};
use async_trait::async_trait;
use kestrel_core::plugins::PrepareContext;
use kestrel_core::tools::{ApprovalPolicy, FunctionTool};
use kestrel_core::{ContextItem, Plugin, PluginHooks};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

const DEFAULT_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S UTC";

pub struct ClockPlugin;

impl ClockPlugin {
    fn now(config: &Value) -> String {
        let format = config
            .get("format")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_TIME_FORMAT);
        chrono::Utc::now().format(format).to_string()
    }
}

#[async_trait]
impl Plugin for ClockPlugin {
    fn id(&self) -> &str {
        "clock"
    }

    fn description(&self) -> Option<&str> {
        Some("Current date and time")
    }

    fn config_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "format": { "type": "string", "minLength": 1 } },
            "additionalProperties": false
        })
    }

    fn hooks(&self) -> PluginHooks {
        PluginHooks::none().with_prepare()
    }

    async fn prepare(&self, mut ctx: PrepareContext<'_>) -> anyhow::Result<()> {
        ctx.context.push(
            ContextItem::new("clock", format!("Current time: {}", Self::now(ctx.config)))
                .with_id("clock"),
        );
        let config = ctx.config.clone();
        ctx.tools.push(
            FunctionTool::sync("clock.now", "Current date and time", move |_, _| {
                Ok(json!(ClockPlugin::now(&config)))
            })
            .into_arc(),
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Note {
    id: u64,
    text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct NoteBook {
    next_id: u64,
    notes: Vec<Note>,
}

impl NoteBook {
    fn add(&mut self, text: String) -> u64 {
        self.next_id += 1;
        self.notes.push(Note {
            id: self.next_id,
            text,
        });
        self.next_id
    }

    fn remove(&mut self, id: u64) -> bool {
        let before = self.notes.len();
        self.notes.retain(|note| note.id != id);
        self.notes.len() != before
    }

    fn summary(&self) -> String {
        if self.notes.is_empty() {
            return "The user has no saved notes.".to_string();
        }
        let mut out = format!("The user has {} saved note(s):", self.notes.len());
        for note in &self.notes {
            out.push_str(&format!("\n- [{}] {}", note.id, note.text));
        }
        out
    }
}

#[derive(Deserialize)]
struct AddParams {
    text: String,
}

#[derive(Deserialize)]
struct DeleteParams {
    id: u64,
}

/// Notebooks by user id. The plugin state record mirrors the acting user's
/// entry at the start of every round.
type Books = Arc<Mutex<HashMap<String, NoteBook>>>;

#[derive(Default)]
pub struct NotesPlugin {
    books: Books,
}

impl NotesPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    fn tools(&self) -> Vec<FunctionTool> {
        let books = self.books.clone();
        let add = FunctionTool::sync("notes.add", "Save a note for the user", move |params, ctx| {
            let AddParams { text } = serde_json::from_value(params).context("notes.add")?;
            let id = books.lock().entry(ctx.user_id.clone()).or_default().add(text);
            Ok(json!({ "id": id }))
        })
        .with_input_schema(json!({
            "type": "object",
            "properties": { "text": { "type": "string", "minLength": 1 } },
            "required": ["text"]
        }));

        let books = self.books.clone();
        let list = FunctionTool::sync("notes.list", "List the user's notes", move |_, ctx| {
            let notes = books
                .lock()
                .get(&ctx.user_id)
                .map(|book| book.notes.clone())
                .unwrap_or_default();
            Ok(serde_json::to_value(notes)?)
        });

        let books = self.books.clone();
        let delete = FunctionTool::sync("notes.delete", "Delete a note by id", move |params, ctx| {
            let DeleteParams { id } = serde_json::from_value(params).context("notes.delete")?;
            let removed = books
                .lock()
                .get_mut(&ctx.user_id)
                .is_some_and(|book| book.remove(id));
            if !removed {
                return Err(anyhow!("no note with id {id}"));
            }
            Ok(json!(format!("deleted note {id}")))
        })
        .with_input_schema(json!({
            "type": "object",
            "properties": { "id": { "type": "integer", "minimum": 1 } },
            "required": ["id"]
        }))
        .with_approval(ApprovalPolicy::always("deletes a saved note"));

        vec![add, list, delete]
    }
}

#[async_trait]
impl Plugin for NotesPlugin {
    fn id(&self) -> &str {
        "notes"
    }

    fn description(&self) -> Option<&str> {
        Some("Per-user notebook")
    }

    fn state_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "next_id": { "type": "integer", "minimum": 0 },
                "notes": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "id": { "type": "integer" },
                            "text": { "type": "string" }
                        },
                        "required": ["id", "text"]
                    }
                }
            },
            "required": ["next_id", "notes"]
        })
    }

    fn hooks(&self) -> PluginHooks {
        PluginHooks::none().with_prepare()
    }

    async fn prepare(&self, mut ctx: PrepareContext<'_>) -> anyhow::Result<()> {
        let book = self
            .books
            .lock()
            .entry(ctx.user_id.to_string())
            .or_insert_with(|| ctx.state.get_as().unwrap_or_default())
            .clone();
        ctx.state.set_as(&book)?;
        ctx.context
            .push(ContextItem::new("memory", book.summary()).with_id("notes"));
        for tool in self.tools() {
            ctx.tools.push(tool.into_arc());
        }
        Ok(())
    }
}
