//! Prompt record and output log

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ai::types::{AiToolCall, Content, ModelMessage, ModelTier, Role, Usage};
use crate::constants::MAX_TOOL_OUTPUT_CHARS;
use crate::error::{Error, Result};
use crate::tools::ToolResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptStatus {
    Running,
    Completed,
}

/// Result of one tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolOutcome {
    Success { output: Value },
    Error { code: String, message: String },
}

impl ToolOutcome {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

impl From<ToolResult> for ToolOutcome {
    fn from(result: ToolResult) -> Self {
        if !result.is_error {
            return Self::Success {
                output: result.output,
            };
        }
        let code = result.error_code().unwrap_or("tool_error").to_string();
        let message = result
            .error_message()
            .map(str::to_string)
            .unwrap_or_else(|| result.to_model_text());
        Self::Error { code, message }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputItem {
    Text {
        #[serde(default)]
        round: usize,
        text: String,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    },
    Tool {
        #[serde(default)]
        round: usize,
        id: String,
        name: String,
        input: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<ToolOutcome>,
    },
}

impl OutputItem {
    pub fn round(&self) -> usize {
        match self {
            Self::Text { round, .. } | Self::Tool { round, .. } => *round,
        }
    }
}

/// A tool call held for a human decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingApproval {
    pub call_id: String,
    pub tool: String,
    pub input: Value,
    pub reason: String,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
    pub id: String,
    pub user_id: String,
    pub tier: ModelTier,
    pub mode: String,
    pub input: String,
    pub status: PromptStatus,
    /// Set when the run ended on an unrecoverable error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub output: Vec<OutputItem>,
    #[serde(default)]
    pub usage: Usage,
    #[serde(default)]
    pub rounds: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<PendingApproval>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Prompt {
    pub fn new(
        user_id: impl Into<String>,
        tier: ModelTier,
        mode: impl Into<String>,
        input: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            tier,
            mode: mode.into(),
            input: input.into(),
            status: PromptStatus::Running,
            error: None,
            output: Vec::new(),
            usage: Usage::default(),
            rounds: 0,
            pending: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == PromptStatus::Completed
    }

    pub fn failed(&self) -> bool {
        self.error.is_some()
    }

    /// Concatenated text items.
    pub fn text(&self) -> String {
        self.output
            .iter()
            .filter_map(|item| match item {
                OutputItem::Text { text, .. } => Some(text.as_str()),
                OutputItem::Tool { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn tool_result(&self, call_id: &str) -> Option<&ToolOutcome> {
        self.output.iter().find_map(|item| match item {
            OutputItem::Tool { id, result, .. } if id == call_id => result.as_ref(),
            _ => None,
        })
    }

    /// Tool calls of the current round that have no result yet.
    pub fn open_tool_calls(&self) -> Vec<AiToolCall> {
        self.output
            .iter()
            .filter_map(|item| match item {
                OutputItem::Tool {
                    round,
                    id,
                    name,
                    input,
                    result: None,
                } if *round == self.rounds => Some(AiToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    arguments: input.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    pub fn push_text(&mut self, text: impl Into<String>, started_at: DateTime<Utc>) -> Result<()> {
        self.ensure_open()?;
        let round = self.rounds;
        self.output.push(OutputItem::Text {
            round,
            text: text.into(),
            started_at,
            ended_at: Utc::now(),
        });
        self.touch();
        Ok(())
    }

    pub fn push_tool_call(&mut self, call: &AiToolCall) -> Result<()> {
        self.ensure_open()?;
        let round = self.rounds;
        self.output.push(OutputItem::Tool {
            round,
            id: call.id.clone(),
            name: call.name.clone(),
            input: call.arguments.clone(),
            result: None,
        });
        self.touch();
        Ok(())
    }

    /// Record the result of an earlier tool call item.
    pub fn set_tool_result(&mut self, call_id: &str, outcome: ToolOutcome) -> Result<()> {
        self.ensure_open()?;
        let slot = self.output.iter_mut().rev().find_map(|item| match item {
            OutputItem::Tool { id, result, .. } if id == call_id => Some(result),
            _ => None,
        });
        match slot {
            Some(result) => *result = Some(outcome),
            None => {
                return Err(Error::Other(anyhow::anyhow!(
                    "prompt '{}' has no tool call '{}'",
                    self.id,
                    call_id
                )))
            }
        }
        self.touch();
        Ok(())
    }

    pub fn set_pending(&mut self, pending: Option<PendingApproval>) -> Result<()> {
        self.ensure_open()?;
        self.pending = pending;
        self.touch();
        Ok(())
    }

    /// Enter the terminal state. Later mutations fail.
    pub fn complete(&mut self, error: Option<String>) -> Result<()> {
        self.ensure_open()?;
        let now = Utc::now();
        self.status = PromptStatus::Completed;
        self.error = error;
        self.pending = None;
        self.updated_at = now;
        self.completed_at = Some(now);
        Ok(())
    }

    pub(crate) fn begin_round(&mut self) -> Result<usize> {
        self.ensure_open()?;
        self.rounds += 1;
        self.touch();
        Ok(self.rounds)
    }

    pub(crate) fn add_usage(&mut self, usage: Usage) -> Result<()> {
        self.ensure_open()?;
        self.usage.add(usage);
        Ok(())
    }

    /// Conversation transcript for this prompt: the user input, then per
    /// round the assistant text and tool calls followed by tool results.
    pub fn to_messages(&self) -> Vec<ModelMessage> {
        let mut messages = vec![ModelMessage::user_text(&self.input)];
        let mut assistant = Vec::new();
        let mut results = Vec::new();
        let mut current_round = None;

        for item in &self.output {
            if current_round.is_some_and(|r| r != item.round()) {
                flush_round(&mut messages, &mut assistant, &mut results);
            }
            current_round = Some(item.round());
            match item {
                OutputItem::Text { text, .. } => assistant.push(Content::Text { text: text.clone() }),
                OutputItem::Tool {
                    id,
                    name,
                    input,
                    result,
                    ..
                } => {
                    let Some(result) = result else {
                        continue;
                    };
                    assistant.push(Content::ToolUse {
                        id: id.clone(),
                        name: name.clone(),
                        input: input.clone(),
                    });
                    let (output, is_error) = match result {
                        ToolOutcome::Success { output } => (model_text(output), None),
                        ToolOutcome::Error { message, .. } => (message.clone(), Some(true)),
                    };
                    results.push(Content::ToolResult {
                        tool_use_id: id.clone(),
                        output: Value::String(truncate_output(&output)),
                        is_error,
                    });
                }
            }
        }
        flush_round(&mut messages, &mut assistant, &mut results);
        messages
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_completed() {
            return Err(Error::PromptCompleted(self.id.clone()));
        }
        Ok(())
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

fn flush_round(messages: &mut Vec<ModelMessage>, assistant: &mut Vec<Content>, results: &mut Vec<Content>) {
    if !assistant.is_empty() {
        messages.push(ModelMessage {
            role: Role::Assistant,
            content: std::mem::take(assistant),
        });
    }
    if !results.is_empty() {
        messages.push(ModelMessage {
            role: Role::User,
            content: std::mem::take(results),
        });
    }
}

fn model_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

pub(crate) fn truncate_output(output: &str) -> String {
    if output.len() <= MAX_TOOL_OUTPUT_CHARS {
        return output.to_string();
    }

    let truncated_len = floor_char_boundary(output, MAX_TOOL_OUTPUT_CHARS);
    let truncated = &output[..truncated_len];
    let break_point = truncated.rfind('\n').unwrap_or(truncated_len);
    let clean = &output[..break_point];
    format!(
        "{}\n\n[... OUTPUT TRUNCATED: {} chars -> {} chars ...]",
        clean,
        output.len(),
        clean.len()
    )
}

fn floor_char_boundary(text: &str, index: usize) -> usize {
    let mut boundary = index.min(text.len());
    while boundary > 0 && !text.is_char_boundary(boundary) {
        boundary -= 1;
    }
    boundary
}
