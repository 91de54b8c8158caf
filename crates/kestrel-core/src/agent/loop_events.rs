//! Event protocol of the prompt loop.
//!
//! `LoopEvent` is everything a running prompt announces; each variant is
//! published on the [`EventBus`] under its `prompt.*` id with the prompt id
//! merged into the payload. `LoopInput` is what the outside world sends back
//! into a running prompt.

use serde::Serialize;
use serde_json::Value;

use crate::constants::events;
use crate::events::{EventBus, PublishOptions};
use crate::prompt::ToolOutcome;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoopEvent {
    /// The run loop picked the prompt up.
    Started { mode: String, round: usize },

    // ── Streaming ──────────────────────────────────────────────────────
    TextDelta { delta: String },

    /// A text item was appended to the output log.
    Text { text: String },

    // ── Tool lifecycle ─────────────────────────────────────────────────
    ToolCall {
        id: String,
        name: String,
        arguments: Value,
    },

    ToolResult {
        id: String,
        name: String,
        result: ToolOutcome,
    },

    // ── Interaction ────────────────────────────────────────────────────
    ApprovalRequested {
        call_id: String,
        tool: String,
        reason: String,
        input: Value,
    },

    ApprovalResolved {
        call_id: String,
        approved: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    // ── Round lifecycle ────────────────────────────────────────────────
    Usage {
        round: usize,
        input_tokens: u64,
        output_tokens: u64,
    },

    Completed {
        rounds: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    Error { error: String },
}

impl LoopEvent {
    pub fn event_id(&self) -> &'static str {
        match self {
            Self::Started { .. } => events::PROMPT_STARTED,
            Self::TextDelta { .. } => events::PROMPT_TEXT_DELTA,
            Self::Text { .. } => events::PROMPT_TEXT,
            Self::ToolCall { .. } => events::PROMPT_TOOL_CALL,
            Self::ToolResult { .. } => events::PROMPT_TOOL_RESULT,
            Self::ApprovalRequested { .. } => events::PROMPT_APPROVAL_REQUESTED,
            Self::ApprovalResolved { .. } => events::PROMPT_APPROVAL_RESOLVED,
            Self::Usage { .. } => events::PROMPT_USAGE,
            Self::Completed { .. } => events::PROMPT_COMPLETED,
            Self::Error { .. } => events::PROMPT_ERROR,
        }
    }

    /// Bus payload: the serialized event plus `prompt_id`.
    pub fn payload(&self, prompt_id: &str) -> Value {
        let mut payload = serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({}));
        if let Value::Object(map) = &mut payload {
            map.insert("prompt_id".into(), Value::String(prompt_id.to_string()));
        }
        payload
    }

    /// Publish on `bus`. Delivery problems are logged, never fatal to the run.
    pub(crate) fn emit(&self, bus: &EventBus, user_id: &str, prompt_id: &str) {
        let event = self.event_id();
        if let Err(e) = bus.publish(event, self.payload(prompt_id), PublishOptions::for_user(user_id)) {
            tracing::warn!(event, prompt_id, error = %e, "Failed to publish prompt event");
        }
    }
}

/// External inputs delivered to a running prompt.
#[derive(Debug, Clone)]
pub enum LoopInput {
    /// A human decided on the pending tool call.
    ToolApproval {
        tool_call_id: String,
        approved: bool,
        reason: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_carries_type_and_prompt_id() {
        let event = LoopEvent::ApprovalRequested {
            call_id: "c1".into(),
            tool: "delete_note".into(),
            reason: "destructive".into(),
            input: json!({"id": 3}),
        };
        assert_eq!(event.event_id(), "prompt.approval_requested");
        assert_eq!(
            event.payload("p1"),
            json!({
                "type": "approval_requested",
                "call_id": "c1",
                "tool": "delete_note",
                "reason": "destructive",
                "input": {"id": 3},
                "prompt_id": "p1"
            })
        );
    }

    #[test]
    fn every_event_publishes_on_the_core_bus() {
        let bus = EventBus::with_core_events();
        let samples = [
            LoopEvent::Started { mode: "tools".into(), round: 0 },
            LoopEvent::TextDelta { delta: "he".into() },
            LoopEvent::ToolResult {
                id: "c1".into(),
                name: "t".into(),
                result: ToolOutcome::error("rejected", "no"),
            },
            LoopEvent::Completed { rounds: 1, error: None },
            LoopEvent::Error { error: "boom".into() },
        ];
        for event in &samples {
            bus.publish(event.event_id(), event.payload("p1"), PublishOptions::default())
                .expect("publish");
        }
    }
}
