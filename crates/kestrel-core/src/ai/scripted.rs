//! Replays a fixed list of model steps
//!
//! Used by tests and `kestrel replay` to drive the executor without a
//! provider. Every request is recorded for inspection.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::VecDeque;

use crate::ai::client::{DeltaSink, ModelClient};
use crate::ai::types::{ModelRequest, ModelStep};

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ScriptedReply {
    Failure { error: String },
    Step(ModelStep),
}

#[derive(Default)]
pub struct ScriptedModel {
    replies: Mutex<VecDeque<ScriptedReply>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    pub fn new(steps: impl IntoIterator<Item = ModelStep>) -> Self {
        Self {
            replies: Mutex::new(steps.into_iter().map(ScriptedReply::Step).collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Parse a JSON array of steps or `{ "error": "..." }` failures.
    pub fn from_json(json: &str) -> Result<Self> {
        let replies: Vec<ScriptedReply> = serde_json::from_str(json)?;
        Ok(Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn push(&self, step: ModelStep) {
        self.replies.lock().push_back(ScriptedReply::Step(step));
    }

    pub fn push_error(&self, message: impl Into<String>) {
        self.replies.lock().push_back(ScriptedReply::Failure {
            error: message.into(),
        });
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().clone()
    }

    pub fn remaining(&self) -> usize {
        self.replies.lock().len()
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn step(&self, request: &ModelRequest, on_delta: DeltaSink<'_>) -> Result<ModelStep> {
        self.requests.lock().push(request.clone());
        let reply = self
            .replies
            .lock()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted model has no more replies"))?;
        match reply {
            ScriptedReply::Step(step) => {
                if let Some(text) = &step.text {
                    for chunk in text.split_inclusive(' ') {
                        on_delta(chunk);
                    }
                }
                Ok(step)
            }
            ScriptedReply::Failure { error } => Err(anyhow!(error)),
        }
    }
}
