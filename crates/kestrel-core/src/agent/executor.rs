//! Prompt executor: the round loop behind one prompt.
//!
//! ```text
//!  Created ──run──► Running ──(approval needed)──► WaitingApproval
//!                     ▲  │                              │
//!                     │  └──(done / max rounds / error) │ approve / reject
//!                     │              ▼                  │
//!                     └──────── Completed ◄─────────────┘ (via Running)
//! ```
//!
//! Each round assembles plugin context and tools, lets the execution mode
//! plan it, calls the model once, and dispatches the returned tool calls in
//! order. Tool failures are recorded as error items; model failures end the
//! prompt.

use std::sync::Arc;

use anyhow::{bail, Context as _};
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::loop_events::{LoopEvent, LoopInput};
use super::modes::{ExecutionMode, RoundInput, RoundPlan};
use crate::ai::types::ModelMessage;
use crate::ai::{AiToolCall, ModelClient, ModelRequest, ModelTier};
use crate::container::Container;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::plugins::{PluginHost, TurnInput};
use crate::prompt::{PendingApproval, Prompt, PromptStore, ToolOutcome};
use crate::state::{StateSnapshot, StateStore};
use crate::tools::{Tool, ToolContext, ToolRegistry, ToolSet};

/// Observable lifecycle of an executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ExecutorState {
    Created,
    Running,
    WaitingApproval {
        call_id: String,
        tool: String,
        reason: String,
    },
    Completed {
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl ExecutorState {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    /// Call id awaiting a decision, if any.
    pub fn pending_call(&self) -> Option<&str> {
        match self {
            Self::WaitingApproval { call_id, .. } => Some(call_id),
            _ => None,
        }
    }
}

/// Inputs for one executor.
pub struct ExecutorContext {
    pub container: Container,
    pub user_id: String,
    pub tier: ModelTier,
    /// Earlier prompts of the user, oldest first.
    pub history: Vec<Prompt>,
    pub input: String,
    /// Plugin state records the run starts from.
    pub initial_state: StateSnapshot,
    /// Mode options for this prompt.
    pub switches: Value,
    /// A stored prompt to continue instead of starting a new one.
    pub prompt: Option<Prompt>,
}

impl ExecutorContext {
    pub fn new(container: &Container, user_id: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            container: container.root(),
            user_id: user_id.into(),
            tier: container.config().default_tier,
            history: Vec::new(),
            input: input.into(),
            initial_state: StateSnapshot::new(),
            switches: Value::Object(Default::default()),
            prompt: None,
        }
    }
}

/// Runs one prompt to completion. `run` may be called once.
pub struct PromptExecutor {
    prompt_id: String,
    inputs: mpsc::UnboundedSender<LoopInput>,
    state: watch::Receiver<ExecutorState>,
    task: Mutex<Option<RunLoop>>,
}

impl PromptExecutor {
    pub(crate) fn new(mode: Arc<dyn ExecutionMode>, context: ExecutorContext) -> Self {
        let ExecutorContext {
            container,
            user_id,
            tier,
            history,
            input,
            initial_state,
            switches,
            prompt,
        } = context;
        let prompt = prompt.unwrap_or_else(|| Prompt::new(user_id, tier, mode.id(), input));
        let (inputs, inputs_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ExecutorState::Created);

        Self {
            prompt_id: prompt.id.clone(),
            inputs,
            state,
            task: Mutex::new(Some(RunLoop {
                mode,
                container,
                history,
                initial_state,
                switches,
                prompt,
                inputs: inputs_rx,
                state: state_tx,
            })),
        }
    }

    pub fn id(&self) -> &str {
        &self.prompt_id
    }

    pub fn state(&self) -> ExecutorState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ExecutorState> {
        self.state.clone()
    }

    /// Drive the prompt until it completes and return the final record.
    pub async fn run(&self) -> Result<Prompt> {
        let task = self.take_task()?;
        Ok(task.run().await)
    }

    /// Claim the loop; fails if it was already claimed.
    pub(crate) fn take_task(&self) -> Result<RunLoop> {
        self.task.lock().take().ok_or_else(|| {
            if self.state.borrow().is_completed() {
                Error::PromptCompleted(self.prompt_id.clone())
            } else {
                Error::AlreadyRunning(self.prompt_id.clone())
            }
        })
    }

    /// Let the pending call `call_id` run.
    pub fn approve(&self, call_id: &str) -> Result<()> {
        self.decide(call_id, true, None)
    }

    /// Answer the pending call `call_id` with a `rejected` error result.
    pub fn reject(&self, call_id: &str, reason: impl Into<String>) -> Result<()> {
        self.decide(call_id, false, Some(reason.into()))
    }

    fn decide(&self, call_id: &str, approved: bool, reason: Option<String>) -> Result<()> {
        let no_pending = || Error::NoPendingApproval {
            prompt_id: self.prompt_id.clone(),
            call_id: call_id.to_string(),
        };
        if self.state.borrow().pending_call() != Some(call_id) {
            return Err(no_pending());
        }
        self.inputs
            .send(LoopInput::ToolApproval {
                tool_call_id: call_id.to_string(),
                approved,
                reason,
            })
            .map_err(|_| no_pending())
    }
}

/// Capabilities the loop needs, resolved once per run.
struct Services {
    model: Arc<dyn ModelClient>,
    registry: Arc<ToolRegistry>,
    plugins: Arc<PluginHost>,
    bus: Arc<EventBus>,
    store: Arc<dyn PromptStore>,
}

impl Services {
    async fn resolve(container: &Container) -> Result<Self> {
        Ok(Self {
            model: container.resolve::<dyn ModelClient>().await?,
            registry: container.get::<ToolRegistry>().await?,
            plugins: container.get::<PluginHost>().await?,
            bus: container.get::<EventBus>().await?,
            store: container.resolve::<dyn PromptStore>().await?,
        })
    }
}

enum Decision {
    Approved,
    Rejected(String),
}

pub(crate) struct RunLoop {
    mode: Arc<dyn ExecutionMode>,
    container: Container,
    history: Vec<Prompt>,
    initial_state: StateSnapshot,
    switches: Value,
    prompt: Prompt,
    inputs: mpsc::UnboundedReceiver<LoopInput>,
    state: watch::Sender<ExecutorState>,
}

impl RunLoop {
    pub(crate) async fn run(mut self) -> Prompt {
        let services = match Services::resolve(&self.container).await {
            Ok(services) => services,
            Err(e) => {
                let error = format!("{e:#}");
                warn!(prompt_id = %self.prompt.id, %error, "Prompt could not start");
                if let Err(e) = self.prompt.complete(Some(error.clone())) {
                    warn!(prompt_id = %self.prompt.id, error = %e, "Failed to complete prompt");
                }
                self.state.send_replace(ExecutorState::Completed { error: Some(error) });
                return self.prompt;
            }
        };

        let mut state = StateStore::new(
            services.plugins.state_schemas(),
            std::mem::take(&mut self.initial_state),
        );
        let outcome = self.drive(&services, &mut state).await;

        let error = outcome.err().map(|e| format!("{e:#}"));
        if let Some(error) = &error {
            warn!(prompt_id = %self.prompt.id, %error, "Prompt failed");
            self.emit(&services, LoopEvent::Error { error: error.clone() });
        }
        if let Err(e) = self.prompt.complete(error.clone()) {
            warn!(prompt_id = %self.prompt.id, error = %e, "Failed to complete prompt");
        }
        if let Err(e) = self.persist(&services, &state).await {
            warn!(prompt_id = %self.prompt.id, error = %e, "Failed to persist completed prompt");
        }
        self.emit(
            &services,
            LoopEvent::Completed {
                rounds: self.prompt.rounds,
                error: error.clone(),
            },
        );
        info!(
            prompt_id = %self.prompt.id,
            rounds = self.prompt.rounds,
            input_tokens = self.prompt.usage.input_tokens,
            output_tokens = self.prompt.usage.output_tokens,
            failed = error.is_some(),
            "Prompt completed"
        );
        self.state.send_replace(ExecutorState::Completed { error });
        self.prompt
    }

    async fn drive(&mut self, services: &Services, state: &mut StateStore) -> anyhow::Result<()> {
        self.state.send_replace(ExecutorState::Running);
        self.emit(
            services,
            LoopEvent::Started {
                mode: self.mode.id().to_string(),
                round: self.prompt.rounds,
            },
        );
        self.persist(services, state).await?;

        // A resumed prompt may stop between a tool call and its result.
        let open = self.prompt.open_tool_calls();
        if !open.is_empty() {
            info!(prompt_id = %self.prompt.id, calls = open.len(), "Resuming open tool calls");
            let plan = self.plan(services, state).await?;
            for call in &open {
                self.handle_call(services, state, &plan.tools, call).await?;
            }
        }

        let max_rounds = self.container.config().max_rounds;
        while self.prompt.rounds < max_rounds {
            let round = self.prompt.begin_round()?;
            let plan = self.plan(services, state).await?;
            debug!(
                prompt_id = %self.prompt.id,
                round,
                tools = ?plan.tools.names(),
                "Calling model"
            );

            let request = ModelRequest {
                prompt_id: self.prompt.id.clone(),
                user_id: self.prompt.user_id.clone(),
                tier: self.prompt.tier,
                system: plan.instructions.clone(),
                messages: self.transcript(),
                tools: plan.tools.ai_tools(),
            };
            let started_at = Utc::now();
            let step = {
                let bus = services.bus.clone();
                let user_id = self.prompt.user_id.clone();
                let prompt_id = self.prompt.id.clone();
                let on_delta = move |delta: &str| {
                    LoopEvent::TextDelta {
                        delta: delta.to_string(),
                    }
                    .emit(&bus, &user_id, &prompt_id)
                };
                services
                    .model
                    .step(&request, &on_delta)
                    .await
                    .context("model call failed")?
            };

            if let Some(call) = step
                .tool_calls
                .iter()
                .find(|c| c.id.trim().is_empty() || c.name.trim().is_empty())
            {
                bail!(
                    "malformed model response: tool call without id or name ({:?})",
                    call.name
                );
            }

            self.prompt.add_usage(step.usage)?;
            self.emit(
                services,
                LoopEvent::Usage {
                    round,
                    input_tokens: step.usage.input_tokens,
                    output_tokens: step.usage.output_tokens,
                },
            );
            if let Some(text) = step.text.as_deref().filter(|t| !t.trim().is_empty()) {
                self.prompt.push_text(text, started_at)?;
                self.emit(services, LoopEvent::Text { text: text.to_string() });
            }
            for call in &step.tool_calls {
                self.prompt.push_tool_call(call)?;
                self.emit(
                    services,
                    LoopEvent::ToolCall {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        arguments: call.arguments.clone(),
                    },
                );
            }
            for call in &step.tool_calls {
                self.handle_call(services, state, &plan.tools, call).await?;
            }

            if step.is_final() {
                return Ok(());
            }
        }
        info!(prompt_id = %self.prompt.id, max_rounds, "Prompt reached the round limit");
        Ok(())
    }

    /// Assemble plugin context and tools for the current round and let the
    /// mode shape them.
    async fn plan(&self, services: &Services, state: &mut StateStore) -> anyhow::Result<RoundPlan> {
        let mut context = Context::new();
        let mut tools = services.registry.snapshot();
        services
            .plugins
            .prepare_turn(
                TurnInput {
                    user_id: &self.prompt.user_id,
                    prompt_id: &self.prompt.id,
                    input: &self.prompt.input,
                    round: self.prompt.rounds,
                    history: &self.history,
                },
                &mut context,
                &mut tools,
                state,
            )
            .await?;
        self.mode
            .plan_round(RoundInput {
                prompt: &self.prompt,
                context: &context,
                tools,
                switches: &self.switches,
                container: &self.container,
            })
            .await
    }

    fn transcript(&self) -> Vec<ModelMessage> {
        self.history
            .iter()
            .flat_map(Prompt::to_messages)
            .chain(self.prompt.to_messages())
            .collect()
    }

    async fn handle_call(
        &mut self,
        services: &Services,
        state: &StateStore,
        tools: &ToolSet,
        call: &AiToolCall,
    ) -> anyhow::Result<()> {
        let Some(tool) = tools.get(&call.name) else {
            warn!(prompt_id = %self.prompt.id, tool = %call.name, "Model called an unknown tool");
            let outcome = ToolOutcome::error("unknown_tool", format!("Unknown tool: {}", call.name));
            return self.record(services, call, outcome);
        };

        let mut ctx = ToolContext::new(&self.prompt.user_id, self.container.secrets())
            .with_container(self.container.root())
            .with_prompt(&self.prompt.id)
            .with_call(&call.id);
        if let Some(reason) = tool.approval().evaluate(call) {
            match self.await_decision(services, state, call, reason).await? {
                Decision::Approved => ctx = ctx.with_approval_granted(),
                Decision::Rejected(reason) => {
                    return self.record(services, call, ToolOutcome::error("rejected", reason));
                }
            }
        }

        let result = services
            .registry
            .dispatch(tool.as_ref(), call.arguments.clone(), &ctx)
            .await;
        self.record(services, call, ToolOutcome::from(result))
    }

    fn record(&mut self, services: &Services, call: &AiToolCall, outcome: ToolOutcome) -> anyhow::Result<()> {
        self.prompt.set_tool_result(&call.id, outcome.clone())?;
        self.emit(
            services,
            LoopEvent::ToolResult {
                id: call.id.clone(),
                name: call.name.clone(),
                result: outcome,
            },
        );
        Ok(())
    }

    /// Park the prompt on `call` until a decision arrives.
    async fn await_decision(
        &mut self,
        services: &Services,
        state: &StateStore,
        call: &AiToolCall,
        reason: String,
    ) -> anyhow::Result<Decision> {
        self.prompt.set_pending(Some(PendingApproval {
            call_id: call.id.clone(),
            tool: call.name.clone(),
            input: call.arguments.clone(),
            reason: reason.clone(),
            requested_at: Utc::now(),
        }))?;
        self.persist(services, state).await?;
        self.emit(
            services,
            LoopEvent::ApprovalRequested {
                call_id: call.id.clone(),
                tool: call.name.clone(),
                reason: reason.clone(),
                input: call.arguments.clone(),
            },
        );
        info!(prompt_id = %self.prompt.id, call_id = %call.id, tool = %call.name, "Waiting for approval");
        self.state.send_replace(ExecutorState::WaitingApproval {
            call_id: call.id.clone(),
            tool: call.name.clone(),
            reason,
        });

        let timeout = self.container.config().approval_timeout();
        let deadline = timeout.map(|t| Instant::now() + t);
        let decision = loop {
            let received = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, self.inputs.recv()).await {
                    Ok(received) => received,
                    Err(_) => {
                        let secs = timeout.map(|t| t.as_secs()).unwrap_or_default();
                        warn!(prompt_id = %self.prompt.id, call_id = %call.id, "Approval timed out");
                        break Decision::Rejected(format!("approval timed out after {secs}s"));
                    }
                },
                None => self.inputs.recv().await,
            };
            match received {
                Some(LoopInput::ToolApproval {
                    tool_call_id,
                    approved,
                    reason,
                }) if tool_call_id == call.id => {
                    break if approved {
                        Decision::Approved
                    } else {
                        Decision::Rejected(reason.unwrap_or_else(|| "rejected".to_string()))
                    };
                }
                Some(LoopInput::ToolApproval { tool_call_id, .. }) => {
                    debug!(prompt_id = %self.prompt.id, %tool_call_id, "Ignoring stale approval");
                }
                None => bail!("approval channel closed"),
            }
        };

        self.prompt.set_pending(None)?;
        let (approved, reason) = match &decision {
            Decision::Approved => (true, None),
            Decision::Rejected(reason) => (false, Some(reason.clone())),
        };
        self.emit(
            services,
            LoopEvent::ApprovalResolved {
                call_id: call.id.clone(),
                approved,
                reason,
            },
        );
        self.state.send_replace(ExecutorState::Running);
        Ok(decision)
    }

    async fn persist(&self, services: &Services, state: &StateStore) -> anyhow::Result<()> {
        services.store.save_prompt(&self.prompt).await?;
        for (plugin_id, record) in state.snapshot() {
            services
                .store
                .save_state(&self.prompt.user_id, &plugin_id, &record)
                .await?;
        }
        Ok(())
    }

    fn emit(&self, services: &Services, event: LoopEvent) {
        event.emit(&services.bus, &self.prompt.user_id, &self.prompt.id);
    }
}
