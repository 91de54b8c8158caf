//! Prompt lifecycle surface
//!
//! `PromptService` creates and resumes prompts and routes approval decisions
//! to whichever executor is running a prompt. Running executors live in the
//! active-run registry until their loop returns.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::executor::{ExecutorContext, ExecutorState, PromptExecutor};
use super::modes::ModeRegistry;
use crate::ai::ModelTier;
use crate::constants::HISTORY_LIMIT;
use crate::container::{Container, Service};
use crate::error::{Error, Result};
use crate::plugins::PluginHost;
use crate::prompt::{Prompt, PromptStore};
use crate::state::StateSnapshot;

type ActiveRuns = Arc<DashMap<String, Arc<PromptExecutor>>>;

/// Parameters for a new prompt.
#[derive(Debug, Clone)]
pub struct CreatePrompt {
    pub user_id: String,
    pub input: String,
    /// Execution mode id; the configured default when unset.
    pub mode: Option<String>,
    pub tier: Option<ModelTier>,
    pub switches: Value,
    /// Plugin state to start from; loaded from the store when unset.
    pub initial_state: Option<StateSnapshot>,
}

impl CreatePrompt {
    pub fn new(user_id: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            input: input.into(),
            mode: None,
            tier: None,
            switches: Value::Object(Default::default()),
            initial_state: None,
        }
    }

    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = Some(mode.into());
        self
    }

    pub fn with_tier(mut self, tier: ModelTier) -> Self {
        self.tier = Some(tier);
        self
    }

    pub fn with_switches(mut self, switches: Value) -> Self {
        self.switches = switches;
        self
    }

    pub fn with_initial_state(mut self, state: StateSnapshot) -> Self {
        self.initial_state = Some(state);
        self
    }
}

pub struct PromptService {
    container: Container,
    active: ActiveRuns,
}

impl PromptService {
    pub fn new(container: &Container) -> Self {
        Self {
            container: container.root(),
            active: Arc::new(DashMap::new()),
        }
    }

    /// Build an executor for a new prompt. Nothing runs until
    /// [`PromptHandle::run`].
    pub async fn create(&self, request: CreatePrompt) -> Result<PromptHandle> {
        let config = self.container.config();
        let mode = request.mode.unwrap_or_else(|| config.default_mode.clone());
        let store = self.container.resolve::<dyn PromptStore>().await?;

        let history = self.history(store.as_ref(), &request.user_id, None).await?;
        let initial_state = match request.initial_state {
            Some(state) => state,
            None => self.stored_state(store.as_ref(), &request.user_id).await?,
        };

        let context = ExecutorContext {
            container: self.container.clone(),
            user_id: request.user_id,
            tier: request.tier.unwrap_or(config.default_tier),
            history,
            input: request.input,
            initial_state,
            switches: request.switches,
            prompt: None,
        };
        let executor = self.modes().await?.create_executor(&mode, context)?;
        debug!(prompt_id = executor.id(), %mode, "Created prompt");
        Ok(self.handle(executor))
    }

    /// Continue a stored prompt that has not completed.
    pub async fn resume(&self, prompt_id: &str) -> Result<PromptHandle> {
        if let Some(executor) = self.active.get(prompt_id) {
            return Ok(self.handle_for(executor.value().clone()));
        }
        let store = self.container.resolve::<dyn PromptStore>().await?;
        let prompt = store
            .load_prompt(prompt_id)
            .await?
            .ok_or_else(|| Error::PromptNotFound(prompt_id.to_string()))?;
        if prompt.is_completed() {
            return Err(Error::PromptCompleted(prompt_id.to_string()));
        }

        let history = self
            .history(store.as_ref(), &prompt.user_id, Some(prompt_id))
            .await?;
        let initial_state = self.stored_state(store.as_ref(), &prompt.user_id).await?;
        let mode = prompt.mode.clone();
        let context = ExecutorContext {
            container: self.container.clone(),
            user_id: prompt.user_id.clone(),
            tier: prompt.tier,
            history,
            input: prompt.input.clone(),
            initial_state,
            switches: Value::Object(Default::default()),
            prompt: Some(prompt),
        };
        let executor = self.modes().await?.create_executor(&mode, context)?;
        info!(prompt_id, %mode, "Resuming prompt");
        Ok(self.handle(executor))
    }

    pub async fn approve(&self, prompt_id: &str, call_id: &str) -> Result<()> {
        self.running(prompt_id, call_id).await?.approve(call_id)
    }

    pub async fn reject(&self, prompt_id: &str, call_id: &str, reason: impl Into<String>) -> Result<()> {
        self.running(prompt_id, call_id).await?.reject(call_id, reason)
    }

    /// Current state of a prompt, running or stored.
    pub async fn state(&self, prompt_id: &str) -> Result<ExecutorState> {
        if let Some(executor) = self.active.get(prompt_id) {
            return Ok(executor.state());
        }
        let prompt = self.load(prompt_id).await?;
        Ok(if prompt.is_completed() {
            ExecutorState::Completed {
                error: prompt.error,
            }
        } else if let Some(pending) = prompt.pending {
            ExecutorState::WaitingApproval {
                call_id: pending.call_id,
                tool: pending.tool,
                reason: pending.reason,
            }
        } else {
            ExecutorState::Created
        })
    }

    /// Ids of prompts whose loop is currently running.
    pub fn active_prompts(&self) -> Vec<String> {
        self.active.iter().map(|e| e.key().clone()).collect()
    }

    fn handle(&self, executor: PromptExecutor) -> PromptHandle {
        self.handle_for(Arc::new(executor))
    }

    fn handle_for(&self, executor: Arc<PromptExecutor>) -> PromptHandle {
        PromptHandle {
            executor,
            active: self.active.clone(),
        }
    }

    async fn modes(&self) -> Result<Arc<ModeRegistry>> {
        self.container.get::<ModeRegistry>().await
    }

    async fn load(&self, prompt_id: &str) -> Result<Prompt> {
        let store = self.container.resolve::<dyn PromptStore>().await?;
        store
            .load_prompt(prompt_id)
            .await?
            .ok_or_else(|| Error::PromptNotFound(prompt_id.to_string()))
    }

    /// The running executor for `prompt_id`, or the reason there is none.
    async fn running(&self, prompt_id: &str, call_id: &str) -> Result<Arc<PromptExecutor>> {
        if let Some(executor) = self.active.get(prompt_id) {
            return Ok(executor.value().clone());
        }
        let prompt = self.load(prompt_id).await?;
        if prompt.is_completed() {
            return Err(Error::PromptCompleted(prompt_id.to_string()));
        }
        Err(Error::NoPendingApproval {
            prompt_id: prompt_id.to_string(),
            call_id: call_id.to_string(),
        })
    }

    async fn history(
        &self,
        store: &dyn PromptStore,
        user_id: &str,
        exclude: Option<&str>,
    ) -> Result<Vec<Prompt>> {
        let recent = store.recent_prompts(user_id, HISTORY_LIMIT + 1).await?;
        let mut history: Vec<Prompt> = recent
            .into_iter()
            .filter(|p| p.is_completed() && Some(p.id.as_str()) != exclude)
            .collect();
        let skip = history.len().saturating_sub(HISTORY_LIMIT);
        history.drain(..skip);
        Ok(history)
    }

    async fn stored_state(&self, store: &dyn PromptStore, user_id: &str) -> Result<StateSnapshot> {
        let plugins = self.container.get::<PluginHost>().await?;
        let mut state = StateSnapshot::new();
        for plugin_id in plugins.plugin_ids() {
            if let Some(record) = store.load_state(user_id, &plugin_id).await? {
                state.insert(plugin_id, record);
            }
        }
        Ok(state)
    }
}

#[async_trait]
impl Service for PromptService {
    async fn create(container: &Container) -> anyhow::Result<Self> {
        Ok(Self::new(container))
    }
}

/// Caller-side handle on one prompt.
#[derive(Clone)]
pub struct PromptHandle {
    executor: Arc<PromptExecutor>,
    active: ActiveRuns,
}

impl PromptHandle {
    pub fn id(&self) -> &str {
        self.executor.id()
    }

    /// Start the loop on the runtime. Fails with `AlreadyRunning` while the
    /// prompt id is active.
    pub fn run(&self) -> Result<RunHandle> {
        let id = self.id().to_string();
        let task = match self.active.entry(id.clone()) {
            Entry::Occupied(_) => return Err(Error::AlreadyRunning(id)),
            Entry::Vacant(slot) => {
                let task = self.executor.take_task()?;
                slot.insert(self.executor.clone());
                task
            }
        };

        let active = self.active.clone();
        let prompt_id = id.clone();
        let join = tokio::spawn(async move {
            scopeguard::defer! {
                active.remove(&prompt_id);
            }
            task.run().await
        });
        Ok(RunHandle {
            prompt_id: id,
            state: self.executor.subscribe(),
            join,
            last_approval: None,
        })
    }

    pub fn approve(&self, call_id: &str) -> Result<()> {
        self.executor.approve(call_id)
    }

    pub fn reject(&self, call_id: &str, reason: impl Into<String>) -> Result<()> {
        self.executor.reject(call_id, reason)
    }

    pub fn state(&self) -> ExecutorState {
        self.executor.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<ExecutorState> {
        self.executor.subscribe()
    }
}

/// A started run.
pub struct RunHandle {
    prompt_id: String,
    state: watch::Receiver<ExecutorState>,
    join: JoinHandle<Prompt>,
    last_approval: Option<String>,
}

impl RunHandle {
    pub fn prompt_id(&self) -> &str {
        &self.prompt_id
    }

    /// Resolve with the completed prompt and its final state.
    pub async fn wait(self) -> Result<(Prompt, ExecutorState)> {
        let prompt = self
            .join
            .await
            .map_err(|e| Error::Other(anyhow::anyhow!("prompt task failed: {e}")))?;
        let state = self.state.borrow().clone();
        Ok((prompt, state))
    }

    /// Resolve when the run pauses on a new approval, or with the
    /// `Completed` state if it finishes first.
    pub async fn wait_for_approval(&mut self) -> ExecutorState {
        let last = self.last_approval.clone();
        let reached = self
            .state
            .wait_for(|s| match s {
                ExecutorState::WaitingApproval { call_id, .. } => Some(call_id) != last.as_ref(),
                ExecutorState::Completed { .. } => true,
                _ => false,
            })
            .await
            .map(|state| state.clone());
        let state = match reached {
            Ok(state) => state,
            Err(_) => self.state.borrow().clone(),
        };
        if let Some(call_id) = state.pending_call() {
            self.last_approval = Some(call_id.to_string());
        }
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::{ModelClient, ModelStep, ScriptedModel};
    use crate::config::Config;
    use crate::context::ContextItem;
    use crate::events::{EventBus, EventEnvelope, ListenerHandle};
    use crate::plugins::{Plugin, PluginHooks, PrepareContext};
    use crate::prompt::ToolOutcome;
    use crate::secrets::StaticSecrets;
    use crate::tools::{ApprovalPolicy, FunctionTool, ToolRegistry};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct Harness {
        container: Container,
        model: Arc<ScriptedModel>,
        service: Arc<PromptService>,
        deleted: Arc<AtomicBool>,
        events: Arc<Mutex<Vec<EventEnvelope>>>,
        _listener: ListenerHandle,
    }

    impl Harness {
        fn event_names(&self) -> Vec<String> {
            self.events.lock().iter().map(|e| e.event.clone()).collect()
        }

        async fn store(&self) -> Arc<dyn PromptStore> {
            self.container
                .resolve::<dyn PromptStore>()
                .await
                .expect("store")
        }
    }

    async fn harness_with(config: Config, steps: Vec<ModelStep>) -> Harness {
        let container = Container::new(config, Arc::new(StaticSecrets::new()));
        let model = Arc::new(ScriptedModel::new(steps));
        container.set::<dyn ModelClient>(model.clone());

        let registry = container.get::<ToolRegistry>().await.expect("registry");
        registry.register(
            FunctionTool::sync("add", "Add a and b", |input, _| {
                Ok(json!(input["a"].as_i64().unwrap_or_default() + input["b"].as_i64().unwrap_or_default()))
            })
            .into_arc(),
        );
        let deleted = Arc::new(AtomicBool::new(false));
        let flag = deleted.clone();
        registry.register(
            FunctionTool::sync("delete_note", "Delete a note", move |input, _| {
                flag.store(true, Ordering::SeqCst);
                Ok(json!(format!("deleted {}", input["id"])))
            })
            .with_approval(ApprovalPolicy::always("destructive"))
            .into_arc(),
        );

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let bus = container.get::<EventBus>().await.expect("bus");
        let listener = bus.listen_all(move |e| sink.lock().push(e.clone()));
        let service = container.get::<PromptService>().await.expect("service");

        Harness {
            container,
            model,
            service,
            deleted,
            events,
            _listener: listener,
        }
    }

    async fn harness(steps: Vec<ModelStep>) -> Harness {
        harness_with(Config::default(), steps).await
    }

    async fn start(h: &Harness, mode: &str, input: &str) -> (PromptHandle, RunHandle) {
        let handle = h
            .service
            .create(CreatePrompt::new("u1", input).with_mode(mode))
            .await
            .expect("create");
        let run = handle.run().expect("run");
        (handle, run)
    }

    #[tokio::test]
    async fn approved_calls_run_after_the_decision() {
        let h = harness(vec![
            ModelStep::tool_call("c1", "delete_note", json!({ "id": 1 })),
            ModelStep::text("Done."),
        ])
        .await;
        let (handle, mut run) = start(&h, "tools", "delete note 1").await;

        let waiting = run.wait_for_approval().await;
        assert_eq!(
            waiting,
            ExecutorState::WaitingApproval {
                call_id: "c1".into(),
                tool: "delete_note".into(),
                reason: "destructive".into(),
            }
        );
        assert!(!h.deleted.load(Ordering::SeqCst));
        let stored = h
            .store()
            .await
            .load_prompt(handle.id())
            .await
            .expect("load")
            .expect("stored");
        assert_eq!(stored.pending.map(|p| p.call_id), Some("c1".to_string()));
        assert_eq!(h.service.state(handle.id()).await.expect("state"), waiting);

        h.service.approve(handle.id(), "c1").await.expect("approve");
        let (prompt, state) = run.wait().await.expect("wait");

        assert_eq!(state, ExecutorState::Completed { error: None });
        assert!(h.deleted.load(Ordering::SeqCst));
        assert_eq!(
            prompt.tool_result("c1"),
            Some(&ToolOutcome::Success { output: json!("deleted 1") })
        );
        assert_eq!(prompt.text(), "Done.");
        assert!(prompt.pending.is_none());

        let names = h.event_names();
        let requested = names.iter().position(|n| n == "prompt.approval_requested");
        let resolved = names.iter().position(|n| n == "prompt.approval_resolved");
        assert!(requested.is_some() && requested < resolved);
        assert_eq!(names.last().map(String::as_str), Some("prompt.completed"));
        assert!(h.service.active_prompts().is_empty());
    }

    #[tokio::test]
    async fn rejected_calls_never_enter_the_tool() {
        let h = harness(vec![
            ModelStep::tool_call("c1", "delete_note", json!({ "id": 1 })),
            ModelStep::text("Okay, I won't."),
        ])
        .await;
        let (handle, mut run) = start(&h, "tools", "delete note 1").await;
        run.wait_for_approval().await;

        assert!(matches!(
            handle.approve("c2"),
            Err(Error::NoPendingApproval { .. })
        ));
        handle.reject("c1", "not today").expect("reject");
        let (prompt, _) = run.wait().await.expect("wait");

        assert!(!h.deleted.load(Ordering::SeqCst));
        assert_eq!(
            prompt.tool_result("c1"),
            Some(&ToolOutcome::error("rejected", "not today"))
        );
        assert!(!prompt.failed());
    }

    #[tokio::test]
    async fn second_run_fails_while_active() {
        let h = harness(vec![
            ModelStep::tool_call("c1", "delete_note", json!({ "id": 1 })),
            ModelStep::text("Done."),
        ])
        .await;
        let (handle, mut run) = start(&h, "tools", "delete note 1").await;
        run.wait_for_approval().await;

        assert!(matches!(handle.run(), Err(Error::AlreadyRunning(_))));
        let resumed = h.service.resume(handle.id()).await.expect("resume");
        assert!(matches!(resumed.run(), Err(Error::AlreadyRunning(_))));

        handle.approve("c1").expect("approve");
        run.wait().await.expect("wait");
        assert!(matches!(handle.run(), Err(Error::PromptCompleted(_))));
        assert!(matches!(
            h.service.resume(handle.id()).await,
            Err(Error::PromptCompleted(_))
        ));
    }

    #[tokio::test]
    async fn model_failures_fail_the_prompt() {
        let h = harness(vec![]).await;
        h.model.push_error("upstream unavailable");
        let (handle, run) = start(&h, "tools", "hello").await;
        let (prompt, state) = run.wait().await.expect("wait");

        assert!(prompt.is_completed());
        let error = prompt.error.clone().expect("error");
        assert!(error.contains("upstream unavailable"));
        assert_eq!(state, ExecutorState::Completed { error: Some(error.clone()) });

        let events = h.events.lock();
        let failure = events
            .iter()
            .find(|e| e.event == "prompt.error")
            .expect("error event");
        assert_eq!(failure.data["prompt_id"], json!(handle.id()));
        assert_eq!(failure.data["error"], json!(error));
    }

    #[tokio::test]
    async fn malformed_tool_calls_abort() {
        let h = harness(vec![ModelStep::tool_call("", "add", json!({ "a": 1, "b": 2 }))]).await;
        let (_, run) = start(&h, "tools", "add").await;
        let (prompt, _) = run.wait().await.expect("wait");
        assert!(prompt.error.as_deref().unwrap_or_default().contains("malformed"));
    }

    #[tokio::test]
    async fn tool_failures_are_recorded_and_the_loop_continues() {
        let h = harness(vec![
            ModelStep::tool_call("c1", "nope", json!({})),
            ModelStep::tool_call("c2", "add", json!({ "a": 2, "b": 5 })),
            ModelStep::text("7"),
        ])
        .await;
        let (_, run) = start(&h, "tools", "add").await;
        let (prompt, _) = run.wait().await.expect("wait");

        assert!(!prompt.failed());
        assert!(matches!(
            prompt.tool_result("c1"),
            Some(ToolOutcome::Error { code, .. }) if code == "unknown_tool"
        ));
        assert_eq!(
            prompt.tool_result("c2"),
            Some(&ToolOutcome::Success { output: json!(7) })
        );
        assert_eq!(prompt.rounds, 3);
        // Round 3 sees both tool results in its transcript.
        assert_eq!(h.model.requests()[2].messages.len(), 5);
    }

    #[tokio::test]
    async fn round_limit_completes_without_error() {
        let config = Config {
            max_rounds: 2,
            ..Config::default()
        };
        let step = |id: &str| ModelStep::tool_call(id, "add", json!({ "a": 1, "b": 1 }));
        let h = harness_with(config, vec![step("c1"), step("c2"), step("c3")]).await;
        let (_, run) = start(&h, "tools", "loop").await;
        let (prompt, state) = run.wait().await.expect("wait");

        assert_eq!(state, ExecutorState::Completed { error: None });
        assert_eq!(prompt.rounds, 2);
        assert_eq!(h.model.remaining(), 1);
    }

    #[tokio::test]
    async fn unanswered_approvals_time_out() {
        let config = Config {
            approval_timeout_secs: Some(1),
            ..Config::default()
        };
        let h = harness_with(
            config,
            vec![
                ModelStep::tool_call("c1", "delete_note", json!({ "id": 1 })),
                ModelStep::text("Gave up."),
            ],
        )
        .await;
        let (_, run) = start(&h, "tools", "delete").await;
        let (prompt, _) = tokio::time::timeout(Duration::from_secs(10), run.wait())
            .await
            .expect("finished")
            .expect("wait");

        assert_eq!(
            prompt.tool_result("c1"),
            Some(&ToolOutcome::error("rejected", "approval timed out after 1s"))
        );
        assert!(!h.deleted.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn resume_finishes_open_tool_calls() {
        let h = harness(vec![ModelStep::text("3")]).await;
        let mut prompt = Prompt::new("u1", ModelTier::Medium, "tools", "add 1 and 2");
        prompt.begin_round().expect("round");
        prompt
            .push_tool_call(&crate::ai::AiToolCall {
                id: "c1".into(),
                name: "add".into(),
                arguments: json!({ "a": 1, "b": 2 }),
            })
            .expect("call");
        h.store().await.save_prompt(&prompt).await.expect("save");

        assert!(matches!(
            h.service.resume("missing").await,
            Err(Error::PromptNotFound(_))
        ));
        let handle = h.service.resume(&prompt.id).await.expect("resume");
        let (resumed, _) = handle.run().expect("run").wait().await.expect("wait");

        assert_eq!(
            resumed.tool_result("c1"),
            Some(&ToolOutcome::Success { output: json!(3) })
        );
        assert_eq!(resumed.rounds, 2);
        assert_eq!(resumed.text(), "3");
    }

    /// Counts rounds in its state record and reports the count as context.
    struct Tally;

    #[async_trait]
    impl Plugin for Tally {
        fn id(&self) -> &str {
            "tally"
        }

        fn state_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": { "count": { "type": "integer" } },
                "required": ["count"]
            })
        }

        fn hooks(&self) -> PluginHooks {
            PluginHooks::none().with_prepare()
        }

        async fn prepare(&self, mut ctx: PrepareContext<'_>) -> anyhow::Result<()> {
            let count = ctx
                .state
                .get()
                .and_then(|s| s["count"].as_i64())
                .unwrap_or_default();
            ctx.context
                .push(ContextItem::new("tally", format!("Count: {count}")));
            ctx.state.set(json!({ "count": count + 1 }))?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn plugin_state_is_loaded_and_saved_per_user() {
        let h = harness(vec![ModelStep::text("hi")]).await;
        let plugins = h.container.get::<PluginHost>().await.expect("plugins");
        plugins
            .register(Arc::new(Tally), json!({}))
            .await
            .expect("register");
        let store = h.store().await;
        store
            .save_state("u1", "tally", &json!({ "count": 5 }))
            .await
            .expect("seed");

        let (_, run) = start(&h, "tools", "hello").await;
        run.wait().await.expect("wait");

        assert_eq!(h.model.requests()[0].system, "Count: 5");
        assert_eq!(
            store.load_state("u1", "tally").await.expect("load"),
            Some(json!({ "count": 6 }))
        );
        assert_eq!(store.load_state("u2", "tally").await.expect("load"), None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn code_mode_gates_scripts_that_call_gated_tools() {
        let h = harness(vec![
            ModelStep::tool_call(
                "c1",
                crate::agent::EXECUTE_CODE_TOOL,
                json!({ "code": "const n = add({ a: 1, b: 1 });\ndelete_note({ id: n })" }),
            ),
            ModelStep::text("Deleted."),
        ])
        .await;
        let (handle, mut run) = start(&h, "code", "delete note 2").await;

        let waiting = run.wait_for_approval().await;
        assert_eq!(waiting.pending_call(), Some("c1"));
        assert!(!h.deleted.load(Ordering::SeqCst));
        assert_eq!(
            h.model.requests()[0]
                .tools
                .iter()
                .map(|t| t.name.as_str())
                .collect::<Vec<_>>(),
            vec![crate::agent::EXECUTE_CODE_TOOL]
        );

        handle.approve("c1").expect("approve");
        let (prompt, _) = run.wait().await.expect("wait");
        assert!(h.deleted.load(Ordering::SeqCst));
        assert_eq!(
            prompt.tool_result("c1"),
            Some(&ToolOutcome::Success { output: json!("deleted 2") })
        );
    }

    #[tokio::test]
    async fn unknown_modes_are_rejected() {
        let h = harness(vec![]).await;
        let err = h
            .service
            .create(CreatePrompt::new("u1", "hi").with_mode("telepathy"))
            .await
            .err()
            .expect("error");
        assert!(matches!(err, Error::UnknownMode(mode) if mode == "telepathy"));
    }
}
