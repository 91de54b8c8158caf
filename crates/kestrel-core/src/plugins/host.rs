use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info};

use super::types::{Plugin, PrepareContext, ReadyContext, SetupContext};
use crate::container::{Container, Service};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::prompt::Prompt;
use crate::schema::Schema;
use crate::state::StateStore;
use crate::tools::ToolSet;

#[derive(Clone)]
struct Registered {
    plugin: Arc<dyn Plugin>,
    config: Arc<Value>,
    state_schema: Schema,
}

/// What the turn assembler knows about the round being prepared.
#[derive(Debug, Clone, Copy)]
pub struct TurnInput<'a> {
    pub user_id: &'a str,
    pub prompt_id: &'a str,
    pub input: &'a str,
    pub round: usize,
    pub history: &'a [Prompt],
}

/// Owns registered plugins and drives their lifecycle hooks.
pub struct PluginHost {
    container: Container,
    plugins: RwLock<Vec<Registered>>,
    started: AtomicBool,
}

impl PluginHost {
    pub fn new(container: &Container) -> Self {
        Self {
            container: container.root(),
            plugins: RwLock::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Validate `config`, run `setup`, and add the plugin.
    ///
    /// A plugin with an id that is already registered replaces the earlier
    /// one in its original position. A plugin whose setup fails is not
    /// registered.
    pub async fn register(&self, plugin: Arc<dyn Plugin>, config: Value) -> Result<()> {
        let id = plugin.id().to_string();
        let config_schema = Schema::new(plugin.config_schema())?;
        config_schema
            .check(&config)
            .map_err(|message| Error::InvalidConfig {
                plugin: id.clone(),
                message,
            })?;
        let state_schema = Schema::new(plugin.state_schema())?;
        let config = Arc::new(config);

        if plugin.hooks().setup {
            debug!(plugin = %id, "Running plugin setup");
            plugin
                .setup(SetupContext {
                    container: &self.container,
                    secrets: self.container.secrets(),
                    config: &config,
                })
                .await
                .map_err(|source| Error::PluginSetup {
                    plugin: id.clone(),
                    source,
                })?;
        }

        let entry = Registered {
            plugin,
            config,
            state_schema,
        };
        let mut plugins = self.plugins.write();
        match plugins.iter().position(|p| p.plugin.id() == id) {
            Some(index) => {
                debug!(plugin = %id, "Replaced registered plugin");
                plugins[index] = entry;
            }
            None => plugins.push(entry),
        }
        info!(plugin = %id, "Registered plugin");
        Ok(())
    }

    /// Register with the config found under `plugins.<id>` in the config file.
    pub async fn register_from_config(&self, plugin: Arc<dyn Plugin>) -> Result<()> {
        let config = self.container.config().plugin_config(plugin.id());
        self.register(plugin, config).await
    }

    /// Run every `ready` hook in registration order. Later calls do nothing.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        for entry in self.entries() {
            if !entry.plugin.hooks().ready {
                continue;
            }
            entry
                .plugin
                .ready(ReadyContext {
                    container: &self.container,
                    config: &entry.config,
                })
                .await
                .map_err(|source| Error::PluginHook {
                    plugin: entry.plugin.id().to_string(),
                    hook: "ready",
                    source,
                })?;
        }
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Run every `prepare` hook for one round, in registration order.
    ///
    /// Each plugin only sees its own state slot. The first failure stops
    /// the round.
    pub async fn prepare_turn(
        &self,
        turn: TurnInput<'_>,
        context: &mut Context,
        tools: &mut ToolSet,
        state: &mut StateStore,
    ) -> Result<()> {
        for entry in self.entries() {
            if !entry.plugin.hooks().prepare {
                continue;
            }
            let id = entry.plugin.id().to_string();
            entry
                .plugin
                .prepare(PrepareContext {
                    config: &entry.config,
                    context: &mut *context,
                    tools: &mut *tools,
                    state: state.slot(&id),
                    history: turn.history,
                    user_id: turn.user_id,
                    prompt_id: turn.prompt_id,
                    input: turn.input,
                    round: turn.round,
                    container: &self.container,
                })
                .await
                .map_err(|source| Error::PluginHook {
                    plugin: id,
                    hook: "prepare",
                    source,
                })?;
        }
        Ok(())
    }

    pub fn plugin_ids(&self) -> Vec<String> {
        self.plugins
            .read()
            .iter()
            .map(|p| p.plugin.id().to_string())
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins
            .read()
            .iter()
            .find(|p| p.plugin.id() == id)
            .map(|p| p.plugin.clone())
    }

    /// State schemas keyed by plugin id, for building a [`StateStore`].
    pub fn state_schemas(&self) -> HashMap<String, Schema> {
        self.plugins
            .read()
            .iter()
            .map(|p| (p.plugin.id().to_string(), p.state_schema.clone()))
            .collect()
    }

    fn entries(&self) -> Vec<Registered> {
        self.plugins.read().clone()
    }
}

#[async_trait]
impl Service for PluginHost {
    async fn create(container: &Container) -> anyhow::Result<Self> {
        Ok(Self::new(container))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::context::ContextItem;
    use crate::plugins::PluginHooks;
    use crate::secrets::StaticSecrets;
    use crate::tools::FunctionTool;
    use parking_lot::Mutex;
    use serde_json::json;

    fn container() -> Container {
        Container::new(Config::default(), Arc::new(StaticSecrets::new()))
    }

    /// Writes `{"x": <round>}` to its own slot and reports what it read.
    struct Counter {
        id: &'static str,
        seen: Arc<Mutex<Vec<Option<Value>>>>,
    }

    #[async_trait]
    impl Plugin for Counter {
        fn id(&self) -> &str {
            self.id
        }

        fn state_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": { "x": { "type": "integer" } },
                "required": ["x"]
            })
        }

        fn hooks(&self) -> PluginHooks {
            PluginHooks::none().with_prepare()
        }

        async fn prepare(&self, mut ctx: PrepareContext<'_>) -> anyhow::Result<()> {
            self.seen.lock().push(ctx.state.get());
            if self.id == "a" {
                ctx.state.set(json!({ "x": 1 }))?;
            }
            ctx.context
                .push(ContextItem::new("note", format!("{} saw round {}", self.id, ctx.round)));
            ctx.tools.push(
                FunctionTool::sync(format!("{}.ping", self.id), "Ping", |_, _| Ok(json!("pong")))
                    .into_arc(),
            );
            Ok(())
        }
    }

    fn turn<'a>(round: usize) -> TurnInput<'a> {
        TurnInput {
            user_id: "u1",
            prompt_id: "p1",
            input: "hello",
            round,
            history: &[],
        }
    }

    #[tokio::test]
    async fn plugins_only_see_their_own_state() {
        let host = PluginHost::new(&container());
        let seen_a = Arc::new(Mutex::new(Vec::new()));
        let seen_b = Arc::new(Mutex::new(Vec::new()));
        host.register(Arc::new(Counter { id: "a", seen: seen_a.clone() }), json!({}))
            .await
            .expect("register a");
        host.register(Arc::new(Counter { id: "b", seen: seen_b.clone() }), json!({}))
            .await
            .expect("register b");

        let mut state = StateStore::new(host.state_schemas(), Default::default());
        let mut context = Context::new();
        let mut tools = ToolSet::new();
        host.prepare_turn(turn(1), &mut context, &mut tools, &mut state)
            .await
            .expect("prepare");

        assert_eq!(state.get_state("a"), Some(json!({ "x": 1 })));
        assert_eq!(state.get_state("b"), None);
        assert_eq!(*seen_b.lock(), vec![None]);
        assert_eq!(context.render(), "a saw round 1\n\nb saw round 1");
        assert_eq!(tools.names(), vec!["a.ping", "b.ping"]);

        let mut context = Context::new();
        host.prepare_turn(turn(2), &mut context, &mut ToolSet::new(), &mut state)
            .await
            .expect("prepare");
        assert_eq!(seen_a.lock().last().cloned().flatten(), Some(json!({ "x": 1 })));
    }

    struct Configured;

    #[async_trait]
    impl Plugin for Configured {
        fn id(&self) -> &str {
            "configured"
        }

        fn config_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": { "limit": { "type": "integer" } },
                "required": ["limit"]
            })
        }
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let host = PluginHost::new(&container());
        let err = host
            .register(Arc::new(Configured), json!({ "limit": "ten" }))
            .await
            .expect_err("must reject");
        assert!(matches!(err, Error::InvalidConfig { ref plugin, .. } if plugin == "configured"));
        assert!(host.plugin_ids().is_empty());

        host.register(Arc::new(Configured), json!({ "limit": 10 }))
            .await
            .expect("valid config");
        assert_eq!(host.plugin_ids(), vec!["configured"]);
    }

    #[tokio::test]
    async fn config_comes_from_the_config_file_section() {
        let mut config = Config::default();
        config
            .plugins
            .insert("configured".into(), json!({ "limit": 3 }));
        let container = Container::new(config, Arc::new(StaticSecrets::new()));
        let host = container.get::<PluginHost>().await.expect("host");
        host.register_from_config(Arc::new(Configured))
            .await
            .expect("register");
        assert!(host.get("configured").is_some());
    }

    struct Lifecycle {
        id: &'static str,
        label: &'static str,
        fail_setup: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Plugin for Lifecycle {
        fn id(&self) -> &str {
            self.id
        }

        fn hooks(&self) -> PluginHooks {
            PluginHooks::none().with_setup().with_ready()
        }

        async fn setup(&self, _ctx: SetupContext<'_>) -> anyhow::Result<()> {
            if self.fail_setup {
                anyhow::bail!("no credentials");
            }
            self.log.lock().push(format!("setup {}", self.label));
            Ok(())
        }

        async fn ready(&self, _ctx: ReadyContext<'_>) -> anyhow::Result<()> {
            self.log.lock().push(format!("ready {}", self.label));
            Ok(())
        }
    }

    #[tokio::test]
    async fn last_registration_wins_and_ready_runs_once() {
        let host = PluginHost::new(&container());
        let log = Arc::new(Mutex::new(Vec::new()));
        let plugin = |id, label| {
            Arc::new(Lifecycle {
                id,
                label,
                fail_setup: false,
                log: log.clone(),
            })
        };
        host.register(plugin("one", "one-v1"), json!({})).await.expect("one");
        host.register(plugin("two", "two"), json!({})).await.expect("two");
        host.register(plugin("one", "one-v2"), json!({})).await.expect("one again");

        assert_eq!(host.plugin_ids(), vec!["one", "two"]);
        host.start().await.expect("start");
        host.start().await.expect("second start");
        assert!(host.is_started());
        assert_eq!(
            *log.lock(),
            vec!["setup one-v1", "setup two", "setup one-v2", "ready one-v2", "ready two"]
        );
    }

    #[tokio::test]
    async fn failing_setup_aborts_registration() {
        let host = PluginHost::new(&container());
        let err = host
            .register(
                Arc::new(Lifecycle {
                    id: "broken",
                    label: "broken",
                    fail_setup: true,
                    log: Arc::new(Mutex::new(Vec::new())),
                }),
                json!({}),
            )
            .await
            .expect_err("setup fails");
        assert!(matches!(err, Error::PluginSetup { .. }));
        assert!(err.to_string().contains("no credentials"));
        assert!(host.get("broken").is_none());
    }
}
