//! Kestrel core
//!
//! Runtime for conversational prompts extended by plugins:
//!
//! - `container` - lazily built, type-keyed capabilities
//! - `plugins` - setup / prepare / ready lifecycle, per-plugin state
//! - `events`, `tools` - typed event bus and tool registry
//! - `agent` - execution modes, the prompt executor and approvals
//! - `sandbox` - QuickJS interpreter behind the `code` mode
//! - `storage` - SQLite persistence for prompts and plugin state

pub mod agent;
pub mod ai;
pub mod config;
pub mod constants;
pub mod container;
pub mod context;
pub mod error;
pub mod events;
pub mod paths;
pub mod plugins;
pub mod prompt;
pub mod sandbox;
pub mod schema;
pub mod secrets;
pub mod state;
pub mod storage;
pub mod tools;

pub use agent::{
    CreatePrompt, ExecutionMode, ExecutorState, ModeRegistry, PromptHandle, PromptService,
    RunHandle,
};
pub use ai::{ModelClient, ScriptedModel};
pub use config::Config;
pub use container::{Container, Service};
pub use context::{Context, ContextItem};
pub use error::{Error, Result};
pub use events::{EventBus, EventDefinition, EventEnvelope};
pub use plugins::{Plugin, PluginHooks, PluginHost};
pub use prompt::{Prompt, PromptStore};
pub use sandbox::{ExecutionRequest, HostFunction, Sandbox};
pub use schema::Schema;
pub use secrets::SecretsProvider;
pub use state::{StateSlot, StateStore};
pub use tools::{Tool, ToolRegistry, ToolSet};
