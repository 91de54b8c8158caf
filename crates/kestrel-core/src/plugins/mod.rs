//! Plugin lifecycle
//!
//! Plugins contribute context items, tools and a namespaced state record to
//! every model round. The [`PluginHost`] validates their config, runs their
//! `setup`/`ready` hooks, and calls `prepare` once per round.

mod host;
mod types;

pub use host::{PluginHost, TurnInput};
pub use types::{Plugin, PluginHooks, PrepareContext, ReadyContext, SetupContext};
