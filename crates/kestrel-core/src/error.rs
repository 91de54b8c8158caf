//! Error taxonomy for the runtime
//!
//! Validation failures, lifecycle misuse and storage problems surface as
//! typed [`Error`] values. Collaborator traits (tools, plugin hooks, model
//! clients, stores) return `anyhow::Result` and are wrapped at the seam.

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid config for plugin '{plugin}': {message}")]
    InvalidConfig { plugin: String, message: String },

    #[error("invalid state for plugin '{plugin}': {message}")]
    InvalidState { plugin: String, message: String },

    #[error("invalid payload for event '{event}': {message}")]
    InvalidEventPayload { event: String, message: String },

    #[error("event '{0}' is not registered")]
    UnknownEvent(String),

    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    #[error("capability '{0}' is not registered")]
    MissingCapability(&'static str),

    #[error("circular capability dependency: {0}")]
    CircularDependency(String),

    #[error("capability '{name}' failed to initialize: {source}")]
    CapabilityInit {
        name: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("setup failed for plugin '{plugin}': {source}")]
    PluginSetup {
        plugin: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("{hook} hook failed for plugin '{plugin}': {source}")]
    PluginHook {
        plugin: String,
        hook: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("unknown execution mode '{0}'")]
    UnknownMode(String),

    #[error("prompt '{0}' not found")]
    PromptNotFound(String),

    #[error("prompt '{0}' is already running")]
    AlreadyRunning(String),

    #[error("prompt '{0}' is completed")]
    PromptCompleted(String),

    #[error("prompt '{prompt_id}' has no pending approval for call '{call_id}'")]
    NoPendingApproval { prompt_id: String, call_id: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// True for schema mismatches rejected at the call site.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::InvalidConfig { .. }
                | Error::InvalidState { .. }
                | Error::InvalidEventPayload { .. }
                | Error::UnknownEvent(_)
        )
    }
}
