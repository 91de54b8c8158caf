//! Runtime configuration
//!
//! Loaded from `~/.kestrel/config.toml` (missing file = defaults), then
//! overridden by `KESTREL_*` environment variables.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ai::types::ModelTier;
use crate::constants::{self, sandbox};
use crate::error::{Error, Result};
use crate::paths;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Mode used when a prompt does not name one.
    pub default_mode: String,
    pub default_tier: ModelTier,
    pub max_rounds: usize,
    pub tool_timeout_secs: u64,
    /// Regex patterns; matching tool names are blocked before they run.
    pub disabled_tools: Vec<String>,
    /// Unset means an approval waits until someone answers it.
    pub approval_timeout_secs: Option<u64>,
    /// SQLite store location; unset keeps prompts in memory.
    pub database_path: Option<PathBuf>,
    pub sandbox: SandboxSettings,
    /// Plugin configs keyed by plugin id.
    pub plugins: BTreeMap<String, Value>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_mode: constants::DEFAULT_MODE.to_string(),
            default_tier: ModelTier::default(),
            max_rounds: constants::DEFAULT_MAX_ROUNDS,
            tool_timeout_secs: constants::DEFAULT_TOOL_TIMEOUT.as_secs(),
            disabled_tools: Vec::new(),
            approval_timeout_secs: None,
            database_path: None,
            sandbox: SandboxSettings::default(),
            plugins: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    pub timeout_ms: u64,
    pub memory_limit_bytes: usize,
    pub max_stack_bytes: usize,
    pub max_marshal_depth: usize,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            timeout_ms: sandbox::DEFAULT_TIMEOUT_MS,
            memory_limit_bytes: sandbox::DEFAULT_MEMORY_LIMIT,
            max_stack_bytes: sandbox::DEFAULT_MAX_STACK,
            max_marshal_depth: sandbox::DEFAULT_MAX_DEPTH,
        }
    }
}

impl Config {
    /// Load from the default location and apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_path(&paths::config_file())?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Load from a specific file; a missing file yields defaults.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(mode) = lookup("KESTREL_MODE") {
            self.default_mode = mode;
        }
        if let Some(tier) = lookup("KESTREL_TIER") {
            self.default_tier = tier
                .parse()
                .map_err(|e: String| Error::Config(format!("KESTREL_TIER: {e}")))?;
        }
        if let Some(rounds) = lookup("KESTREL_MAX_ROUNDS") {
            self.max_rounds = parse_env("KESTREL_MAX_ROUNDS", &rounds)?;
        }
        if let Some(secs) = lookup("KESTREL_APPROVAL_TIMEOUT_SECS") {
            self.approval_timeout_secs = Some(parse_env("KESTREL_APPROVAL_TIMEOUT_SECS", &secs)?);
        }
        if let Some(db) = lookup("KESTREL_DB") {
            self.database_path = Some(PathBuf::from(db));
        }
        if let Some(ms) = lookup("KESTREL_SANDBOX_TIMEOUT_MS") {
            self.sandbox.timeout_ms = parse_env("KESTREL_SANDBOX_TIMEOUT_MS", &ms)?;
        }
        Ok(())
    }

    /// Config for a plugin id, `{}` when none was given.
    pub fn plugin_config(&self, plugin_id: &str) -> Value {
        self.plugins
            .get(plugin_id)
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()))
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    pub fn approval_timeout(&self) -> Option<Duration> {
        self.approval_timeout_secs.map(Duration::from_secs)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| Error::Config(format!("{key}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Config::load_from_path(&dir.path().join("nope.toml")).expect("load");
        assert_eq!(config.default_mode, "tools");
        assert_eq!(config.max_rounds, 50);
        assert!(config.approval_timeout_secs.is_none());
        assert_eq!(config.sandbox.timeout_ms, 5_000);
    }

    #[test]
    fn parses_toml_with_plugin_tables() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
default_mode = "code"
max_rounds = 8
disabled_tools = ["^shell\\."]

[sandbox]
timeout_ms = 250

[plugins.notes]
limit = 3
tags = ["a", "b"]
"#,
        )
        .expect("write");

        let config = Config::load_from_path(&path).expect("load");
        assert_eq!(config.default_mode, "code");
        assert_eq!(config.max_rounds, 8);
        assert_eq!(config.disabled_tools, vec![r"^shell\.".to_string()]);
        assert_eq!(config.sandbox.timeout_ms, 250);
        assert_eq!(config.sandbox.max_marshal_depth, 64);
        assert_eq!(config.plugin_config("notes"), json!({"limit": 3, "tags": ["a", "b"]}));
        assert_eq!(config.plugin_config("other"), json!({}));
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "max_rounds = \"many\"").expect("write");
        assert!(matches!(Config::load_from_path(&path), Err(Error::Config(_))));
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("KESTREL_MODE", "code"),
            ("KESTREL_TIER", "large"),
            ("KESTREL_MAX_ROUNDS", "3"),
            ("KESTREL_APPROVAL_TIMEOUT_SECS", "30"),
        ]);
        let mut config = Config::default();
        config
            .apply_env_overrides(|k| env.get(k).map(|v| v.to_string()))
            .expect("overrides");
        assert_eq!(config.default_mode, "code");
        assert_eq!(config.default_tier, ModelTier::Large);
        assert_eq!(config.max_rounds, 3);
        assert_eq!(config.approval_timeout(), Some(Duration::from_secs(30)));

        let mut config = Config::default();
        let err = config
            .apply_env_overrides(|k| (k == "KESTREL_MAX_ROUNDS").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
