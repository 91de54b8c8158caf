//! Secrets resolution
//!
//! `get(user_id, id)` is the only operation plugins and tools rely on.
//! Providers: environment variables, an in-memory map, and a JSON file
//! partitioned by user.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::paths;

#[async_trait]
pub trait SecretsProvider: Send + Sync {
    async fn get(&self, user_id: &str, id: &str) -> Result<Option<String>>;
}

/// Reads `<PREFIX><ID>` from the process environment, ignoring the user.
///
/// Ids are upper-cased and non-alphanumerics become `_`, so `github.token`
/// maps to `KESTREL_SECRET_GITHUB_TOKEN`.
#[derive(Debug, Clone)]
pub struct EnvSecrets {
    prefix: String,
}

impl EnvSecrets {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn var_name(&self, id: &str) -> String {
        let key: String = id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}{}", self.prefix, key)
    }
}

impl Default for EnvSecrets {
    fn default() -> Self {
        Self::new("KESTREL_SECRET_")
    }
}

#[async_trait]
impl SecretsProvider for EnvSecrets {
    async fn get(&self, _user_id: &str, id: &str) -> Result<Option<String>> {
        Ok(std::env::var(self.var_name(id)).ok())
    }
}

/// Fixed secrets, mainly for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct StaticSecrets {
    values: HashMap<(String, String), String>,
}

impl StaticSecrets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, user_id: &str, id: &str, value: impl Into<String>) -> Self {
        self.values
            .insert((user_id.to_string(), id.to_string()), value.into());
        self
    }
}

#[async_trait]
impl SecretsProvider for StaticSecrets {
    async fn get(&self, user_id: &str, id: &str) -> Result<Option<String>> {
        Ok(self
            .values
            .get(&(user_id.to_string(), id.to_string()))
            .cloned())
    }
}

/// Secrets stored in a JSON file: `{ "<user>": { "<id>": "<value>" } }`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileSecrets {
    #[serde(skip)]
    path: PathBuf,
    #[serde(flatten)]
    users: HashMap<String, HashMap<String, String>>,
}

impl FileSecrets {
    /// Load from the default location (~/.kestrel/tokens/secrets.json)
    pub fn load() -> Result<Self> {
        Self::load_from_path(&paths::secrets_path())
    }

    /// Load from a specific path; a missing file is an empty store.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut store = if path.exists() {
            let contents = fs::read_to_string(path)?;
            serde_json::from_str::<FileSecrets>(&contents)?
        } else {
            Self::default()
        };
        store.path = path.to_path_buf();
        Ok(store)
    }

    /// Write back to the file this store was loaded from.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        fs::write(&self.path, contents)?;

        // Set restrictive permissions on Unix
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(metadata) = fs::metadata(&self.path) {
                let mut permissions = metadata.permissions();
                permissions.set_mode(0o600);
                let _ = fs::set_permissions(&self.path, permissions);
            }
        }
        Ok(())
    }

    pub fn set(&mut self, user_id: &str, id: &str, value: impl Into<String>) {
        self.users
            .entry(user_id.to_string())
            .or_default()
            .insert(id.to_string(), value.into());
    }

    pub fn remove(&mut self, user_id: &str, id: &str) {
        if let Some(secrets) = self.users.get_mut(user_id) {
            secrets.remove(id);
        }
    }
}

#[async_trait]
impl SecretsProvider for FileSecrets {
    async fn get(&self, user_id: &str, id: &str) -> Result<Option<String>> {
        Ok(self
            .users
            .get(user_id)
            .and_then(|secrets| secrets.get(id))
            .cloned())
    }
}
