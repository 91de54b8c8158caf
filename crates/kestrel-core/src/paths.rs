//! Locations under `~/.kestrel`

use std::path::PathBuf;

use crate::constants::CONFIG_DIR_NAME;

/// Get the kestrel config directory (~/.kestrel)
pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(CONFIG_DIR_NAME)
}

/// Get the config file (~/.kestrel/config.toml)
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}

/// Get the logs directory (~/.kestrel/logs)
pub fn logs_dir() -> PathBuf {
    config_dir().join("logs")
}

/// Get the secrets file (~/.kestrel/tokens/secrets.json)
pub fn secrets_path() -> PathBuf {
    config_dir().join("tokens").join("secrets.json")
}

/// Ensure the logs directory exists, creating it if necessary
pub fn ensure_logs_dir() -> std::io::Result<PathBuf> {
    let dir = logs_dir();
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}
