//! Persistence layer
//!
//! SQLite-based storage for:
//! - Prompt records and their output logs
//! - Per-user plugin state

mod database;
mod prompts;

pub use database::{Database, SharedDatabase};
pub use prompts::SqlitePromptStore;
