//! Prompt data model and persistence capability

mod store;
mod types;

pub use store::{MemoryPromptStore, PromptStore};
pub use types::{OutputItem, PendingApproval, Prompt, PromptStatus, ToolOutcome};
