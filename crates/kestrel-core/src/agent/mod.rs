//! Prompt execution
//!
//! - `ModeRegistry` / `ExecutionMode` - per-round planning (`tools`, `code`)
//! - `PromptExecutor` - the round loop and approval state machine for one prompt
//! - `PromptService` / `PromptHandle` / `RunHandle` - the lifecycle surface
//! - `LoopEvent` / `LoopInput` - what a run publishes and what it accepts

pub mod code;
pub mod executor;
pub mod loop_events;
pub mod modes;
pub mod service;
pub mod tool_calling;

pub use code::{CodeMode, EXECUTE_CODE_TOOL};
pub use executor::{ExecutorContext, ExecutorState, PromptExecutor};
pub use loop_events::{LoopEvent, LoopInput};
pub use modes::{ExecutionMode, ModeRegistry, RoundInput, RoundPlan};
pub use service::{CreatePrompt, PromptHandle, PromptService, RunHandle};
pub use tool_calling::ToolCallingMode;
