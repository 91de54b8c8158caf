//! Tool catalog and dispatch
//!
//! Provides the tool registry, per-round tool sets, approval policies and
//! execution hooks.

pub mod function;
pub mod hooks;
pub mod registry;

pub use function::FunctionTool;
pub use hooks::{DenyListHook, HookResult, LoggingHook, PostToolHook, PreToolHook};
pub use registry::{
    parse_params, ApprovalPolicy, Tool, ToolContext, ToolRegistry, ToolResult, ToolSet,
};
