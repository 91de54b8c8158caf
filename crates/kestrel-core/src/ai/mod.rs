//! Model invocation layer
//!
//! Vendor-neutral request/step types, the injected [`ModelClient`]
//! capability, and a scripted client for replays.

pub mod client;
pub mod scripted;
pub mod types;

pub use client::{DeltaSink, ModelClient};
pub use scripted::ScriptedModel;
pub use types::{AiTool, AiToolCall, ModelRequest, ModelStep, ModelTier, Usage};
