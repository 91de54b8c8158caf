//! Shared constants

use std::time::Duration;

/// Name of the per-user config directory under `$HOME`.
pub const CONFIG_DIR_NAME: &str = ".kestrel";

/// Default execution mode id.
pub const DEFAULT_MODE: &str = "tools";

/// Default maximum model rounds per prompt.
pub const DEFAULT_MAX_ROUNDS: usize = 50;

/// Earlier prompts of the same user replayed into the transcript.
pub const HISTORY_LIMIT: usize = 10;

/// Default tool execution timeout (2 minutes)
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(120);

/// Cap on a single tool result fed back to the model.
pub const MAX_TOOL_OUTPUT_CHARS: usize = 30_000;

pub mod sandbox {
    /// Default wall-clock budget for one evaluation.
    pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;
    pub const DEFAULT_MEMORY_LIMIT: usize = 64 * 1024 * 1024;
    pub const DEFAULT_MAX_STACK: usize = 1024 * 1024;
    /// Nesting limit when converting guest values out of the VM.
    pub const DEFAULT_MAX_DEPTH: usize = 64;
    /// Global identifier the request input is bound to.
    pub const INPUT_BINDING: &str = "input";
    /// Name the evaluated code is registered under.
    pub const MAIN_MODULE: &str = "sandbox.js";
    /// File name QuickJS reports for code evaluated as a script.
    pub const SCRIPT_FILE: &str = "eval_script";
}

pub mod events {
    pub const PROMPT_STARTED: &str = "prompt.started";
    pub const PROMPT_TEXT_DELTA: &str = "prompt.text_delta";
    pub const PROMPT_TEXT: &str = "prompt.text";
    pub const PROMPT_TOOL_CALL: &str = "prompt.tool_call";
    pub const PROMPT_TOOL_RESULT: &str = "prompt.tool_result";
    pub const PROMPT_APPROVAL_REQUESTED: &str = "prompt.approval_requested";
    pub const PROMPT_APPROVAL_RESOLVED: &str = "prompt.approval_resolved";
    pub const PROMPT_USAGE: &str = "prompt.usage";
    pub const PROMPT_COMPLETED: &str = "prompt.completed";
    pub const PROMPT_ERROR: &str = "prompt.error";
}
