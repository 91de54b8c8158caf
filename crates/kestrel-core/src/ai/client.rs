//! Model invocation capability
//!
//! The runtime never speaks a vendor protocol. Hosts inject an implementation
//! of [`ModelClient`] into the container as `dyn ModelClient`.

use async_trait::async_trait;

use crate::ai::types::{ModelRequest, ModelStep};

/// Receives streamed text as it arrives.
pub type DeltaSink<'a> = &'a (dyn Fn(&str) + Send + Sync);

#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Produce the next step for `request`, optionally streaming text deltas.
    async fn step(&self, request: &ModelRequest, on_delta: DeltaSink<'_>)
        -> anyhow::Result<ModelStep>;
}
