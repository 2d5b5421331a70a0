//! The capability the tuner needs from a page execution environment.

use std::time::Duration;

use async_trait::async_trait;
use fathom_common::DocumentRef;

use crate::error::ExecutionError;

/// A live session able to present a document and run script against it.
///
/// A session is driven by one training run at a time, so every method takes
/// `&mut self`. `run` evaluates `program` as a function body inside the
/// currently loaded document; `args` are visible to it as `arguments[0..]`
/// and the returned value must be JSON-serializable.
#[async_trait]
pub trait ExecutionEnvironment: Send {
    async fn load(&mut self, document: &DocumentRef) -> Result<(), ExecutionError>;

    async fn run(
        &mut self,
        program: &str,
        args: &[serde_json::Value],
        timeout: Duration,
    ) -> Result<serde_json::Value, ExecutionError>;

    /// Release the session. Called exactly once, on every exit path.
    async fn close(&mut self) -> Result<(), ExecutionError>;

    fn name(&self) -> &str;
}
