use async_trait::async_trait;

use crate::config::ExecutorConfig;
use crate::ExecutorError;

/// A component that runs alongside the executor and follows its reloads.
#[async_trait]
pub trait Extension: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&self) -> Result<(), ExecutorError>;

    /// Called on every reload tick after sessions are initialized and before
    /// any are launched.
    async fn reload(&self, config: &ExecutorConfig) -> Result<(), ExecutorError>;

    async fn stop(&self) -> Result<(), ExecutorError>;
}
