//! Offloaded model worker.
//!
//! The model runs on a dedicated thread with its own runtime so that loading
//! and decoding never stall the caller's event loop.
//!
//! - [`protocol`]: Request/response/stream message types
//! - [`relay`]: Worker thread and the transparent message relay
//! - [`bridge`]: Engine-side request correlation and the offloaded runtime

pub mod bridge;
pub mod protocol;
pub mod relay;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::WorkerConfig;
use crate::runtime::{ChatRuntime, EngineOptions, InitProgressCallback, RuntimeLoader};

pub use bridge::{connect_offloaded_engine, create_offloaded_engine};

#[derive(Error, Debug)]
pub enum OffloadError {
    #[error("Failed to start worker: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Worker handshake failed: {0}")]
    Handshake(String),

    #[error("Worker failed to load model: {0}")]
    Load(String),

    #[error("Worker protocol error: {0}")]
    Protocol(String),

    #[error("Worker disconnected")]
    Disconnected,

    #[error("Offloading unavailable: {0}")]
    Unavailable(String),
}

/// Creates runtimes hosted outside the caller's execution context.
#[async_trait]
pub trait OffloadCreator: Send + Sync {
    async fn create(
        &self,
        model_id: &str,
        options: &EngineOptions,
        progress: InitProgressCallback,
    ) -> Result<Arc<dyn ChatRuntime>, OffloadError>;
}

/// Hosts the runtime on a dedicated worker thread.
pub struct ThreadOffload {
    loader: Arc<dyn RuntimeLoader>,
    config: WorkerConfig,
}

impl ThreadOffload {
    pub fn new(loader: Arc<dyn RuntimeLoader>, config: WorkerConfig) -> Self {
        Self { loader, config }
    }
}

#[async_trait]
impl OffloadCreator for ThreadOffload {
    async fn create(
        &self,
        model_id: &str,
        options: &EngineOptions,
        progress: InitProgressCallback,
    ) -> Result<Arc<dyn ChatRuntime>, OffloadError> {
        if !self.config.enabled {
            return Err(OffloadError::Unavailable("worker disabled in configuration".to_string()));
        }
        create_offloaded_engine(model_id, options, progress, self.loader.clone(), &self.config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::scripted::{ScriptedLoader, ScriptedRuntime};

    #[tokio::test]
    async fn test_disabled_worker_is_unavailable() {
        let runtime = Arc::new(ScriptedRuntime::new(["a"]));
        let loader = Arc::new(ScriptedLoader::new(runtime));
        let config = WorkerConfig {
            enabled: false,
            ..WorkerConfig::default()
        };
        let offload = ThreadOffload::new(loader.clone(), config);

        let options = EngineOptions {
            context_window_size: 64,
        };
        let result = offload.create("m", &options, Arc::new(|_| {})).await;
        assert!(matches!(result, Err(OffloadError::Unavailable(_))));
        assert_eq!(loader.load_count(), 0);
    }
}
