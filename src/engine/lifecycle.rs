//! Engine lifecycle: owns the single engine handle and drives initialization.
//!
//! ```text
//! Uninitialized ──init──▶ Initializing ──ok──▶ Ready
//!                              │                 │
//!                              └──fail──▶ InitFailed
//!                                       ◀──init──┘ (any state)
//! ```
//!
//! `init`, `generate` and `reset_chat` are serialized by a per-manager turn
//! lock, so overlapping calls run one after another instead of interleaving.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{watch, Mutex, RwLock};
use tracing::{info, warn};

use crate::config::Config;
use crate::engine::error::EngineError;
use crate::engine::progress::{ProgressAdapter, ProgressSink};
use crate::runtime::{ChatRuntime, EngineOptions, RuntimeLoader};
use crate::worker::{OffloadCreator, ThreadOffload};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Initializing,
    Ready,
    InitFailed,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Uninitialized => write!(f, "uninitialized"),
            EngineState::Initializing => write!(f, "initializing"),
            EngineState::Ready => write!(f, "ready"),
            EngineState::InitFailed => write!(f, "init-failed"),
        }
    }
}

/// Where the runtime behind a handle executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Offloaded,
    InProcess,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Offloaded => write!(f, "offloaded"),
            Backend::InProcess => write!(f, "in-process"),
        }
    }
}

/// Reference to the one live runtime of a manager.
#[derive(Clone)]
pub struct EngineHandle {
    runtime: Arc<dyn ChatRuntime>,
    backend: Backend,
}

impl EngineHandle {
    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub(crate) fn runtime(&self) -> &Arc<dyn ChatRuntime> {
        &self.runtime
    }
}

impl fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineHandle")
            .field("backend", &self.backend)
            .finish_non_exhaustive()
    }
}

/// Owns the engine handle and its lifecycle.
pub struct EngineManager {
    pub(crate) config: Arc<Config>,
    loader: Arc<dyn RuntimeLoader>,
    offload: Option<Arc<dyn OffloadCreator>>,
    pub(crate) handle: RwLock<Option<EngineHandle>>,
    pub(crate) turn: Arc<Mutex<()>>,
    state_tx: watch::Sender<EngineState>,
}

impl EngineManager {
    /// Create a manager that loads models with `loader`.
    ///
    /// When the worker is enabled in `config`, `init` first tries to host the
    /// runtime on a worker thread built with the same loader.
    pub fn new(config: Arc<Config>, loader: Arc<dyn RuntimeLoader>) -> Self {
        let offload: Option<Arc<dyn OffloadCreator>> = if config.worker.enabled {
            Some(Arc::new(ThreadOffload::new(loader.clone(), config.worker.clone())))
        } else {
            None
        };
        let (state_tx, _) = watch::channel(EngineState::Uninitialized);

        Self {
            config,
            loader,
            offload,
            handle: RwLock::new(None),
            turn: Arc::new(Mutex::new(())),
            state_tx,
        }
    }

    /// Replace the offloaded creator.
    pub fn with_offload(mut self, creator: Arc<dyn OffloadCreator>) -> Self {
        self.offload = Some(creator);
        self
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EngineState {
        *self.state_tx.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<EngineState> {
        self.state_tx.subscribe()
    }

    /// The live handle, if `init` has succeeded.
    pub async fn handle(&self) -> Option<EngineHandle> {
        self.handle.read().await.clone()
    }

    fn set_state(&self, state: EngineState) {
        self.state_tx.send_replace(state);
    }

    /// Load the configured model, replacing any previous handle.
    ///
    /// Tries the offloaded worker first and falls back to loading on the
    /// calling thread. Progress goes to `progress`; the last event on success
    /// is `(100, "ready")`.
    pub async fn init(&self, progress: Option<ProgressSink>) -> Result<(), EngineError> {
        let _turn = self.turn.lock().await;
        self.set_state(EngineState::Initializing);
        let mut pending = InitGuard {
            state_tx: Some(&self.state_tx),
        };
        // The previous handle is discarded, never merged with the new one.
        *self.handle.write().await = None;

        let adapter = ProgressAdapter::new(progress);
        adapter.emit(0, "starting");

        let model_id = self.config.model.model_id.as_str();
        let options = EngineOptions {
            context_window_size: self.config.model.context_window_size,
        };

        let mut offload_failure = None;
        let mut created = None;
        if let Some(offload) = &self.offload {
            match offload.create(model_id, &options, adapter.callback()).await {
                Ok(runtime) => created = Some((runtime, Backend::Offloaded)),
                Err(e) => {
                    warn!("Offloaded engine unavailable, loading in-process: {e}");
                    offload_failure = Some(e);
                }
            }
        }

        let (runtime, backend) = match created {
            Some(created) => created,
            None => match self.loader.load(model_id, &options, adapter.callback()).await {
                Ok(runtime) => (runtime, Backend::InProcess),
                Err(source) => {
                    pending.disarm();
                    self.set_state(EngineState::InitFailed);
                    return Err(EngineError::InitFailed {
                        offload: offload_failure,
                        source,
                    });
                }
            },
        };

        *self.handle.write().await = Some(EngineHandle { runtime, backend });
        pending.disarm();
        self.set_state(EngineState::Ready);
        adapter.emit(100, "ready");

        info!(model_id, backend = %backend, "Engine ready");
        Ok(())
    }

    /// Clear the engine's conversation state. Does nothing before `init`.
    pub async fn reset_chat(&self) -> Result<(), EngineError> {
        let _turn = self.turn.lock().await;
        match self.handle().await {
            Some(handle) => Ok(handle.runtime().reset_chat().await?),
            None => Ok(()),
        }
    }
}

/// Publishes `InitFailed` if an `init` is dropped before it finishes.
struct InitGuard<'a> {
    state_tx: Option<&'a watch::Sender<EngineState>>,
}

impl InitGuard<'_> {
    fn disarm(&mut self) {
        self.state_tx = None;
    }
}

impl Drop for InitGuard<'_> {
    fn drop(&mut self) {
        if let Some(state_tx) = self.state_tx.take() {
            warn!("Initialization abandoned before completion");
            state_tx.send_replace(EngineState::InitFailed);
        }
    }
}
