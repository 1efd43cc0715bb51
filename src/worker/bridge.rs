//! Engine-side abstraction for communicating with the worker.
//!
//! Serializes requests onto the worker inbox, correlates responses by request
//! ID, forwards load progress, and exposes the hosted model as a
//! [`ChatRuntime`] whose token stream pulls one chunk per request.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::sync::{mpsc, oneshot, Mutex as TokioMutex};
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;
use crate::runtime::{
    ChatRuntime, CompletionRequest, EngineOptions, InitProgressCallback, RuntimeError,
    RuntimeLoader, TokenStream,
};
use crate::worker::protocol::{WorkerCommand, WorkerPayload, WorkerRequest, WorkerResponse};
use crate::worker::relay::{spawn_worker, WorkerChannels};
use crate::worker::OffloadError;

struct PendingRequest {
    tx: oneshot::Sender<WorkerPayload>,
    progress: Option<InitProgressCallback>,
}

type PendingMap = Arc<TokioMutex<HashMap<u64, PendingRequest>>>;

/// Engine-side handle to a worker.
pub struct WorkerBridge {
    /// Sends serialized requests to the worker inbox.
    cmd_tx: mpsc::UnboundedSender<String>,
    /// Tracks requests awaiting a terminal response.
    pending: PendingMap,
    /// Next request ID counter.
    next_id: AtomicU64,
}

impl WorkerBridge {
    /// Wrap a running worker and start routing its responses.
    pub fn new(channels: WorkerChannels) -> Self {
        let pending: PendingMap = Arc::new(TokioMutex::new(HashMap::new()));
        tokio::spawn(response_reader_task(channels.outbox, pending.clone()));

        Self {
            cmd_tx: channels.inbox,
            pending,
            next_id: AtomicU64::new(1),
        }
    }

    /// Send a command and wait for its terminal response.
    ///
    /// Intermediate progress for this request goes to `progress`.
    pub async fn request(
        &self,
        command: WorkerCommand,
        progress: Option<InitProgressCallback>,
    ) -> Result<WorkerPayload, OffloadError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let json = serde_json::to_string(&WorkerRequest { id, command })
            .map_err(|e| OffloadError::Protocol(format!("serialize error: {e}")))?;

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .await
            .insert(id, PendingRequest { tx, progress });

        if self.cmd_tx.send(json).is_err() {
            self.pending.lock().await.remove(&id);
            return Err(OffloadError::Disconnected);
        }

        rx.await.map_err(|_| OffloadError::Disconnected)
    }
}

/// Route worker responses to their pending requests until the worker goes away.
async fn response_reader_task(mut outbox: mpsc::UnboundedReceiver<String>, pending: PendingMap) {
    while let Some(line) = outbox.recv().await {
        let response: WorkerResponse = match serde_json::from_str(&line) {
            Ok(response) => response,
            Err(e) => {
                warn!("Dropping undecodable worker response: {e}");
                continue;
            }
        };

        let mut pending = pending.lock().await;
        if response.payload.is_terminal() {
            match pending.remove(&response.id) {
                Some(request) => {
                    let _ = request.tx.send(response.payload);
                }
                None => debug!(id = response.id, "Response for unknown request"),
            }
        } else if let WorkerPayload::InitProgress { report } = response.payload {
            if let Some(callback) = pending.get(&response.id).and_then(|p| p.progress.as_ref()) {
                callback(report);
            }
        }
    }

    // Dropping the senders wakes every waiter with a disconnect.
    let failed = pending.lock().await.drain().count();
    info!(failed, "Worker channel closed");
}

/// A model hosted on the worker, driven through the bridge.
pub struct OffloadedRuntime {
    bridge: Arc<WorkerBridge>,
}

impl OffloadedRuntime {
    pub fn new(bridge: Arc<WorkerBridge>) -> Self {
        Self { bridge }
    }
}

impl From<OffloadError> for RuntimeError {
    fn from(e: OffloadError) -> Self {
        RuntimeError::Transport(e.to_string())
    }
}

fn unexpected(payload: &WorkerPayload) -> RuntimeError {
    RuntimeError::Transport(format!("unexpected worker payload: {payload:?}"))
}

#[async_trait]
impl ChatRuntime for OffloadedRuntime {
    async fn chat_completion(&self, request: CompletionRequest) -> Result<TokenStream, RuntimeError> {
        let stream_id = match self
            .bridge
            .request(WorkerCommand::ChatCompletionStreamInit { request }, None)
            .await?
        {
            WorkerPayload::StreamReady { stream_id } => stream_id,
            WorkerPayload::Error { message } => return Err(RuntimeError::Generation(message)),
            other => return Err(unexpected(&other)),
        };

        // Each poll of the stream asks the worker for exactly one more chunk.
        let stream = stream::unfold(Some(self.bridge.clone()), move |state| async move {
            let bridge = state?;
            let reply = bridge
                .request(WorkerCommand::ChatCompletionStreamNextChunk { stream_id }, None)
                .await;
            match reply {
                Ok(WorkerPayload::Chunk {
                    fragment: Some(fragment),
                }) => Some((Ok(fragment), Some(bridge))),
                Ok(WorkerPayload::Chunk { fragment: None }) => None,
                Ok(WorkerPayload::Error { message }) => {
                    Some((Err(RuntimeError::Generation(message)), None))
                }
                Ok(other) => Some((Err(unexpected(&other)), None)),
                Err(e) => Some((Err(e.into()), None)),
            }
        });

        Ok(stream.boxed())
    }

    async fn reset_chat(&self) -> Result<(), RuntimeError> {
        match self.bridge.request(WorkerCommand::ResetChat, None).await? {
            WorkerPayload::ResetDone => Ok(()),
            WorkerPayload::Error { message } => Err(RuntimeError::Generation(message)),
            other => Err(unexpected(&other)),
        }
    }
}

/// Start a worker, complete the handshake, and load `model_id` inside it.
pub async fn create_offloaded_engine(
    model_id: &str,
    options: &EngineOptions,
    progress: InitProgressCallback,
    loader: Arc<dyn RuntimeLoader>,
    config: &WorkerConfig,
) -> Result<Arc<dyn ChatRuntime>, OffloadError> {
    let channels = spawn_worker(&config.thread_name, loader)?;
    connect_offloaded_engine(channels, model_id, options, progress, config).await
}

/// Handshake with an already running worker and load `model_id` inside it.
pub async fn connect_offloaded_engine(
    channels: WorkerChannels,
    model_id: &str,
    options: &EngineOptions,
    progress: InitProgressCallback,
    config: &WorkerConfig,
) -> Result<Arc<dyn ChatRuntime>, OffloadError> {
    let bridge = Arc::new(WorkerBridge::new(channels));

    let handshake = tokio::time::timeout(
        Duration::from_millis(config.handshake_timeout_ms),
        bridge.request(WorkerCommand::Ping, None),
    )
    .await;
    match handshake {
        Ok(Ok(WorkerPayload::Pong)) => debug!(thread = config.thread_name, "Worker handshake complete"),
        Ok(Ok(other)) => return Err(OffloadError::Handshake(format!("unexpected reply {other:?}"))),
        Ok(Err(e)) => return Err(OffloadError::Handshake(e.to_string())),
        Err(_) => {
            return Err(OffloadError::Handshake(format!(
                "no reply within {} ms",
                config.handshake_timeout_ms
            )))
        }
    }

    let reload = WorkerCommand::Reload {
        model_id: model_id.to_string(),
        options: options.clone(),
    };
    match bridge.request(reload, Some(progress)).await? {
        WorkerPayload::Loaded => Ok(Arc::new(OffloadedRuntime::new(bridge))),
        WorkerPayload::Error { message } => Err(OffloadError::Load(message)),
        other => Err(OffloadError::Protocol(format!("unexpected reply {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::scripted::{ScriptedLoader, ScriptedRuntime};

    #[tokio::test]
    async fn test_request_after_worker_exit_is_disconnected() {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel::<String>();
        drop(inbox_rx);
        drop(outbox_tx);

        let bridge = WorkerBridge::new(WorkerChannels {
            inbox: inbox_tx,
            outbox: outbox_rx,
        });
        let err = bridge.request(WorkerCommand::Ping, None).await.unwrap_err();
        assert!(matches!(err, OffloadError::Disconnected));
    }

    fn options() -> EngineOptions {
        EngineOptions {
            context_window_size: 64,
        }
    }

    #[tokio::test]
    async fn test_silent_worker_fails_handshake() {
        // Keep both far ends alive so the bridge sees silence, not a disconnect.
        let (inbox_tx, _inbox_rx) = mpsc::unbounded_channel();
        let (_outbox_tx, outbox_rx) = mpsc::unbounded_channel::<String>();
        let config = WorkerConfig {
            handshake_timeout_ms: 20,
            ..WorkerConfig::default()
        };

        let channels = WorkerChannels {
            inbox: inbox_tx,
            outbox: outbox_rx,
        };
        let result = connect_offloaded_engine(channels, "m", &options(), Arc::new(|_| {}), &config).await;
        match result {
            Err(OffloadError::Handshake(message)) => assert!(message.contains("20 ms")),
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("handshake with a silent worker succeeded"),
        }
    }

    #[tokio::test]
    async fn test_progress_reaches_callback_before_terminal_reply() {
        let runtime = Arc::new(ScriptedRuntime::new(["a"]));
        let loader = Arc::new(ScriptedLoader::new(runtime));
        let reports = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = reports.clone();

        create_offloaded_engine(
            "m",
            &options(),
            Arc::new(move |r| sink.lock().unwrap().push(r.text)),
            loader,
            &WorkerConfig::default(),
        )
        .await
        .unwrap();

        assert_eq!(*reports.lock().unwrap(), vec!["Fetching weights", "Weights loaded"]);
    }
}
