//! Worker side of the offload channel.
//!
//! The worker is a dedicated OS thread running its own single-threaded tokio
//! runtime. Its [`relay`] loop hands every inbound message, untouched, to a
//! [`MessageHandler`]; only the handler knows the protocol.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::runtime::{ChatRuntime, InitProgressCallback, RuntimeError, RuntimeLoader, TokenStream};
use crate::worker::protocol::{WorkerCommand, WorkerPayload, WorkerRequest, WorkerResponse};
use crate::worker::OffloadError;

/// Engine-side ends of a running worker's channels.
#[derive(Debug)]
pub struct WorkerChannels {
    /// Messages into the worker.
    pub inbox: mpsc::UnboundedSender<String>,

    /// Messages out of the worker.
    pub outbox: mpsc::UnboundedReceiver<String>,
}

/// Receives raw messages inside the worker.
#[async_trait]
pub trait MessageHandler: Send {
    async fn on_message(&mut self, message: String);
}

/// Forward every inbound message to `handler`, in order, until the inbox closes.
pub async fn relay<H: MessageHandler>(mut inbox: mpsc::UnboundedReceiver<String>, handler: &mut H) {
    while let Some(message) = inbox.recv().await {
        handler.on_message(message).await;
    }
}

/// Start a worker thread hosting a runtime built by `loader`.
pub fn spawn_worker(
    thread_name: &str,
    loader: Arc<dyn RuntimeLoader>,
) -> Result<WorkerChannels, OffloadError> {
    let (inbox_tx, inbox_rx) = mpsc::unbounded_channel::<String>();
    let (outbox_tx, outbox_rx) = mpsc::unbounded_channel::<String>();

    let name = thread_name.to_string();
    std::thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    // Dropping the channels fails the handshake on the engine side.
                    error!("Worker runtime could not start: {e}");
                    return;
                }
            };

            let mut handler = RuntimeHandler::new(loader, outbox_tx);
            rt.block_on(relay(inbox_rx, &mut handler));
            info!(thread = name, "Worker stopped");
        })?;

    Ok(WorkerChannels {
        inbox: inbox_tx,
        outbox: outbox_rx,
    })
}

/// Hosts the runtime inside the worker and answers protocol requests.
pub struct RuntimeHandler {
    loader: Arc<dyn RuntimeLoader>,
    runtime: Option<Arc<dyn ChatRuntime>>,
    streams: HashMap<u64, TokenStream>,
    outbox: mpsc::UnboundedSender<String>,
}

impl RuntimeHandler {
    pub fn new(loader: Arc<dyn RuntimeLoader>, outbox: mpsc::UnboundedSender<String>) -> Self {
        Self {
            loader,
            runtime: None,
            streams: HashMap::new(),
            outbox,
        }
    }

    fn reply(&self, response: WorkerResponse) {
        send_json(&self.outbox, &response);
    }

    fn runtime(&self) -> Result<Arc<dyn ChatRuntime>, RuntimeError> {
        self.runtime.clone().ok_or(RuntimeError::NotLoaded)
    }

    async fn handle(&mut self, id: u64, command: WorkerCommand) -> Result<WorkerPayload, RuntimeError> {
        match command {
            WorkerCommand::Ping => Ok(WorkerPayload::Pong),

            WorkerCommand::Reload { model_id, options } => {
                let outbox = self.outbox.clone();
                let progress: InitProgressCallback = Arc::new(move |report| {
                    send_json(
                        &outbox,
                        &WorkerResponse::ok(id, WorkerPayload::InitProgress { report }),
                    );
                });

                self.streams.clear();
                let runtime = self.loader.load(&model_id, &options, progress).await?;
                self.runtime = Some(runtime);
                info!(model_id, "Worker model loaded");
                Ok(WorkerPayload::Loaded)
            }

            WorkerCommand::ChatCompletionStreamInit { request } => {
                let stream = self.runtime()?.chat_completion(request).await?;
                self.streams.insert(id, stream);
                debug!(stream_id = id, "Stream opened");
                Ok(WorkerPayload::StreamReady { stream_id: id })
            }

            WorkerCommand::ChatCompletionStreamNextChunk { stream_id } => {
                let stream = self
                    .streams
                    .get_mut(&stream_id)
                    .ok_or_else(|| RuntimeError::Generation(format!("unknown stream {stream_id}")))?;
                let item = stream.next().await;
                match item {
                    Some(Ok(fragment)) => Ok(WorkerPayload::Chunk {
                        fragment: Some(fragment),
                    }),
                    Some(Err(e)) => {
                        self.streams.remove(&stream_id);
                        Err(e)
                    }
                    None => {
                        self.streams.remove(&stream_id);
                        debug!(stream_id, "Stream exhausted");
                        Ok(WorkerPayload::Chunk { fragment: None })
                    }
                }
            }

            WorkerCommand::ResetChat => {
                // A reset ends the turn, including any stream the engine walked away from.
                self.streams.clear();
                self.runtime()?.reset_chat().await?;
                Ok(WorkerPayload::ResetDone)
            }
        }
    }
}

#[async_trait]
impl MessageHandler for RuntimeHandler {
    async fn on_message(&mut self, message: String) {
        let request: WorkerRequest = match serde_json::from_str(&message) {
            Ok(request) => request,
            Err(e) => {
                warn!("Dropping undecodable worker message: {e}");
                return;
            }
        };

        let id = request.id;
        let response = match self.handle(id, request.command).await {
            Ok(payload) => WorkerResponse::ok(id, payload),
            Err(e) => WorkerResponse::error(id, e.to_string()),
        };
        self.reply(response);
    }
}

fn send_json(outbox: &mpsc::UnboundedSender<String>, response: &WorkerResponse) {
    match serde_json::to_string(response) {
        Ok(json) => {
            // The engine side may already be gone; nothing left to tell it.
            let _ = outbox.send(json);
        }
        Err(e) => warn!("Failed to encode worker response: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::scripted::{ScriptedLoader, ScriptedRuntime};
    use crate::runtime::{ChatMessage, CompletionRequest, EngineOptions};

    struct Recording(Vec<String>);

    #[async_trait]
    impl MessageHandler for Recording {
        async fn on_message(&mut self, message: String) {
            self.0.push(message);
        }
    }

    #[tokio::test]
    async fn test_relay_forwards_verbatim_in_order() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send("not json at all".to_string()).unwrap();
        tx.send(r#"{"id":1}"#.to_string()).unwrap();
        drop(tx);

        let mut handler = Recording(Vec::new());
        relay(rx, &mut handler).await;
        assert_eq!(handler.0, vec!["not json at all", r#"{"id":1}"#]);
    }

    fn encode(id: u64, command: WorkerCommand) -> String {
        serde_json::to_string(&WorkerRequest { id, command }).unwrap()
    }

    fn decode(raw: Option<String>) -> WorkerResponse {
        serde_json::from_str(&raw.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_handler_serves_pull_stream() {
        let runtime = Arc::new(ScriptedRuntime::new(["x", "y"]));
        let loader = Arc::new(ScriptedLoader::new(runtime.clone()));
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let mut handler = RuntimeHandler::new(loader, out_tx);

        handler
            .on_message(encode(
                1,
                WorkerCommand::Reload {
                    model_id: "m".to_string(),
                    options: EngineOptions {
                        context_window_size: 64,
                    },
                },
            ))
            .await;
        // two progress reports, then the terminal reply
        assert!(matches!(decode(out_rx.recv().await).payload, WorkerPayload::InitProgress { .. }));
        assert!(matches!(decode(out_rx.recv().await).payload, WorkerPayload::InitProgress { .. }));
        assert_eq!(decode(out_rx.recv().await).payload, WorkerPayload::Loaded);

        let request = CompletionRequest {
            messages: vec![ChatMessage::user("q")],
            stream: true,
            max_tokens: 4,
            temperature: 0.0,
        };
        handler
            .on_message(encode(2, WorkerCommand::ChatCompletionStreamInit { request }))
            .await;
        assert_eq!(
            decode(out_rx.recv().await).payload,
            WorkerPayload::StreamReady { stream_id: 2 }
        );

        let mut pulled = Vec::new();
        for id in 3..6 {
            handler
                .on_message(encode(id, WorkerCommand::ChatCompletionStreamNextChunk { stream_id: 2 }))
                .await;
            match decode(out_rx.recv().await).payload {
                WorkerPayload::Chunk { fragment } => pulled.push(fragment),
                other => panic!("unexpected payload {other:?}"),
            }
        }
        assert_eq!(pulled, vec![Some("x".to_string()), Some("y".to_string()), None]);
    }

    #[tokio::test]
    async fn test_commands_before_load_report_errors() {
        let runtime = Arc::new(ScriptedRuntime::new(Vec::<String>::new()));
        let loader = Arc::new(ScriptedLoader::new(runtime));
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let mut handler = RuntimeHandler::new(loader, out_tx);

        handler.on_message(encode(9, WorkerCommand::ResetChat)).await;
        let response = decode(out_rx.recv().await);
        assert_eq!(response.id, 9);
        assert!(matches!(response.payload, WorkerPayload::Error { .. }));
    }
}
