//! Deterministic runtime for tests and benchmarks.
//!
//! Plays back a fixed list of fragments, records what it was asked, and keeps
//! a transcript the same way a real runtime would so that state leaking from
//! one turn into the next is observable.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use crate::runtime::{
    ChatMessage, ChatRuntime, CompletionRequest, EngineOptions, InitProgressCallback,
    InitProgressReport, RuntimeError, RuntimeLoader, TokenStream,
};

/// What happens after the scripted fragments run out.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEnd {
    /// The stream finishes normally.
    Complete,
    /// The stream yields this error after the fragments.
    Fail(String),
    /// The stream never yields again.
    Hang,
}

/// One observed completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    pub request: CompletionRequest,

    /// Transcript length at the moment the request arrived.
    pub prior_messages: usize,
}

#[derive(Debug, Default)]
struct Recorder {
    requests: Vec<RecordedRequest>,
    transcript: Vec<ChatMessage>,
}

#[derive(Debug)]
pub struct ScriptedRuntime {
    fragments: Vec<String>,
    end: StreamEnd,
    recorder: Arc<Mutex<Recorder>>,
    resets: AtomicUsize,
}

impl ScriptedRuntime {
    pub fn new<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fragments: fragments.into_iter().map(Into::into).collect(),
            end: StreamEnd::Complete,
            recorder: Arc::new(Mutex::new(Recorder::default())),
            resets: AtomicUsize::new(0),
        }
    }

    pub fn with_end(mut self, end: StreamEnd) -> Self {
        self.end = end;
        self
    }

    /// Every request seen so far, in arrival order.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.recorder
            .lock()
            .map(|r| r.requests.clone())
            .unwrap_or_default()
    }

    /// Content of the last message of every request seen so far.
    pub fn prompts(&self) -> Vec<String> {
        self.requests()
            .into_iter()
            .filter_map(|r| r.request.messages.last().map(|m| m.content.clone()))
            .collect()
    }

    pub fn reset_count(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    pub fn transcript_len(&self) -> usize {
        self.recorder.lock().map(|r| r.transcript.len()).unwrap_or(0)
    }
}

#[async_trait]
impl ChatRuntime for ScriptedRuntime {
    async fn chat_completion(&self, request: CompletionRequest) -> Result<TokenStream, RuntimeError> {
        {
            let mut recorder = self
                .recorder
                .lock()
                .map_err(|e| RuntimeError::Generation(e.to_string()))?;
            let prior_messages = recorder.transcript.len();
            recorder.transcript.extend(request.messages.iter().cloned());
            recorder.requests.push(RecordedRequest {
                request,
                prior_messages,
            });
        }

        let recorder = self.recorder.clone();
        let answer = self.fragments.concat();
        let body = stream::iter(self.fragments.clone().into_iter().map(Ok));

        let tail: TokenStream = match &self.end {
            StreamEnd::Complete => stream::once(async move {
                if let Ok(mut r) = recorder.lock() {
                    r.transcript.push(ChatMessage::assistant(answer));
                }
                None
            })
            .filter_map(|done: Option<Result<String, RuntimeError>>| async move { done })
            .boxed(),
            StreamEnd::Fail(message) => {
                stream::once(futures::future::ready(Err(RuntimeError::Transport(message.clone()))))
                    .boxed()
            }
            StreamEnd::Hang => stream::pending().boxed(),
        };

        Ok(body.chain(tail).boxed())
    }

    async fn reset_chat(&self) -> Result<(), RuntimeError> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut r) = self.recorder.lock() {
            r.transcript.clear();
        }
        Ok(())
    }
}

/// Hands out one shared [`ScriptedRuntime`].
pub struct ScriptedLoader {
    runtime: Arc<ScriptedRuntime>,
    progress: Vec<InitProgressReport>,
    failure: Option<String>,
    loads: AtomicUsize,
}

impl ScriptedLoader {
    pub fn new(runtime: Arc<ScriptedRuntime>) -> Self {
        Self {
            runtime,
            progress: vec![
                InitProgressReport {
                    progress: 0.25,
                    text: "Fetching weights".to_string(),
                },
                InitProgressReport {
                    progress: 1.0,
                    text: "Weights loaded".to_string(),
                },
            ],
            failure: None,
            loads: AtomicUsize::new(0),
        }
    }

    /// Replace the progress reports emitted during a load.
    pub fn with_progress(mut self, reports: Vec<InitProgressReport>) -> Self {
        self.progress = reports;
        self
    }

    /// Make every load fail after emitting its progress.
    pub fn failing(mut self, reason: impl Into<String>) -> Self {
        self.failure = Some(reason.into());
        self
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RuntimeLoader for ScriptedLoader {
    async fn load(
        &self,
        model_id: &str,
        _options: &EngineOptions,
        progress: InitProgressCallback,
    ) -> Result<Arc<dyn ChatRuntime>, RuntimeError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        for report in &self.progress {
            progress(report.clone());
        }
        match &self.failure {
            Some(reason) => Err(RuntimeError::ModelLoad {
                model_id: model_id.to_string(),
                reason: reason.clone(),
            }),
            None => Ok(self.runtime.clone()),
        }
    }
}
