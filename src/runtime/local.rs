//! In-process runtime.
//!
//! There are no weights behind this runtime: loading walks through the same
//! stages a real model load reports, and decoding streams the prompt's context
//! section back word by word. Conversation state is real, though. Every turn is
//! appended to a transcript bounded by the context window, and `reset_chat`
//! clears it.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::prompt::parse_prompt;
use crate::runtime::{
    ChatMessage, ChatRuntime, CompletionRequest, EngineOptions, InitProgressCallback,
    InitProgressReport, Role, RuntimeError, RuntimeLoader, TokenStream,
};

/// Number of weight shards the staged load walks through.
const SHARD_COUNT: usize = 4;

/// Rough size of a token in characters.
const CHARS_PER_TOKEN: usize = 4;

/// Approximate token count of a piece of text.
pub fn estimate_tokens(text: &str) -> usize {
    (text.len() / CHARS_PER_TOKEN).max(1)
}

/// Loads [`LocalRuntime`]s on the calling thread.
#[derive(Debug, Default, Clone)]
pub struct LocalLoader;

#[async_trait]
impl RuntimeLoader for LocalLoader {
    async fn load(
        &self,
        model_id: &str,
        options: &EngineOptions,
        progress: InitProgressCallback,
    ) -> Result<Arc<dyn ChatRuntime>, RuntimeError> {
        if model_id.trim().is_empty() {
            return Err(RuntimeError::ModelLoad {
                model_id: model_id.to_string(),
                reason: "empty model identifier".to_string(),
            });
        }

        progress(InitProgressReport {
            progress: 0.0,
            text: format!("Fetching param cache for {model_id}"),
        });
        for shard in 1..=SHARD_COUNT {
            tokio::task::yield_now().await;
            progress(InitProgressReport {
                progress: shard as f64 / (SHARD_COUNT + 1) as f64,
                text: format!("Loading model from cache [{shard}/{SHARD_COUNT}]"),
            });
        }
        progress(InitProgressReport {
            progress: 1.0,
            text: "Finish loading on local runtime".to_string(),
        });

        info!(
            model_id,
            context_window = options.context_window_size,
            "Local runtime loaded"
        );

        Ok(Arc::new(LocalRuntime::new(model_id, options.clone())))
    }
}

/// Conversation state of a loaded model.
#[derive(Debug, Default)]
struct Session {
    transcript: Vec<ChatMessage>,
    tokens: usize,
}

impl Session {
    fn push(&mut self, message: ChatMessage, window: usize) {
        self.tokens += estimate_tokens(&message.content);
        self.transcript.push(message);

        // Drop the oldest messages until the transcript fits, keeping the newest.
        while self.tokens > window && self.transcript.len() > 1 {
            let dropped = self.transcript.remove(0);
            self.tokens -= estimate_tokens(&dropped.content);
        }
    }

    fn clear(&mut self) {
        self.transcript.clear();
        self.tokens = 0;
    }
}

/// Weightless in-process runtime.
#[derive(Debug)]
pub struct LocalRuntime {
    model_id: String,
    options: EngineOptions,
    session: Arc<Mutex<Session>>,
}

impl LocalRuntime {
    pub fn new(model_id: &str, options: EngineOptions) -> Self {
        Self {
            model_id: model_id.to_string(),
            options,
            session: Arc::new(Mutex::new(Session::default())),
        }
    }

    /// Messages currently retained in the conversation.
    pub async fn transcript_len(&self) -> usize {
        self.session.lock().await.transcript.len()
    }

    /// Approximate tokens currently retained in the conversation.
    pub async fn tokens_used(&self) -> usize {
        self.session.lock().await.tokens
    }
}

/// Words of the answer the stub decoder produces for a user message.
fn decode_answer(message: &str, max_tokens: usize) -> Vec<String> {
    let source = parse_prompt(message).map_or(message, |sections| sections.context);
    let words: Vec<&str> = source.split_whitespace().take(max_tokens).collect();
    let last = words.len().saturating_sub(1);
    words
        .iter()
        .enumerate()
        .map(|(i, word)| {
            if i == last {
                (*word).to_string()
            } else {
                format!("{word} ")
            }
        })
        .collect()
}

#[async_trait]
impl ChatRuntime for LocalRuntime {
    async fn chat_completion(&self, request: CompletionRequest) -> Result<TokenStream, RuntimeError> {
        let user = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .ok_or_else(|| RuntimeError::Generation("request carries no user message".to_string()))?;

        let fragments = decode_answer(&user.content, request.max_tokens);
        debug!(
            model_id = self.model_id,
            messages = request.messages.len(),
            fragments = fragments.len(),
            temperature = request.temperature,
            "Starting local completion"
        );

        {
            let mut session = self.session.lock().await;
            for message in &request.messages {
                session.push(message.clone(), self.options.context_window_size);
            }
        }

        // The assistant reply joins the transcript once the stream is drained.
        let session = self.session.clone();
        let window = self.options.context_window_size;
        let answer: String = fragments.concat();
        let body = stream::iter(fragments.into_iter().map(Ok));
        let tail = stream::once(async move {
            session
                .lock()
                .await
                .push(ChatMessage::assistant(answer), window);
            None
        })
        .filter_map(|done: Option<Result<String, RuntimeError>>| async move { done });

        if !request.stream {
            debug!("Non-streaming request served as a single-pass stream");
        }

        Ok(body.chain(tail).boxed())
    }

    async fn reset_chat(&self) -> Result<(), RuntimeError> {
        self.session.lock().await.clear();
        debug!(model_id = self.model_id, "Conversation reset");
        Ok(())
    }
}
