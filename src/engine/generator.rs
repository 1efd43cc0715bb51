//! Streaming generation.
//!
//! One call is one turn: build the prompt, open a stream on the engine, pull
//! fragments until the runtime signals the end, and reset the conversation
//! so the next turn starts clean. The reset happens on every exit path. When
//! the caller drops the turn mid-stream, the reset runs in the background and
//! the turn lock is held until it finishes.

use futures::StreamExt;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::GenerationConfig;
use crate::engine::error::EngineError;
use crate::engine::lifecycle::{EngineHandle, EngineManager};
use crate::prompt::build_prompt;
use crate::runtime::{ChatMessage, CompletionRequest, RuntimeError};

/// Receives each non-empty fragment as soon as it is produced.
pub type TokenSink<'a> = &'a mut (dyn FnMut(&str) + Send);

/// Resets the conversation when a turn ends, however it ends.
struct ResetGuard {
    armed: Option<(EngineHandle, OwnedMutexGuard<()>)>,
}

impl ResetGuard {
    fn arm(handle: EngineHandle, turn: OwnedMutexGuard<()>) -> Self {
        Self {
            armed: Some((handle, turn)),
        }
    }

    /// Reset now and release the turn lock.
    async fn release(mut self) -> Result<(), RuntimeError> {
        let result = match &self.armed {
            Some((handle, _)) => handle.runtime().reset_chat().await,
            None => Ok(()),
        };
        self.armed = None;
        result
    }
}

impl Drop for ResetGuard {
    fn drop(&mut self) {
        let Some((handle, turn)) = self.armed.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                warn!("Turn abandoned before the stream ended, resetting in background");
                rt.spawn(async move {
                    if let Err(e) = handle.runtime().reset_chat().await {
                        warn!("Background reset failed: {e}");
                    }
                    drop(turn);
                });
            }
            Err(_) => warn!("Turn abandoned outside a runtime, conversation state was not reset"),
        }
    }
}

/// Runs single turns against one engine handle.
pub struct StreamingGenerator {
    handle: EngineHandle,
    config: GenerationConfig,
}

impl StreamingGenerator {
    pub fn new(handle: EngineHandle, config: GenerationConfig) -> Self {
        Self { handle, config }
    }

    /// Run one turn while holding `turn`, which is released after the reset.
    pub async fn run(
        &self,
        turn: OwnedMutexGuard<()>,
        context: &str,
        query: &str,
        on_token: Option<TokenSink<'_>>,
    ) -> Result<String, EngineError> {
        let request = CompletionRequest {
            messages: vec![ChatMessage::user(build_prompt(context, query))],
            stream: true,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        };

        let guard = ResetGuard::arm(self.handle.clone(), turn);
        let outcome = self.consume(request, on_token).await;
        let reset = guard.release().await;

        match (outcome, reset) {
            (Ok(answer), Ok(())) => Ok(answer),
            (Ok(_), Err(e)) => Err(EngineError::Runtime(e)),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(reset_err)) => {
                warn!("Reset after failed turn also failed: {reset_err}");
                Err(e)
            }
        }
    }

    async fn consume(
        &self,
        request: CompletionRequest,
        mut on_token: Option<TokenSink<'_>>,
    ) -> Result<String, EngineError> {
        let mut stream = self.handle.runtime().chat_completion(request).await?;

        let mut answer = String::new();
        let mut fragments = 0usize;
        while let Some(fragment) = stream.next().await {
            let fragment = fragment.map_err(EngineError::Stream)?;
            if fragment.is_empty() {
                continue;
            }
            if let Some(sink) = on_token.as_deref_mut() {
                sink(&fragment);
            }
            answer.push_str(&fragment);
            fragments += 1;
        }

        debug!(fragments, chars = answer.len(), "Stream exhausted");
        Ok(answer)
    }
}

impl EngineManager {
    /// Answer `query` from `context`, streaming fragments to `on_token`.
    ///
    /// Returns the concatenation of every fragment. Fails with
    /// [`EngineError::EngineNotReady`] before a successful `init`.
    pub async fn generate(
        &self,
        context: &str,
        query: &str,
        on_token: Option<TokenSink<'_>>,
    ) -> Result<String, EngineError> {
        let turn = self.turn.clone().lock_owned().await;
        let handle = self.handle.read().await.clone().ok_or(EngineError::EngineNotReady)?;

        let turn_id = Uuid::new_v4();
        let span = info_span!("turn", %turn_id, backend = %handle.backend());
        async move {
            info!(
                context_chars = context.len(),
                query_chars = query.len(),
                "Starting generation"
            );
            let generator = StreamingGenerator::new(handle, self.config.generation.clone());
            let answer = generator.run(turn, context, query, on_token).await?;
            info!(answer_chars = answer.len(), "Generation complete");
            Ok(answer)
        }
        .instrument(span)
        .await
    }
}
