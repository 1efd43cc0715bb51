//! Model runtime seam.
//!
//! The engine never touches model weights directly. It talks to a
//! [`ChatRuntime`] produced by a [`RuntimeLoader`], whether that runtime lives
//! on the calling thread or behind the offload worker.
//!
//! - [`local`]: In-process stub decoder used by default
//! - [`scripted`]: Deterministic runtime for tests and benchmarks

pub mod local;
pub mod scripted;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum RuntimeError {
    #[error("Failed to load model {model_id}: {reason}")]
    ModelLoad { model_id: String, reason: String },

    #[error("No model loaded")]
    NotLoaded,

    #[error("Generation failed: {0}")]
    Generation(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Lazily produced answer fragments. Pulling an item drives generation forward.
pub type TokenStream = BoxStream<'static, Result<String, RuntimeError>>;

/// Raw load progress as reported by a runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitProgressReport {
    /// Fraction complete, 0.0 - 1.0.
    pub progress: f64,

    /// Human-readable status line.
    pub text: String,
}

/// Receives raw progress reports while a model loads.
pub type InitProgressCallback = Arc<dyn Fn(InitProgressReport) + Send + Sync>;

/// Options fixed at load time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineOptions {
    /// Token budget for the retained conversation.
    pub context_window_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A chat completion request as submitted to a runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,

    /// Stream fragments as they are produced.
    pub stream: bool,

    /// Maximum tokens to generate.
    pub max_tokens: usize,

    /// Temperature for sampling (0.0 = greedy).
    pub temperature: f64,
}

/// A loaded model that can answer chat completions.
#[async_trait]
pub trait ChatRuntime: Send + Sync {
    /// Start a completion. The returned stream yields fragments in generation order.
    async fn chat_completion(&self, request: CompletionRequest) -> Result<TokenStream, RuntimeError>;

    /// Forget all conversation state accumulated so far.
    async fn reset_chat(&self) -> Result<(), RuntimeError>;
}

/// Creates runtimes for a model identifier.
#[async_trait]
pub trait RuntimeLoader: Send + Sync {
    async fn load(
        &self,
        model_id: &str,
        options: &EngineOptions,
        progress: InitProgressCallback,
    ) -> Result<Arc<dyn ChatRuntime>, RuntimeError>;
}
