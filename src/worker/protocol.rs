//! Protocol types for engine ↔ worker communication.
//!
//! Messages travel as JSON strings, one message per channel item.

use serde::{Deserialize, Serialize};

use crate::runtime::{CompletionRequest, EngineOptions, InitProgressReport};

/// Request sent from the engine to the worker.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkerRequest {
    /// Monotonic request ID for correlating responses.
    pub id: u64,
    pub command: WorkerCommand,
}

/// Commands the engine can send to the worker.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum WorkerCommand {
    /// Liveness check used for the creation handshake.
    Ping,
    /// Load (or replace) the model hosted by the worker.
    Reload {
        model_id: String,
        options: EngineOptions,
    },
    /// Open a completion stream. The request ID becomes the stream ID.
    ChatCompletionStreamInit { request: CompletionRequest },
    /// Pull exactly one item from an open stream.
    ChatCompletionStreamNextChunk { stream_id: u64 },
    /// Clear the hosted model's conversation state.
    ResetChat,
}

/// Response sent from the worker to the engine.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkerResponse {
    /// Matches the request ID.
    pub id: u64,
    pub payload: WorkerPayload,
}

/// Response payloads from the worker.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum WorkerPayload {
    Pong,
    /// Intermediate progress for a pending `Reload`. Not terminal.
    InitProgress { report: InitProgressReport },
    /// Model loaded successfully.
    Loaded,
    StreamReady { stream_id: u64 },
    /// One pulled item. `None` marks the end of the stream.
    Chunk { fragment: Option<String> },
    ResetDone,
    /// An error occurred.
    Error { message: String },
}

impl WorkerPayload {
    /// Whether this payload completes the request it answers.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkerPayload::InitProgress { .. })
    }
}

impl WorkerResponse {
    pub fn ok(id: u64, payload: WorkerPayload) -> Self {
        Self { id, payload }
    }

    pub fn error(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            payload: WorkerPayload::Error {
                message: message.into(),
            },
        }
    }
}
