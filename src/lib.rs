//! rag-chat-engine: local inference engine adapter for retrieval-augmented chat.
//!
//! Takes a question plus a pre-retrieved context, runs it through a locally
//! hosted language model, and streams the answer token by token:
//!   init (worker thread → in-process fallback) → generate → per-turn reset
//!
//! Retrieval, rendering and persistence live outside this crate.

pub mod config;
pub mod engine;
pub mod gpu;
pub mod prompt;
pub mod retrieval;
pub mod runtime;
pub mod worker;
