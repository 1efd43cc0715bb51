//! Inference engine adapter.
//!
//! - [`lifecycle`]: Engine handle ownership, `init` with offload fallback, reset
//! - [`generator`]: Streaming, stateless-per-turn generation
//! - [`progress`]: Progress events and raw-progress rescaling
//! - [`error`]: Engine error taxonomy

pub mod error;
pub mod generator;
pub mod lifecycle;
pub mod progress;

pub use error::EngineError;
pub use generator::{StreamingGenerator, TokenSink};
pub use lifecycle::{Backend, EngineHandle, EngineManager, EngineState};
pub use progress::{ProgressEvent, ProgressSink};
