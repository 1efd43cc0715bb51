use thiserror::Error;

use crate::runtime::RuntimeError;
use crate::worker::OffloadError;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Engine not ready: call init first")]
    EngineNotReady,

    #[error("Engine initialization failed{}: {source}", offload_note(.offload))]
    InitFailed {
        /// Why the offloaded attempt failed, when one was made.
        offload: Option<OffloadError>,
        #[source]
        source: RuntimeError,
    },

    #[error("Token stream failed: {0}")]
    Stream(#[source] RuntimeError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),
}

fn offload_note(offload: &Option<OffloadError>) -> String {
    match offload {
        Some(e) => format!(" (offload: {e})"),
        None => String::new(),
    }
}
