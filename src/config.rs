//! Runtime configuration for rag-chat-engine.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! Every knob is fixed for the lifetime of an engine: the model identifier, the
//! context window handed to the runtime, generation options and worker settings.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "rag-chat", about = "Retrieval-augmented chat over a local language model")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Report whether an accelerated compute backend is available.
    Probe,

    /// Answer a question from a supplied context, streaming tokens to stdout.
    Ask {
        /// The user question.
        #[arg(short, long)]
        question: String,

        /// Inline context text.
        #[arg(long, conflicts_with = "retrieval")]
        context: Option<String>,

        /// Retrieval result file (JSON) carrying context, sources and scored chunks.
        #[arg(short, long)]
        retrieval: Option<PathBuf>,
    },
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Model configuration.
    #[serde(default)]
    pub model: ModelConfig,

    /// Generation options applied to every turn.
    #[serde(default)]
    pub generation: GenerationConfig,

    /// Offload worker settings.
    #[serde(default)]
    pub worker: WorkerConfig,
}

/// Model-related settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Model identifier understood by the runtime.
    pub model_id: String,

    /// Token budget for retained conversation (prompt + history).
    pub context_window_size: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_id: "Llama-3.2-1B-Instruct-q4f16_1-MLC".to_string(),
            context_window_size: 4096,
        }
    }
}

/// Sampling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Maximum tokens to generate per answer.
    pub max_tokens: usize,

    /// Temperature for sampling (0.0 = greedy).
    pub temperature: f64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            temperature: 0.2,
        }
    }
}

/// Offload worker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Try to host the runtime on a dedicated worker thread first.
    pub enabled: bool,

    /// How long the worker has to answer the initial ping.
    pub handshake_timeout_ms: u64,

    /// OS thread name for the worker.
    pub thread_name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            handshake_timeout_ms: 5000,
            thread_name: "engine-worker".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.generation.max_tokens, 512);
        assert_eq!(cfg.model.context_window_size, 4096);
        assert!(cfg.worker.enabled);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"generation": {{"temperature": 0.7}}, "worker": {{"enabled": false}}}}"#)
            .unwrap();

        let cfg = Config::load(file.path()).unwrap();
        assert_eq!(cfg.generation.temperature, 0.7);
        assert_eq!(cfg.generation.max_tokens, 512);
        assert!(!cfg.worker.enabled);
        assert_eq!(cfg.worker.handshake_timeout_ms, 5000);
        assert_eq!(cfg.model.model_id, ModelConfig::default().model_id);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(cfg.model.context_window_size, 4096);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(Config::load(file.path()).is_err());
    }
}
