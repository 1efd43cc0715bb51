//! Provenance supplied by the retrieval step.
//!
//! The engine does not rank or embed anything. These types carry what the
//! retriever produced so it can be shown next to the streamed answer.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// A document section an answer may cite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub source: String,
    pub section: String,
}

/// A retrieved passage with its relevance score (0.0 - 1.0).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextChunk {
    pub source: String,
    pub section: String,
    pub content: String,
    pub score: f64,
}

impl ContextChunk {
    /// Score as a rounded percentage, e.g. `"87%"`.
    pub fn score_percent(&self) -> String {
        let score = if self.score.is_nan() {
            0.0
        } else {
            self.score.clamp(0.0, 1.0)
        };
        format!("{}%", (score * 100.0).round() as u32)
    }
}

/// Everything the retriever hands over for one question.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    /// Context string fed to the prompt. Assembled from `chunks` when absent.
    #[serde(default)]
    pub context: Option<String>,

    #[serde(default)]
    pub sources: Vec<Citation>,

    #[serde(default)]
    pub chunks: Vec<ContextChunk>,
}

impl RetrievalResult {
    /// Load a retrieval result from a JSON file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// The context string for the prompt.
    pub fn context(&self) -> String {
        match &self.context {
            Some(context) => context.clone(),
            None => self
                .chunks
                .iter()
                .map(|c| c.content.as_str())
                .collect::<Vec<_>>()
                .join("\n\n"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(content: &str, score: f64) -> ContextChunk {
        ContextChunk {
            source: "handbook.md".to_string(),
            section: "Breaks".to_string(),
            content: content.to_string(),
            score,
        }
    }

    #[test]
    fn test_score_percent() {
        assert_eq!(chunk("", 0.874).score_percent(), "87%");
        assert_eq!(chunk("", 0.875).score_percent(), "88%");
        assert_eq!(chunk("", 1.0).score_percent(), "100%");
        assert_eq!(chunk("", 1.3).score_percent(), "100%");
        assert_eq!(chunk("", -0.1).score_percent(), "0%");
    }

    #[test]
    fn test_context_assembled_from_chunks() {
        let result = RetrievalResult {
            context: None,
            sources: vec![],
            chunks: vec![chunk("first", 0.9), chunk("second", 0.5)],
        };
        assert_eq!(result.context(), "first\n\nsecond");
    }

    #[test]
    fn test_explicit_context_wins() {
        let raw = r#"{
            "context": "Policy: lunch starts at 12:00.",
            "sources": [{"source": "handbook.md", "section": "Breaks"}],
            "chunks": [{"source": "handbook.md", "section": "Breaks", "content": "other", "score": 0.91}]
        }"#;
        let result: RetrievalResult = serde_json::from_str(raw).unwrap();
        assert_eq!(result.context(), "Policy: lunch starts at 12:00.");
        assert_eq!(result.sources.len(), 1);
        assert_eq!(result.chunks[0].score_percent(), "91%");
    }
}
