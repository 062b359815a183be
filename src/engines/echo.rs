//! Echo engine for testing.
//!
//! Reads the chunk file as (lossy) UTF-8 and returns it unchanged with a
//! fixed confidence. This lets the whole pipeline run end-to-end on plain
//! text fixtures without any external OCR tooling installed.

use std::fs;

use crate::prelude::*;

use super::{OcrChunkInput, OcrChunkOutput, OcrEngine};

/// Deterministic pass-through engine.
#[derive(Debug)]
pub struct EchoEngine;

impl EchoEngine {
    /// Create a new echo engine.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl OcrEngine for EchoEngine {
    fn name(&self) -> &'static str {
        "echo"
    }

    #[instrument(level = "debug", skip_all, fields(path = %input.path.display()))]
    async fn ocr_chunk(&self, input: &OcrChunkInput) -> Result<OcrChunkOutput> {
        let bytes = fs::read(&input.path)
            .with_context(|| format!("failed to read {:?}", input.path))?;
        let text = String::from_utf8_lossy(&bytes).into_owned();
        Ok(OcrChunkOutput {
            text,
            confidence: Some(0.99),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_returns_the_file_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chunk.txt");
        fs::write(&path, "bonjour le monde").unwrap();

        let engine = EchoEngine::new();
        let output = engine
            .ocr_chunk(&OcrChunkInput {
                path,
                language: "fra".to_owned(),
                dpi: 300,
                aggressive_preprocessing: false,
            })
            .await
            .unwrap();
        assert_eq!(output.text, "bonjour le monde");
        assert_eq!(output.confidence, Some(0.99));
    }
}
