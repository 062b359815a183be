//! An "OCR" engine that calls `pdftotext`.
//!
//! This handles PDFs which already contain a text layer. It is by far the
//! fastest option, but it cannot read scanned pages.

use tokio::process::Command;

use crate::{
    async_utils::check_for_command_failure, cpu_limit::with_cpu_semaphore,
    pages::detect_mime, prelude::*,
};

use super::{OcrChunkInput, OcrChunkOutput, OcrEngine};

/// Engine wrapping Poppler's `pdftotext` CLI tool.
#[non_exhaustive]
pub struct PdfToTextEngine {}

impl PdfToTextEngine {
    /// Create a new `pdftotext` engine.
    pub fn new() -> Self {
        Self {}
    }
}

impl Default for PdfToTextEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OcrEngine for PdfToTextEngine {
    fn name(&self) -> &'static str {
        "pdftotext"
    }

    #[instrument(level = "debug", skip_all, fields(path = %input.path.display()))]
    async fn ocr_chunk(&self, input: &OcrChunkInput) -> Result<OcrChunkOutput> {
        let mime = detect_mime(&input.path);
        if mime != "application/pdf" {
            return Err(anyhow!(
                "pdftotext cannot handle {} input {:?}",
                mime,
                input.path
            ));
        }

        // `-` sends the text to stdout, with form feeds between pages.
        let output = with_cpu_semaphore(|| async {
            Command::new("pdftotext")
                .arg("-layout")
                .arg(&input.path)
                .arg("-")
                .output()
                .await
                .with_context(|| format!("failed to run pdftotext on {:?}", input.path))
        })
        .await?;
        check_for_command_failure("pdftotext", &output)?;

        let text = String::from_utf8_lossy(&output.stdout).into_owned();
        Ok(OcrChunkOutput {
            text,
            // No engine-level confidence: the text layer is whatever the
            // producing application embedded.
            confidence: None,
        })
    }
}
