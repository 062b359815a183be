//! Tesseract OCR engine.
//!
//! Rasterizes PDF chunks to page images with `pdftocairo`, then runs the
//! `tesseract` CLI on each page. Single images skip the rasterization step.

use std::fs::read_to_string;

use tokio::process::Command;

use crate::{
    async_utils::check_for_command_failure,
    cpu_limit::with_cpu_semaphore,
    pages::rasterize,
    prelude::*,
};

use super::{OcrChunkInput, OcrChunkOutput, OcrEngine};

/// OCR engine wrapping the `tesseract` CLI tool.
#[non_exhaustive]
pub struct TesseractEngine {}

impl TesseractEngine {
    /// Create a new `tesseract` engine.
    pub fn new() -> Self {
        Self {}
    }

    /// Run tesseract on a single page image.
    async fn ocr_page(&self, image: &Path, input: &OcrChunkInput) -> Result<String> {
        let tmpdir = tempfile::TempDir::with_prefix("tesseract")?;
        let output_base = tmpdir.path().join("output");

        let mut cmd = Command::new("tesseract");
        cmd.arg(image)
            .arg(&output_base)
            .arg("-l")
            .arg(&input.language)
            .arg("--dpi")
            .arg(input.dpi.to_string());
        // Page segmentation mode 6 ("assume a single uniform block") copes
        // better with damaged scans than the automatic mode.
        if input.aggressive_preprocessing {
            cmd.arg("--psm").arg("6");
        }
        let output = cmd
            .output()
            .await
            .context("failed to run tesseract")?;
        check_for_command_failure("tesseract", &output)?;

        read_to_string(output_base.with_extension("txt"))
            .context("failed to read tesseract output file")
    }
}

impl Default for TesseractEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OcrEngine for TesseractEngine {
    fn name(&self) -> &'static str {
        "tesseract"
    }

    #[instrument(level = "debug", skip_all, fields(path = %input.path.display()))]
    async fn ocr_chunk(&self, input: &OcrChunkInput) -> Result<OcrChunkOutput> {
        // Keep the tempdir guard alive until every page is OCRed.
        let (_raster_dir, pages) = rasterize(&input.path, input.dpi).await?;
        if pages.is_empty() {
            return Err(anyhow!("no pages rasterized from {:?}", input.path));
        }

        let mut texts = Vec::with_capacity(pages.len());
        for page in &pages {
            let text = with_cpu_semaphore(|| self.ocr_page(page, input)).await?;
            texts.push(text);
        }

        Ok(OcrChunkOutput {
            text: texts.join("\n\x0C\n"),
            confidence: None,
        })
    }
}
