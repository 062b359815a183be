//! OCR engine interface.
//!
//! Engines work on one extracted page-range chunk at a time. Cloud engines
//! live behind the same trait; this crate ships the two local subprocess
//! engines plus a deterministic [`echo`] engine used by tests and dry runs.

pub mod echo;
pub mod pdftotext;
pub mod tesseract;

use std::{collections::BTreeMap, sync::Arc};

use crate::prelude::*;

/// One chunk of a document, ready for an engine.
#[derive(Clone, Debug)]
pub struct OcrChunkInput {
    /// Path to the extracted chunk (a PDF page range, an image, or a plain
    /// file for non-splittable formats).
    pub path: PathBuf,

    /// OCR language code, e.g. `"fra"` or `"eng"`.
    pub language: String,

    /// Rasterization DPI for image-based engines.
    pub dpi: u32,

    /// Ask the engine for its aggressive preprocessing mode.
    pub aggressive_preprocessing: bool,
}

/// What an engine produced for one chunk.
#[derive(Clone, Debug)]
pub struct OcrChunkOutput {
    /// The extracted text.
    pub text: String,

    /// The engine's own confidence in the result, when it reports one.
    /// Heuristic scoring downstream fills the gap otherwise.
    pub confidence: Option<f64>,
}

/// Interface to an OCR engine.
#[async_trait]
pub trait OcrEngine: Send + Sync + 'static {
    /// The engine's registry name.
    fn name(&self) -> &'static str;

    /// OCR a single chunk.
    async fn ocr_chunk(&self, input: &OcrChunkInput) -> Result<OcrChunkOutput>;
}

/// The set of engines available to the pipeline, by name.
#[derive(Clone)]
pub struct EngineRegistry {
    engines: BTreeMap<String, Arc<dyn OcrEngine>>,
}

impl EngineRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            engines: BTreeMap::new(),
        }
    }

    /// The standard registry: both local engines plus the echo engine.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(pdftotext::PdfToTextEngine::new()));
        registry.register(Arc::new(tesseract::TesseractEngine::new()));
        registry.register(Arc::new(echo::EchoEngine::new()));
        registry
    }

    /// Add an engine. A later registration replaces an earlier one with the
    /// same name.
    pub fn register(&mut self, engine: Arc<dyn OcrEngine>) {
        self.engines.insert(engine.name().to_owned(), engine);
    }

    /// Look up an engine by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn OcrEngine>> {
        self.engines.get(name).cloned()
    }

    /// Names of every registered engine.
    pub fn available(&self) -> Vec<String> {
        self.engines.keys().cloned().collect()
    }

    /// Pick the first available engine from an ordered preference list.
    pub fn first_available(&self, preferences: &[String]) -> Option<Arc<dyn OcrEngine>> {
        preferences.iter().find_map(|name| self.get(name))
    }
}

impl Default for EngineRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_registry_has_expected_engines() {
        let registry = EngineRegistry::standard();
        assert_eq!(registry.available(), vec!["echo", "pdftotext", "tesseract"]);
    }

    #[test]
    fn first_available_respects_preference_order() {
        let registry = EngineRegistry::standard();
        let engine = registry
            .first_available(&["docai".to_owned(), "tesseract".to_owned()])
            .unwrap();
        assert_eq!(engine.name(), "tesseract");
        assert!(registry.first_available(&["docai".to_owned()]).is_none());
    }
}
