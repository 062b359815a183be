//! The `process` subcommand: run one document through the whole pipeline.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use clap::Args;

use crate::{
    engines::EngineRegistry,
    orchestrator::{IndexSink, JsonlIndexSink, NoopIndexSink, Orchestrator},
    prelude::*,
    task::{OcrOptions, Priority, StrategyPreference},
    ui::Ui,
};

use super::PipelineOpts;

/// Command line arguments for the `process` subcommand.
#[derive(Debug, Args)]
pub struct ProcessOpts {
    /// The document to process.
    pub document_path: PathBuf,

    /// Where to write the processed (merged) document.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,

    /// Where to append the emitted text chunks, in JSONL format.
    #[clap(long = "chunks-out")]
    pub chunks_path: Option<PathBuf>,

    /// Scheduling priority.
    #[clap(long, default_value = "normal")]
    pub priority: Priority,

    /// OCR engine to use; `auto` lets the selector decide.
    #[clap(short = 'e', long = "engine", default_value = "auto")]
    pub ocr_engine: String,

    /// OCR language code.
    #[clap(short = 'l', long, default_value = "fra")]
    pub language: String,

    /// Pages per chunk.
    #[clap(long = "chunk-size")]
    pub chunk_size: Option<usize>,

    /// Prefer `speed` or `accuracy` when picking an engine.
    #[clap(long = "prefer")]
    pub preferred_strategy: Option<String>,

    /// Client metadata entries, as `key=value`.
    #[clap(long = "meta")]
    pub metadata: Vec<String>,

    /// How long to wait for the task, in seconds.
    #[clap(long, default_value = "3600")]
    pub wait_secs: u64,

    #[clap(flatten)]
    pub pipeline: PipelineOpts,
}

/// The `process` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_process(ui: Ui, opts: &ProcessOpts) -> Result<()> {
    let settings = opts.pipeline.load_settings().await?;

    let sink: Arc<dyn IndexSink> = match &opts.chunks_path {
        Some(path) => Arc::new(JsonlIndexSink::new(path.clone())),
        None => Arc::new(NoopIndexSink),
    };
    let orchestrator = Orchestrator::new(settings, EngineRegistry::standard(), sink)?;
    orchestrator.start();

    let preferred_strategy = match opts.preferred_strategy.as_deref() {
        Some("speed") => Some(StrategyPreference::Speed),
        Some("accuracy") => Some(StrategyPreference::Accuracy),
        Some(other) => return Err(anyhow!("unknown strategy preference {:?}", other)),
        None => None,
    };
    let options = OcrOptions {
        ocr_engine: opts.ocr_engine.clone(),
        language: opts.language.clone(),
        chunk_size: opts.chunk_size,
        extract_tables: false,
        extract_images: false,
        preferred_strategy,
    };

    let mut metadata = BTreeMap::new();
    for entry in &opts.metadata {
        let (key, value) = entry
            .split_once('=')
            .ok_or_else(|| anyhow!("metadata entry {:?} is not key=value", entry))?;
        metadata.insert(key.to_owned(), value.to_owned());
    }

    let spinner = ui.new_spinner(&crate::ui::ProgressConfig {
        emoji: "📄",
        msg: "Processing document",
        done_msg: "Processed document",
    });

    let task_id = orchestrator
        .enqueue(
            opts.document_path.clone(),
            opts.output_path.clone(),
            opts.priority,
            options,
            metadata,
        )
        .await?;
    info!(task_id, "document enqueued");

    let task = orchestrator
        .wait_for_terminal(&task_id, Duration::from_secs(opts.wait_secs))
        .await?;
    spinner.finish_with_message(format!("task {} is {}", task.task_id, task.status));

    println!("{}", serde_json::to_string_pretty(&task)?);
    Ok(())
}
