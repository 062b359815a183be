//! The `batch` subcommand: stream many documents through the queue.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use clap::Args;
use futures::StreamExt as _;
use schemars::JsonSchema;

use crate::{
    async_utils::io::{read_jsonl_or_csv, write_output},
    engines::EngineRegistry,
    orchestrator::{IndexSink, JsonlIndexSink, NoopIndexSink, Orchestrator},
    prelude::*,
    task::{OcrOptions, Priority, Task, TaskStatus},
    ui::{ProgressConfig, Ui},
};

use super::PipelineOpts;

/// One input record of a batch.
#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct BatchInput {
    /// Caller-side identifier, echoed into the output record.
    #[serde(default)]
    pub id: Option<Value>,

    /// The document to process.
    pub path: PathBuf,

    /// Where to write the processed document.
    #[serde(default)]
    pub output: Option<PathBuf>,

    /// Scheduling priority. Defaults to `normal`.
    #[serde(default)]
    pub priority: Option<Priority>,

    /// OCR options for this document.
    #[serde(default)]
    pub options: OcrOptions,

    /// Opaque client metadata.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// One output record of a batch.
#[derive(Debug, JsonSchema, Serialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct BatchOutput {
    /// The input record's id, or its path when no id was given.
    pub id: Value,

    /// The task that processed this record.
    pub task_id: String,

    /// The task's terminal status.
    pub status: TaskStatus,

    /// Pages that produced output.
    pub pages_processed: usize,

    /// The error message for failed tasks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BatchOutput {
    fn from_task(id: Value, task: &Task) -> Self {
        Self {
            id,
            task_id: task.task_id.clone(),
            status: task.status,
            pages_processed: task
                .attempts
                .iter()
                .map(|a| a.pages_processed)
                .max()
                .unwrap_or(0),
            error: task.last_error.as_ref().map(|e| e.message.clone()),
        }
    }
}

/// Command line arguments for the `batch` subcommand.
#[derive(Debug, Args)]
pub struct BatchOpts {
    /// Input data, in CSV or JSONL format. Defaults to standard input. Each
    /// record needs at least a `path` field.
    pub input_path: Option<PathBuf>,

    /// Output location, in JSONL format. Defaults to standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,

    /// Where to append the emitted text chunks, in JSONL format.
    #[clap(long = "chunks-out")]
    pub chunks_path: Option<PathBuf>,

    /// How long to wait for each task, in seconds.
    #[clap(long, default_value = "3600")]
    pub wait_secs: u64,

    #[clap(flatten)]
    pub pipeline: PipelineOpts,
}

/// The `batch` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_batch(ui: Ui, opts: &BatchOpts) -> Result<()> {
    let settings = opts.pipeline.load_settings().await?;

    let sink: Arc<dyn IndexSink> = match &opts.chunks_path {
        Some(path) => Arc::new(JsonlIndexSink::new(path.clone())),
        None => Arc::new(NoopIndexSink),
    };
    let orchestrator = Orchestrator::new(settings, EngineRegistry::standard(), sink)?;
    orchestrator.start();

    // Parse the input stream up front and enqueue everything; the queue's
    // priority rules decide execution order, not input order.
    let mut input = read_jsonl_or_csv(ui.clone(), opts.input_path.as_deref()).await?;
    let pb = ui.new_from_size_hint(
        &ProgressConfig {
            emoji: "📄",
            msg: "Processing documents",
            done_msg: "Processed documents",
        },
        input.size_hint(),
    );

    let mut submitted: Vec<(Value, String)> = vec![];
    while let Some(record) = input.next().await {
        let record: BatchInput = serde_json::from_value(record?)
            .context("failed to parse batch input record")?;
        let id = record
            .id
            .clone()
            .unwrap_or_else(|| Value::String(record.path.to_string_lossy().into_owned()));
        let task_id = orchestrator
            .enqueue(
                record.path,
                record.output,
                record.priority.unwrap_or_default(),
                record.options,
                record.metadata,
            )
            .await?;
        submitted.push((id, task_id));
    }

    // Collect terminal results in submission order.
    let mut outputs = vec![];
    for (id, task_id) in submitted {
        let task = orchestrator
            .wait_for_terminal(&task_id, Duration::from_secs(opts.wait_secs))
            .await?;
        pb.inc(1);
        outputs.push(Ok(serde_json::to_value(BatchOutput::from_task(id, &task))?));
    }
    pb.finish();

    write_output(
        opts.output_path.as_deref(),
        Box::pin(futures::stream::iter(outputs)),
    )
    .await
}
