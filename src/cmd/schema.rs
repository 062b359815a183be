//! The `schema` subcommand: print JSON Schemas for our record types.

use clap::Args;
use schemars::schema_for;

use crate::{
    chunker::TextChunk,
    prelude::*,
    settings::Settings,
    task::{OcrOptions, Task},
    validation::detector::ValidationReport,
};

/// The record types we can print schemas for.
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum SchemaKind {
    /// The enqueue-time OCR options record.
    Options,
    /// The task status record.
    Task,
    /// An emitted text chunk.
    Chunk,
    /// A validation report.
    Report,
    /// The pipeline settings file.
    Settings,
    /// A batch input record.
    BatchInput,
    /// A batch output record.
    BatchOutput,
}

/// Command line arguments for the `schema` subcommand.
#[derive(Debug, Args)]
pub struct SchemaOpts {
    /// Which schema to print.
    #[clap(value_enum)]
    pub kind: SchemaKind,

    /// Output location. Defaults to standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The `schema` subcommand.
pub async fn cmd_schema(opts: &SchemaOpts) -> Result<()> {
    let schema = match opts.kind {
        SchemaKind::Options => schema_for!(OcrOptions),
        SchemaKind::Task => schema_for!(Task),
        SchemaKind::Chunk => schema_for!(TextChunk),
        SchemaKind::Report => schema_for!(ValidationReport),
        SchemaKind::Settings => schema_for!(Settings),
        SchemaKind::BatchInput => schema_for!(super::batch::BatchInput),
        SchemaKind::BatchOutput => schema_for!(super::batch::BatchOutput),
    };
    let json = serde_json::to_string_pretty(&schema)?;
    match &opts.output_path {
        Some(path) => tokio::fs::write(path, json.as_bytes())
            .await
            .with_context(|| format!("failed to write schema to {:?}", path))?,
        None => println!("{json}"),
    }
    Ok(())
}
