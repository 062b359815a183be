use std::{process::ExitCode, str::FromStr};

use clap::{Parser, Subcommand};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::{prelude::*, task::ApiError, ui::Ui};

mod async_utils;
mod chunker;
mod cmd;
mod cpu_limit;
mod engines;
mod hub;
mod orchestrator;
mod pages;
mod prelude;
mod processor;
mod queue;
mod rate_limit;
mod retry;
mod selector;
mod settings;
mod store;
mod task;
mod ui;
mod validation;

/// Turn documents into clean, chunked, metadata-rich text.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
External tools:
  Poppler utilities (pdfinfo, pdfseparate, pdfunite, pdftocairo,
  pdftotext) are used for PDF handling, and the `tesseract` CLI for
  local OCR. Plain text and image inputs work without them.

  Environment variables may be set in a standard `.env` file.
"#
)]
struct Opts {
    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// Process one document through the pipeline and print its final state.
    Process(cmd::process::ProcessOpts),
    /// Process a batch of documents. The input records need a `path` field.
    Batch(cmd::batch::BatchOpts),
    /// Inspect the task store.
    Tasks(cmd::tasks::TasksOpts),
    /// Run a sampling audit over processed documents.
    Audit(cmd::audit::AuditOpts),
    /// Print schemas for input and output formats.
    Schema(cmd::schema::SchemaOpts),
}

impl Cmd {
    /// Are we using stdout for output?
    fn using_stdout_for_output(&self) -> bool {
        match self {
            Cmd::Process(_) => true,
            Cmd::Batch(opts) => opts.output_path.is_none(),
            Cmd::Tasks(_) => true,
            Cmd::Audit(_) => true,
            Cmd::Schema(opts) => opts.output_path.is_none(),
        }
    }
}

/// Our entry point. Failures map onto the documented return codes:
/// 1 for invalid input, 2 for not found, 3 for conflicts, 5 for internal
/// errors.
#[tokio::main]
async fn main() -> ExitCode {
    let ui = Ui::init();

    // Initialize tracing.
    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(ui.get_stderr_writer())
        .with_filter(env_filter);

    // We can stack multiple layers here if we need to.
    tracing_subscriber::registry().with(subscriber).init();

    // Call our real `main` function now that logging is set up.
    match real_main(ui).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            let code = err
                .downcast_ref::<ApiError>()
                .map(|api_err| api_err.code())
                .unwrap_or(5);
            ExitCode::from(code)
        }
    }
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui) -> Result<()> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    // Parse command-line arguments.
    let opts = Opts::parse();
    debug!("parsed options: {:?}", opts);

    // Hide the progress bar if we're using stdout for output.
    if opts.subcmd.using_stdout_for_output() {
        ui.hide_progress_bars();
    }

    // Run the appropriate subcommand.
    match &opts.subcmd {
        Cmd::Process(opts) => cmd::process::cmd_process(ui, opts).await?,
        Cmd::Batch(opts) => cmd::batch::cmd_batch(ui, opts).await?,
        Cmd::Tasks(opts) => cmd::tasks::cmd_tasks(ui, opts).await?,
        Cmd::Audit(opts) => cmd::audit::cmd_audit(ui, opts).await?,
        Cmd::Schema(opts) => cmd::schema::cmd_schema(opts).await?,
    }
    Ok(())
}
