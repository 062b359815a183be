//! The `audit` subcommand: sampling audits over processed documents.

use clap::Args;

use crate::{
    prelude::*,
    store::TaskStore,
    ui::Ui,
    validation::audit::{SamplingAuditor, SamplingStrategy},
};

use super::PipelineOpts;

/// Command line arguments for the `audit` subcommand.
#[derive(Debug, Args)]
pub struct AuditOpts {
    /// Sampling strategy: random, recent, stratified, low_confidence, or
    /// critical_issues.
    #[clap(long, default_value = "random")]
    pub strategy: SamplingStrategy,

    /// Sample size. Defaults to the settings value.
    #[clap(long)]
    pub size: Option<usize>,

    #[clap(flatten)]
    pub pipeline: PipelineOpts,
}

/// The `audit` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_audit(ui: Ui, opts: &AuditOpts) -> Result<()> {
    ui.hide_progress_bars();
    let settings = opts.pipeline.load_settings().await?;
    let store = TaskStore::open(&settings.store_dir)?;
    let auditor = SamplingAuditor::new(store, settings.sample_size);

    let sample = auditor.create_sample(opts.strategy, opts.size).await?;
    let report = auditor.analyze(&sample).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
