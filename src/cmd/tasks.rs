//! The `tasks` subcommand: inspect the task store.

use clap::Args;

use crate::{
    prelude::*,
    store::TaskStore,
    task::{TaskFilter, TaskStatus},
    ui::Ui,
};

use super::PipelineOpts;

/// Command line arguments for the `tasks` subcommand.
#[derive(Debug, Args)]
pub struct TasksOpts {
    /// Show one task by id instead of listing.
    #[clap(long = "id")]
    pub task_id: Option<String>,

    /// Keep only tasks with these statuses.
    #[clap(long = "status")]
    pub statuses: Vec<TaskStatus>,

    /// Maximum number of tasks to list.
    #[clap(long, default_value = "100")]
    pub limit: usize,

    /// Offset into the listing, newest first.
    #[clap(long, default_value = "0")]
    pub offset: usize,

    /// Print queue statistics instead of task records.
    #[clap(long)]
    pub stats: bool,

    #[clap(flatten)]
    pub pipeline: PipelineOpts,
}

/// The `tasks` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_tasks(ui: Ui, opts: &TasksOpts) -> Result<()> {
    // This command only reads the store; hide the (empty) progress UI.
    ui.hide_progress_bars();
    let settings = opts.pipeline.load_settings().await?;
    let store = TaskStore::open(&settings.store_dir)?;

    if let Some(task_id) = &opts.task_id {
        let task = store
            .get_task(task_id)
            .await?
            .ok_or_else(|| anyhow!("unknown task {task_id}"))?;
        println!("{}", serde_json::to_string_pretty(&task)?);
        return Ok(());
    }

    let filter = TaskFilter {
        statuses: if opts.statuses.is_empty() {
            None
        } else {
            Some(opts.statuses.clone())
        },
        ..TaskFilter::default()
    };
    let tasks = store.list_tasks(&filter).await?;

    if opts.stats {
        let mut histogram = std::collections::BTreeMap::new();
        for task in &tasks {
            *histogram.entry(task.status.as_str()).or_insert(0usize) += 1;
        }
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "total": tasks.len(),
                "status_histogram": histogram,
            }))?
        );
        return Ok(());
    }

    for task in tasks.iter().skip(opts.offset).take(opts.limit) {
        println!("{}", serde_json::to_string(task)?);
    }
    Ok(())
}
