//! Command-line entry points.

use crate::{async_utils::io::read_json_or_toml, prelude::*, settings::Settings};

pub mod audit;
pub mod batch;
pub mod process;
pub mod schema;
pub mod tasks;

use clap::Args;

/// Options shared by subcommands that touch the pipeline or its store.
#[derive(Debug, Clone, Args)]
pub struct PipelineOpts {
    /// Settings file, in TOML or JSON format. Defaults apply otherwise.
    #[clap(long = "settings")]
    pub settings_path: Option<PathBuf>,

    /// Override the task store directory.
    #[clap(long = "store-dir")]
    pub store_dir: Option<PathBuf>,

    /// Override the worker pool size.
    #[clap(short = 'j', long = "jobs")]
    pub max_concurrent: Option<usize>,
}

impl PipelineOpts {
    /// Resolve the effective settings: file, then CLI overrides.
    pub async fn load_settings(&self) -> Result<Settings> {
        let mut settings = match &self.settings_path {
            Some(path) => read_json_or_toml::<Settings>(path).await?,
            None => Settings::default(),
        };
        if let Some(store_dir) = &self.store_dir {
            settings.store_dir = store_dir.clone();
        }
        if let Some(max_concurrent) = self.max_concurrent {
            settings.max_concurrent = max_concurrent;
        }
        Ok(settings)
    }
}
