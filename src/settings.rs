//! Pipeline settings.
//!
//! Settings load from a TOML or JSON file (see
//! [`crate::async_utils::io::read_json_or_toml`]) or fall back to defaults.
//! Unknown keys are rejected rather than ignored.

use std::time::Duration;

use schemars::JsonSchema;

use crate::{
    chunker::ChunkerConfig,
    prelude::*,
    processor::ProcessorConfig,
    queue::QueueConfig,
    rate_limit::RateLimit,
    retry::RetryPolicy,
};

/// Everything the pipeline can be told at startup.
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields, default)]
pub struct Settings {
    /// Root directory of the task store.
    pub store_dir: PathBuf,

    /// Scratch directory for chunk files.
    pub scratch_dir: PathBuf,

    /// Worker pool size.
    pub max_concurrent: usize,

    /// Hard cap on queued tasks.
    pub max_queue_length: usize,

    /// Pages per chunk.
    pub chunk_size: usize,

    /// Concurrent chunks within one task. 1 is sequential.
    pub chunk_concurrency: usize,

    /// Soft deadline per attempt, in seconds. Expiry is a retryable timeout.
    pub soft_deadline_secs: u64,

    /// Hard deadline per task run, in seconds. Expiry releases the worker.
    pub hard_deadline_secs: u64,

    /// Retries after the first attempt.
    pub max_retries: usize,

    /// Quality-driven reprocessing attempts per document.
    pub max_attempts: usize,

    /// Hours to keep terminal tasks before the retention sweep removes them.
    pub completed_task_retention_hours: i64,

    /// Admission rate limit for critical/high enqueues, e.g. `"20/m"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub high_priority_limit: Option<String>,

    /// Maximum text chunk size, in characters.
    pub max_chunk_size: usize,

    /// Overlap between text chunks, in characters.
    pub overlap: usize,

    /// Compute chunk embeddings and similarity relations.
    pub compute_embeddings: bool,

    /// Cosine threshold for similarity relations.
    pub similarity_threshold: f64,

    /// Default audit sample size.
    pub sample_size: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from("docmill-data"),
            scratch_dir: std::env::temp_dir(),
            max_concurrent: crate::queue::DEFAULT_MAX_CONCURRENT,
            max_queue_length: crate::queue::DEFAULT_MAX_QUEUE_LENGTH,
            chunk_size: crate::processor::DEFAULT_CHUNK_SIZE,
            chunk_concurrency: 1,
            soft_deadline_secs: 600,
            hard_deadline_secs: 900,
            max_retries: crate::retry::DEFAULT_MAX_RETRIES,
            max_attempts: crate::validation::reprocess::DEFAULT_MAX_ATTEMPTS,
            completed_task_retention_hours: 24,
            high_priority_limit: None,
            max_chunk_size: crate::chunker::DEFAULT_MAX_CHUNK_SIZE,
            overlap: crate::chunker::DEFAULT_OVERLAP,
            compute_embeddings: true,
            similarity_threshold: crate::chunker::DEFAULT_SIMILARITY_THRESHOLD,
            sample_size: crate::validation::audit::DEFAULT_SAMPLE_SIZE,
        }
    }
}

impl Settings {
    /// The processor configuration slice of these settings.
    pub fn processor_config(&self) -> ProcessorConfig {
        ProcessorConfig {
            chunk_size: self.chunk_size,
            chunk_concurrency: self.chunk_concurrency,
            soft_deadline: Duration::from_secs(self.soft_deadline_secs),
            scratch_dir: self.scratch_dir.clone(),
        }
    }

    /// The queue configuration slice of these settings.
    pub fn queue_config(&self) -> Result<QueueConfig> {
        let high_priority_throttle = self
            .high_priority_limit
            .as_deref()
            .map(|limit| Ok::<_, anyhow::Error>(limit.parse::<RateLimit>()?.to_throttle()))
            .transpose()?;
        Ok(QueueConfig {
            max_concurrent: self.max_concurrent,
            max_queue_length: self.max_queue_length,
            hard_deadline: Duration::from_secs(self.hard_deadline_secs),
            high_priority_throttle,
        })
    }

    /// The chunker configuration slice of these settings.
    pub fn chunker_config(&self) -> ChunkerConfig {
        ChunkerConfig {
            max_chunk_size: self.max_chunk_size,
            overlap: self.overlap,
            compute_embeddings: self.compute_embeddings,
            similarity_threshold: self.similarity_threshold,
            key_term_limit: 10,
        }
    }

    /// The retry policy slice of these settings.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff_cap: crate::retry::DEFAULT_BACKOFF_CAP,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let settings = Settings::default();
        assert_eq!(settings.max_concurrent, 3);
        assert_eq!(settings.chunk_size, 5);
        assert_eq!(settings.soft_deadline_secs, 600);
        assert_eq!(settings.hard_deadline_secs, 900);
        assert_eq!(settings.max_retries, 3);
        assert_eq!(settings.completed_task_retention_hours, 24);
        assert_eq!(settings.max_chunk_size, 1000);
        assert_eq!(settings.overlap, 100);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = toml::from_str::<Settings>("max_concurent = 5\n");
        assert!(err.is_err());
    }

    #[test]
    fn partial_files_fill_in_defaults() {
        let settings: Settings =
            toml::from_str("max_concurrent = 8\nchunk_size = 10\n").unwrap();
        assert_eq!(settings.max_concurrent, 8);
        assert_eq!(settings.chunk_size, 10);
        assert_eq!(settings.max_retries, 3);
    }

    #[test]
    fn throttle_parses_from_settings() {
        let settings: Settings =
            toml::from_str(r#"high_priority_limit = "5/m""#).unwrap();
        let config = settings.queue_config().unwrap();
        assert!(config.high_priority_throttle.is_some());

        let settings: Settings =
            toml::from_str(r#"high_priority_limit = "bogus""#).unwrap();
        assert!(settings.queue_config().is_err());
    }
}
