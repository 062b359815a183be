//! Chunked document processing.
//!
//! Large documents are split into page-range chunks which are OCRed
//! independently, so one bad page range cannot take down the whole job and a
//! crash can resume where it left off. After every successful chunk we write
//! a checkpoint whose state is the serialized chunk list; resume replays
//! that list and skips chunks already marked processed.

use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

use futures::{StreamExt as _, stream};

use crate::{
    engines::{EngineRegistry, OcrChunkInput},
    hub::{NotificationHub, TaskEventKind},
    pages,
    prelude::*,
    queue::TaskControl,
    selector,
    store::TaskStore,
    task::{Attempt, Checkpoint, PageChunk, Task},
    validation::detector::estimate_text_confidence,
};

/// Default pages per chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 5;

/// Default soft deadline for one attempt.
pub const DEFAULT_SOFT_DEADLINE: Duration = Duration::from_secs(600);

/// Configuration for the chunked processor.
#[derive(Clone, Debug)]
pub struct ProcessorConfig {
    /// Pages per chunk when the task does not override it.
    pub chunk_size: usize,

    /// How many chunks of one task may run concurrently. 1 means strictly
    /// sequential, which is the default.
    pub chunk_concurrency: usize,

    /// Soft deadline for one attempt. Expiry surfaces as a timeout error,
    /// which the retry supervisor treats as recoverable.
    pub soft_deadline: Duration,

    /// Where chunk scratch files live.
    pub scratch_dir: PathBuf,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_concurrency: 1,
            soft_deadline: DEFAULT_SOFT_DEADLINE,
            scratch_dir: std::env::temp_dir(),
        }
    }
}

/// The merged result of one attempt.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct OcrOutcome {
    /// Did we produce usable output? Partial results still count as success
    /// when at least one chunk came through.
    pub success: bool,

    /// Where the merged document was written, if requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,

    /// The merged text, in page order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// Pages that produced output.
    pub pages_processed: usize,

    /// Total pages in the document.
    pub total_pages: usize,

    /// Wall-clock seconds spent.
    pub processing_time: f64,

    /// Per-metric confidences; `text` is always present on success.
    #[serde(default)]
    pub confidence_scores: BTreeMap<String, f64>,

    /// Engines actually used, in order of first use.
    #[serde(default)]
    pub engines_used: Vec<String>,

    /// Non-empty when some chunks failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl OcrOutcome {
    fn failure(total_pages: usize, elapsed: f64, message: String) -> Self {
        Self {
            success: false,
            output_path: None,
            text: None,
            pages_processed: 0,
            total_pages,
            processing_time: elapsed,
            confidence_scores: BTreeMap::new(),
            engines_used: vec![],
            error_message: Some(message),
        }
    }
}

/// How one call to [`ChunkedProcessor::process`] ended.
#[derive(Debug)]
pub enum ProcessVerdict {
    /// The attempt ran to completion (possibly partial or failed).
    Done(OcrOutcome),
    /// A cancellation signal was observed at a chunk boundary.
    Cancelled,
    /// A pause signal was observed at a chunk boundary. The checkpoint for
    /// completed chunks is already durable.
    Paused,
}

/// Splits a document into page ranges and drives them through an engine.
#[derive(Clone)]
pub struct ChunkedProcessor {
    config: ProcessorConfig,
    store: TaskStore,
    hub: NotificationHub,
    engines: EngineRegistry,
}

impl ChunkedProcessor {
    pub fn new(
        config: ProcessorConfig,
        store: TaskStore,
        hub: NotificationHub,
        engines: EngineRegistry,
    ) -> Self {
        Self {
            config,
            store,
            hub,
            engines,
        }
    }

    /// Process one task as one attempt, resuming from the latest checkpoint
    /// if one exists.
    #[instrument(level = "debug", skip_all, fields(task_id = %task.task_id))]
    pub async fn process(
        &self,
        task: &mut Task,
        attempt: &mut Attempt,
        control: &TaskControl,
    ) -> Result<ProcessVerdict> {
        let started = Instant::now();
        let deadline = started + self.config.soft_deadline;

        let total_pages = pages::page_count(&task.document_path).await?;
        task.total_pages = total_pages;

        // A zero-page document succeeds with empty text and zero chunks.
        if total_pages == 0 {
            return Ok(ProcessVerdict::Done(OcrOutcome {
                success: true,
                output_path: None,
                text: Some(String::new()),
                pages_processed: 0,
                total_pages: 0,
                processing_time: started.elapsed().as_secs_f64(),
                confidence_scores: BTreeMap::new(),
                engines_used: vec![],
                error_message: None,
            }));
        }

        // Decide which engine runs this attempt. Document analysis only
        // happens when the selector actually has a choice to make.
        let engine_name = if !attempt.engines_used.is_empty() {
            // The retry workflow froze an engine list for this attempt.
            attempt.engines_used[0].clone()
        } else if task.options.ocr_engine != "auto" {
            task.options.ocr_engine.clone()
        } else {
            let metrics = selector::analyze_document(&task.document_path).await?;
            let selection = selector::select_engines(
                &metrics,
                &self.engines.available(),
                task.options.preferred_strategy,
            );
            if !selection.needs_ocr {
                return Ok(ProcessVerdict::Done(
                    self.passthrough_text(task, total_pages, started)?,
                ));
            }
            debug!(
                task_id = %task.task_id,
                "selector chose {:?} for {:?} document",
                selection.engines,
                selection.complexity
            );
            selection
                .engines
                .first()
                .cloned()
                .ok_or_else(|| anyhow!("no OCR engine available"))?
        };
        let engine = self
            .engines
            .get(&engine_name)
            .ok_or_else(|| anyhow!("unknown OCR engine {:?}", engine_name))?;
        if !attempt.engines_used.contains(&engine_name) {
            attempt.engines_used.push(engine_name.clone());
        }

        // Plan chunks, or restore them from the latest checkpoint.
        let chunk_size = task.options.chunk_size.unwrap_or(self.config.chunk_size);
        let mut chunks = self
            .restore_or_plan(task, total_pages, chunk_size)
            .await?;
        let chunk_count = chunks.len();
        let done_already = chunks.iter().filter(|c| c.processed).count();
        if done_already > 0 {
            info!(
                task_id = %task.task_id,
                "resuming: {done_already}/{chunk_count} chunks already processed"
            );
        }

        // Process remaining chunks, a wave at a time. Pause and cancel are
        // observed between waves, which for the default concurrency of 1
        // means between chunks.
        let concurrency = self.config.chunk_concurrency.max(1);
        let mut wave_start = 0;
        while wave_start < chunk_count {
            if control.is_cancelled() {
                return Ok(ProcessVerdict::Cancelled);
            }
            if control.is_paused() {
                return Ok(ProcessVerdict::Paused);
            }

            let pending: Vec<usize> = (wave_start..chunk_count)
                .filter(|&i| !chunks[i].processed)
                .take(concurrency)
                .collect();
            if pending.is_empty() {
                break;
            }
            wave_start = pending.last().unwrap() + 1;

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(anyhow!(
                    "soft deadline expired after {}s",
                    self.config.soft_deadline.as_secs()
                ));
            }

            let results = tokio::time::timeout(
                remaining,
                stream::iter(pending.iter().copied().map(|i| {
                    let chunk = chunks[i].clone();
                    let engine = engine.clone();
                    let input = OcrChunkInput {
                        path: chunk.output_path.clone(),
                        language: attempt.params.language.clone(),
                        dpi: attempt.params.dpi,
                        aggressive_preprocessing: attempt.params.aggressive_preprocessing,
                    };
                    async move {
                        let result = Self::run_chunk(&chunk, &engine, &input).await;
                        (i, result)
                    }
                }))
                .buffer_unordered(concurrency)
                .collect::<Vec<_>>(),
            )
            .await
            .map_err(|_| {
                anyhow!(
                    "soft deadline expired after {}s",
                    self.config.soft_deadline.as_secs()
                )
            })?;

            for (i, result) in results {
                match result {
                    Ok((text, confidence)) => {
                        chunks[i].processed = true;
                        chunks[i].text = Some(text);
                        chunks[i].confidence = confidence;
                        self.checkpoint_chunks(task, attempt, &chunks, i).await?;
                    }
                    Err(err) => {
                        warn!(
                            task_id = %task.task_id,
                            "chunk {}-{} failed: {err:#}",
                            chunks[i].start_page,
                            chunks[i].end_page
                        );
                    }
                }
            }

            // Report progress after each wave.
            let done = chunks.iter().filter(|c| c.processed).count();
            let progress = 0.1 + 0.85 * done as f64 / chunk_count as f64;
            task.progress = task.progress.max(progress);
            task.current_page = chunks
                .iter()
                .filter(|c| c.processed)
                .map(|c| c.end_page + 1)
                .max()
                .unwrap_or(0);
            self.store.put_task(task).await?;
            self.hub.publish(
                &task.task_id,
                TaskEventKind::Progress {
                    fraction: task.progress,
                    page: task.current_page,
                    total: total_pages,
                },
            );
        }

        Ok(ProcessVerdict::Done(self.merge(
            task,
            &chunks,
            engine_name,
            started,
        ).await?))
    }

    /// Handle documents that need no OCR at all: read the text straight off
    /// the file.
    fn passthrough_text(
        &self,
        task: &Task,
        total_pages: usize,
        started: Instant,
    ) -> Result<OcrOutcome> {
        let text = std::fs::read_to_string(&task.document_path)
            .with_context(|| format!("failed to read {:?}", task.document_path))?;
        let mut confidence_scores = BTreeMap::new();
        confidence_scores.insert("text".to_owned(), 1.0);
        Ok(OcrOutcome {
            success: true,
            output_path: None,
            text: Some(text),
            pages_processed: total_pages,
            total_pages,
            processing_time: started.elapsed().as_secs_f64(),
            confidence_scores,
            engines_used: vec![],
            error_message: None,
        })
    }

    /// Restore the chunk list from the latest checkpoint, or plan it fresh.
    async fn restore_or_plan(
        &self,
        task: &Task,
        total_pages: usize,
        chunk_size: usize,
    ) -> Result<Vec<PageChunk>> {
        if let Some(checkpoint) = self.store.load_latest_checkpoint(&task.task_id).await? {
            if let Ok(chunks) =
                serde_json::from_value::<Vec<PageChunk>>(checkpoint.state.clone())
            {
                let covered: usize = chunks.iter().map(|c| c.page_count()).sum();
                if covered == total_pages && !chunks.is_empty() {
                    return Ok(chunks);
                }
                // The document changed under us; replan from scratch.
                warn!(task_id = %task.task_id, "stale checkpoint ignored");
            }
        }

        let chunks = pages::plan_chunks(
            &task.document_path,
            total_pages,
            chunk_size,
            &self.config.scratch_dir,
        );
        info!(
            task_id = %task.task_id,
            "split {:?} into {} chunks",
            task.document_path,
            chunks.len()
        );
        Ok(chunks)
    }

    /// Extract and OCR one chunk.
    async fn run_chunk(
        chunk: &PageChunk,
        engine: &std::sync::Arc<dyn crate::engines::OcrEngine>,
        input: &OcrChunkInput,
    ) -> Result<(String, Option<f64>)> {
        pages::extract_range(chunk).await.with_context(|| {
            format!(
                "failed to extract pages {}-{}",
                chunk.start_page, chunk.end_page
            )
        })?;
        let output = engine.ocr_chunk(input).await?;
        Ok((output.text, output.confidence))
    }

    /// Persist a checkpoint recording the chunk list after chunk `i`
    /// finished.
    async fn checkpoint_chunks(
        &self,
        task: &Task,
        attempt: &Attempt,
        chunks: &[PageChunk],
        i: usize,
    ) -> Result<()> {
        let checkpoint = Checkpoint {
            task_id: task.task_id.clone(),
            attempt_id: attempt.attempt_id.clone(),
            created_at: Utc::now(),
            state: serde_json::to_value(chunks)?,
            current_page: chunks[i].end_page + 1,
            total_pages: task.total_pages,
            progress: chunks.iter().filter(|c| c.processed).count() as f64
                / chunks.len() as f64,
        };
        self.store.put_checkpoint(&checkpoint).await?;
        self.hub
            .publish(&task.task_id, TaskEventKind::CheckpointCreated);
        Ok(())
    }

    /// Merge processed chunks into the final outcome.
    async fn merge(
        &self,
        task: &Task,
        chunks: &[PageChunk],
        engine_name: String,
        started: Instant,
    ) -> Result<OcrOutcome> {
        let elapsed = started.elapsed().as_secs_f64();
        let done: Vec<&PageChunk> = chunks.iter().filter(|c| c.processed).collect();
        let failed = chunks.len() - done.len();

        if done.is_empty() {
            return Ok(OcrOutcome::failure(
                task.total_pages,
                elapsed,
                format!(
                    "all {} chunks failed for {:?}",
                    chunks.len(),
                    task.document_path
                ),
            ));
        }

        // Merge the processed page ranges into the output document, if one
        // was requested.
        let output_path = if let Some(output_path) = &task.output_path {
            pages::merge_ranges(chunks, output_path).await?;
            Some(output_path.clone())
        } else {
            None
        };

        // Concatenate text in page order.
        let mut ordered = done.clone();
        ordered.sort_by_key(|c| c.start_page);
        let text = ordered
            .iter()
            .filter_map(|c| c.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n\n");

        // Engine confidence when reported, heuristic otherwise.
        let reported: Vec<f64> = ordered.iter().filter_map(|c| c.confidence).collect();
        let text_confidence = if reported.len() == ordered.len() {
            reported.iter().sum::<f64>() / reported.len() as f64
        } else {
            estimate_text_confidence(&text)
        };
        let mut confidence_scores = BTreeMap::new();
        confidence_scores.insert("text".to_owned(), text_confidence);

        let pages_processed: usize = done.iter().map(|c| c.page_count()).sum();
        Ok(OcrOutcome {
            success: true,
            output_path,
            text: Some(text),
            pages_processed,
            total_pages: task.total_pages,
            processing_time: elapsed,
            confidence_scores,
            engines_used: vec![engine_name],
            error_message: if failed > 0 {
                Some(format!("{failed} of {} chunks failed", chunks.len()))
            } else {
                None
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap as Map;

    use crate::task::{AttemptParams, OcrOptions, Priority};

    use super::*;

    fn fixture(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn processor(dir: &Path) -> (ChunkedProcessor, TaskStore) {
        let store = TaskStore::open(dir.join("store")).unwrap();
        let config = ProcessorConfig {
            scratch_dir: dir.to_owned(),
            ..ProcessorConfig::default()
        };
        let processor = ChunkedProcessor::new(
            config,
            store.clone(),
            NotificationHub::new(),
            EngineRegistry::standard(),
        );
        (processor, store)
    }

    fn echo_task(path: PathBuf) -> Task {
        let options = OcrOptions {
            ocr_engine: "echo".to_owned(),
            ..OcrOptions::default()
        };
        Task::new(path, None, Priority::Normal, options, Map::new())
    }

    #[tokio::test]
    async fn zero_page_document_succeeds_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = fixture(dir.path(), "empty.txt", "");
        let (processor, _store) = processor(dir.path());

        let mut task = echo_task(path);
        let mut attempt = Attempt::new(vec![], AttemptParams::default());
        let verdict = processor
            .process(&mut task, &mut attempt, &TaskControl::new())
            .await
            .unwrap();
        match verdict {
            ProcessVerdict::Done(outcome) => {
                assert!(outcome.success);
                assert_eq!(outcome.text.as_deref(), Some(""));
                assert_eq!(outcome.total_pages, 0);
                assert_eq!(outcome.pages_processed, 0);
            }
            other => panic!("unexpected verdict {other:?}"),
        }
    }

    #[tokio::test]
    async fn single_file_runs_through_the_echo_engine() {
        let dir = tempfile::tempdir().unwrap();
        let path = fixture(dir.path(), "doc.txt", "tournez la page vers la figure 3");
        let (processor, store) = processor(dir.path());

        let mut task = echo_task(path);
        let mut attempt = Attempt::new(vec![], AttemptParams::default());
        let verdict = processor
            .process(&mut task, &mut attempt, &TaskControl::new())
            .await
            .unwrap();
        match verdict {
            ProcessVerdict::Done(outcome) => {
                assert!(outcome.success);
                assert_eq!(
                    outcome.text.as_deref(),
                    Some("tournez la page vers la figure 3")
                );
                assert_eq!(outcome.pages_processed, 1);
                assert_eq!(outcome.engines_used, vec!["echo"]);
                assert!(outcome.confidence_scores.contains_key("text"));
            }
            other => panic!("unexpected verdict {other:?}"),
        }

        // A checkpoint was written for the completed chunk.
        let checkpoint = store
            .load_latest_checkpoint(&task.task_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(checkpoint.total_pages, 1);
        assert_eq!(checkpoint.progress, 1.0);
    }

    #[tokio::test]
    async fn cancellation_is_observed_before_the_first_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let path = fixture(dir.path(), "doc.txt", "some text");
        let (processor, _store) = processor(dir.path());

        let mut task = echo_task(path);
        let mut attempt = Attempt::new(vec![], AttemptParams::default());
        let control = TaskControl::new();
        control.cancel();
        let verdict = processor
            .process(&mut task, &mut attempt, &control)
            .await
            .unwrap();
        assert!(matches!(verdict, ProcessVerdict::Cancelled));
    }

    #[tokio::test]
    async fn resume_skips_processed_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = fixture(dir.path(), "doc.txt", "remaining work");
        let (processor, store) = processor(dir.path());

        let mut task = echo_task(path.clone());
        // Seed a checkpoint claiming the single chunk is already processed
        // with different text. The processor must keep that result instead
        // of re-running the chunk.
        let chunks = vec![PageChunk {
            source_path: path.clone(),
            output_path: dir.path().join("chunk.txt"),
            start_page: 0,
            end_page: 0,
            processed: true,
            text: Some("previously processed".to_owned()),
            confidence: Some(0.9),
        }];
        store
            .put_checkpoint(&Checkpoint {
                task_id: task.task_id.clone(),
                attempt_id: "a0".to_owned(),
                created_at: Utc::now(),
                state: serde_json::to_value(&chunks).unwrap(),
                current_page: 1,
                total_pages: 1,
                progress: 1.0,
            })
            .await
            .unwrap();

        let mut attempt = Attempt::new(vec![], AttemptParams::default());
        let verdict = processor
            .process(&mut task, &mut attempt, &TaskControl::new())
            .await
            .unwrap();
        match verdict {
            ProcessVerdict::Done(outcome) => {
                assert!(outcome.success);
                assert_eq!(outcome.text.as_deref(), Some("previously processed"));
            }
            other => panic!("unexpected verdict {other:?}"),
        }
    }

    #[tokio::test]
    async fn plain_text_passthrough_skips_ocr() {
        let dir = tempfile::tempdir().unwrap();
        let path = fixture(dir.path(), "doc.txt", "déjà du texte");
        let (processor, _store) = processor(dir.path());

        // `auto` on a plain-text file takes the no-OCR path.
        let mut task = echo_task(path);
        task.options.ocr_engine = "auto".to_owned();
        let mut attempt = Attempt::new(vec![], AttemptParams::default());
        let verdict = processor
            .process(&mut task, &mut attempt, &TaskControl::new())
            .await
            .unwrap();
        match verdict {
            ProcessVerdict::Done(outcome) => {
                assert!(outcome.success);
                assert_eq!(outcome.text.as_deref(), Some("déjà du texte"));
                assert_eq!(outcome.confidence_scores["text"], 1.0);
                assert!(outcome.engines_used.is_empty());
            }
            other => panic!("unexpected verdict {other:?}"),
        }
    }
}
