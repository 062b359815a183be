//! Top-level wiring of the pipeline.
//!
//! The orchestrator owns every component, built explicitly at startup: the
//! store, the hub, the queue, the chunked processor, the chunker, the
//! validator, and the index sink. For each dequeued task it drives
//! processing, chunking, and validation; a reprocessing verdict re-enqueues
//! the task with a strategy derived from its attempt history; a terminal
//! success hands the chunks to the [`IndexSink`].

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use futures::FutureExt as _;
use tokio::io::AsyncWriteExt as _;

use crate::{
    chunker::{RelationalChunker, TextChunk},
    engines::EngineRegistry,
    hub::{NotificationHub, TaskEventKind},
    prelude::*,
    processor::{ChunkedProcessor, OcrOutcome, ProcessVerdict},
    queue::{TaskControl, TaskQueue, TaskRunner, QueueStats},
    retry::RetrySupervisor,
    settings::Settings,
    store::{AuditKind, TaskStore},
    task::{
        ApiError, Attempt, AttemptParams, OcrOptions, Priority, Task, TaskFilter,
        TaskStatus,
    },
    validation::{
        audit::{AuditReport, SamplingAuditor, SamplingStrategy, ValidationSample},
        detector::{LowConfidenceDetector, ProcessingSummary, ValidationReport},
        reprocess::{self, ReprocessingJob},
    },
};

/// Receives the chunks of successfully processed documents for downstream
/// indexing.
#[async_trait]
pub trait IndexSink: Send + Sync + 'static {
    async fn deliver(&self, task_id: &str, chunks: &[TextChunk]) -> Result<()>;
}

/// A sink that drops everything. Useful when only the processed documents
/// matter.
pub struct NoopIndexSink;

#[async_trait]
impl IndexSink for NoopIndexSink {
    async fn deliver(&self, _task_id: &str, _chunks: &[TextChunk]) -> Result<()> {
        Ok(())
    }
}

/// A sink that appends chunks to a JSONL file.
pub struct JsonlIndexSink {
    path: PathBuf,
}

impl JsonlIndexSink {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl IndexSink for JsonlIndexSink {
    async fn deliver(&self, task_id: &str, chunks: &[TextChunk]) -> Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("failed to open index sink {:?}", self.path))?;
        for chunk in chunks {
            let line = serde_json::to_string(&json!({
                "task_id": task_id,
                "chunk": chunk,
            }))?;
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
        }
        file.flush().await?;
        Ok(())
    }
}

/// The assembled pipeline.
pub struct Orchestrator {
    settings: Settings,
    store: TaskStore,
    hub: NotificationHub,
    queue: Arc<TaskQueue>,
    processor: ChunkedProcessor,
    chunker: RelationalChunker,
    detector: LowConfidenceDetector,
    supervisor: RetrySupervisor,
    auditor: SamplingAuditor,
    engines: EngineRegistry,
    sink: Arc<dyn IndexSink>,
}

impl Orchestrator {
    /// Build the pipeline from settings, an engine registry, and a sink.
    pub fn new(
        settings: Settings,
        engines: EngineRegistry,
        sink: Arc<dyn IndexSink>,
    ) -> Result<Arc<Self>> {
        let store = TaskStore::open(&settings.store_dir)?;
        let hub = NotificationHub::new();
        let queue = TaskQueue::new(settings.queue_config()?, store.clone(), hub.clone());
        let processor = ChunkedProcessor::new(
            settings.processor_config(),
            store.clone(),
            hub.clone(),
            engines.clone(),
        );
        let chunker = RelationalChunker::new(settings.chunker_config());
        let supervisor =
            RetrySupervisor::new(settings.retry_policy(), store.clone(), hub.clone());
        let auditor = SamplingAuditor::new(store.clone(), settings.sample_size);

        Ok(Arc::new(Self {
            settings,
            store,
            hub,
            queue,
            processor,
            chunker,
            detector: LowConfidenceDetector::default(),
            supervisor,
            auditor,
            engines,
            sink,
        }))
    }

    /// Start the dispatcher and the retention sweeper.
    pub fn start(self: &Arc<Self>) {
        self.queue.start(self.clone());

        let store = self.store.clone();
        let retention =
            chrono::Duration::hours(self.settings.completed_task_retention_hours);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                if let Err(err) = store.sweep_completed(retention).await {
                    warn!("retention sweep failed: {err:#}");
                }
            }
        });
    }

    /// The event hub, for subscribers.
    pub fn hub(&self) -> &NotificationHub {
        &self.hub
    }

    /// The task store.
    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    /// Submit a document for processing.
    pub async fn enqueue(
        &self,
        document_path: PathBuf,
        output_path: Option<PathBuf>,
        priority: Priority,
        options: OcrOptions,
        metadata: BTreeMap<String, String>,
    ) -> Result<String, ApiError> {
        let document_path = document_path.canonicalize().map_err(|err| {
            ApiError::InvalidInput(format!("bad document path: {err}"))
        })?;
        if options.ocr_engine != "auto" && self.engines.get(&options.ocr_engine).is_none()
        {
            return Err(ApiError::InvalidInput(format!(
                "unknown OCR engine {:?}",
                options.ocr_engine
            )));
        }
        let task = Task::new(document_path, output_path, priority, options, metadata);
        self.queue.enqueue(task).await
    }

    /// Fetch one task's status.
    pub async fn status(&self, task_id: &str) -> Result<Task, ApiError> {
        self.queue.status(task_id).await
    }

    /// List tasks, newest first, with pagination.
    pub async fn list_tasks(
        &self,
        statuses: Option<Vec<TaskStatus>>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Task>, ApiError> {
        let filter = TaskFilter {
            statuses,
            ..TaskFilter::default()
        };
        let tasks = self
            .store
            .list_tasks(&filter)
            .await
            .map_err(|err| ApiError::Internal(format!("{err:#}")))?;
        Ok(tasks.into_iter().skip(offset).take(limit).collect())
    }

    pub async fn pause(&self, task_id: &str) -> Result<bool, ApiError> {
        self.queue.pause(task_id).await
    }

    pub async fn resume(&self, task_id: &str) -> Result<bool, ApiError> {
        self.queue.resume(task_id).await
    }

    pub async fn cancel(&self, task_id: &str) -> Result<bool, ApiError> {
        self.queue.cancel(task_id).await
    }

    pub async fn queue_stats(&self) -> Result<QueueStats> {
        self.queue.stats().await
    }

    /// Delete a task and everything it owns.
    pub async fn delete(&self, task_id: &str) -> Result<bool, ApiError> {
        let deleted = self
            .store
            .delete_task(task_id)
            .await
            .map_err(|err| ApiError::Internal(format!("{err:#}")))?;
        if deleted {
            self.hub.publish(task_id, TaskEventKind::Deleted);
        }
        Ok(deleted)
    }

    /// Run a sampling audit: draw a sample, analyze it, persist both.
    pub async fn audit(
        &self,
        strategy: SamplingStrategy,
        size: Option<usize>,
    ) -> Result<(ValidationSample, AuditReport)> {
        let sample = self.auditor.create_sample(strategy, size).await?;
        let report = self.auditor.analyze(&sample).await?;
        Ok((sample, report))
    }

    /// Wait for a task to reach a terminal status.
    pub async fn wait_for_terminal(
        &self,
        task_id: &str,
        timeout: Duration,
    ) -> Result<Task> {
        self.queue.wait_for_terminal(task_id, timeout).await
    }

    /// The strategy for the task's next attempt.
    ///
    /// The first attempt follows the client's options; later attempts derive
    /// from the stored validation report and the attempt history.
    async fn next_strategy(&self, task: &Task) -> Result<(Vec<String>, AttemptParams)> {
        let prior_report: Option<ValidationReport> = self
            .store
            .get_audit_record(AuditKind::Validation, &report_record_id(&task.task_id))
            .await?;

        if let Some(report) = prior_report {
            if !task.attempts.is_empty() {
                let mut job = ReprocessingJob::new(
                    task.task_id.clone(),
                    task.document_path.clone(),
                    report,
                );
                job.attempts = task.attempts.clone();
                let strategy = reprocess::derive_strategy(&job, &self.engines.available());
                return Ok((strategy.engines, strategy.params));
            }
        }

        // First pass: honor the requested engine (or let the selector pick)
        // and the requested language.
        let engines = if task.options.ocr_engine == "auto" {
            vec![]
        } else {
            vec![task.options.ocr_engine.clone()]
        };
        let params = AttemptParams {
            language: task.options.language.clone(),
            ..AttemptParams::default()
        };
        Ok((engines, params))
    }

    /// Persist a status transition and publish it, in that order.
    async fn move_to(&self, task: &mut Task, to: TaskStatus) -> Result<()> {
        let from = task.status;
        task.transition(to).map_err(|err| anyhow!("{err}"))?;
        self.store.put_task(task).await?;
        self.hub
            .publish(&task.task_id, TaskEventKind::StateChanged { from, to });
        Ok(())
    }

    /// Handle a successful processing pass: chunk, validate, and either
    /// re-enqueue or finish.
    async fn finish_or_reprocess(
        &self,
        mut task: Task,
        outcome: OcrOutcome,
    ) -> Result<()> {
        let text = outcome.text.clone().unwrap_or_default();

        // Zero-page documents succeed trivially: nothing to validate or
        // index.
        if outcome.total_pages == 0 {
            task.progress = 1.0;
            self.move_to(&mut task, TaskStatus::Completed).await?;
            self.store.delete_checkpoint(&task.task_id).await?;
            return Ok(());
        }

        let chunking = self.chunker.chunk(&text);
        let report = self.detector.analyze(&ProcessingSummary {
            document_id: task.task_id.clone(),
            text,
            confidence_scores: outcome.confidence_scores.clone(),
            ..ProcessingSummary::default()
        });
        self.store
            .put_audit_record(
                AuditKind::Validation,
                &report_record_id(&task.task_id),
                &report,
            )
            .await?;

        if report.requires_reprocessing() && task.attempts.len() < self.settings.max_attempts
        {
            info!(
                task_id = %task.task_id,
                "validation requires reprocessing (confidence {:.2}, {} issues)",
                report.global_confidence,
                report.issues.len()
            );
            // The next attempt runs with a new strategy; its chunks must be
            // re-OCRed, so the checkpoint goes away now. The queue re-admits
            // the task once this worker releases it.
            self.store.delete_checkpoint(&task.task_id).await?;
            self.move_to(&mut task, TaskStatus::WaitingForResources).await?;
            self.move_to(&mut task, TaskStatus::Queued).await?;
            return Ok(());
        }

        // Terminal: settle on the best attempt.
        task.best_attempt = task
            .attempts
            .iter()
            .filter(|a| a.success)
            .max_by(|a, b| {
                a.overall_confidence()
                    .partial_cmp(&b.overall_confidence())
                    .expect("confidences are finite")
            })
            .map(|a| a.attempt_id.clone());

        // Reprocessed documents get a concluded job record for the audit
        // trail.
        if task.attempts.len() > 1 {
            let mut job = ReprocessingJob::new(
                task.task_id.clone(),
                task.document_path.clone(),
                report.clone(),
            );
            job.attempts = task.attempts.clone();
            let verdict = job.conclude();
            self.store
                .put_audit_record(
                    AuditKind::Validation,
                    &job_record_id(&task.task_id),
                    &job,
                )
                .await?;
            info!(task_id = %task.task_id, "reprocessing job concluded: {verdict:?}");
        }

        // Deliver to the index sink before the terminal transition: a task
        // observed as `Completed` always has its chunks downstream.
        self.sink
            .deliver(&task.task_id, &chunking.chunks)
            .await
            .context("index sink delivery failed")?;

        task.progress = 1.0;
        task.current_page = task.total_pages;
        self.move_to(&mut task, TaskStatus::Completed).await?;
        self.store.delete_checkpoint(&task.task_id).await?;
        Ok(())
    }
}

fn report_record_id(task_id: &str) -> String {
    format!("report_{task_id}")
}

fn job_record_id(task_id: &str) -> String {
    format!("job_{task_id}")
}

#[async_trait]
impl TaskRunner for Orchestrator {
    #[instrument(level = "debug", skip_all, fields(task_id = %task.task_id))]
    async fn run(&self, mut task: Task, control: TaskControl) -> Result<()> {
        self.move_to(&mut task, TaskStatus::Processing).await?;

        let (engines, params) = self.next_strategy(&task).await?;

        // Each supervised call is one attempt; retries append fresh attempt
        // records with the same frozen strategy. The closure clones its
        // handles so every attempt future owns what it touches.
        let processor = self.processor.clone();
        let store = self.store.clone();
        let run_control = control.clone();
        let (mut task, verdict) = self
            .supervisor
            .supervise(task, move |mut task, _retry| {
                let engines = engines.clone();
                let params = params.clone();
                let control = run_control.clone();
                let processor = processor.clone();
                let store = store.clone();
                async move {
                    let mut attempt = Attempt::new(engines, params);
                    let started = std::time::Instant::now();
                    let result =
                        processor.process(&mut task, &mut attempt, &control).await;
                    attempt.processing_time = started.elapsed().as_secs_f64();
                    match &result {
                        Ok(ProcessVerdict::Done(outcome)) => {
                            attempt.success = outcome.success;
                            attempt.pages_processed = outcome.pages_processed;
                            attempt.confidence_scores = outcome.confidence_scores.clone();
                            if attempt.engines_used.is_empty() {
                                attempt.engines_used = outcome.engines_used.clone();
                            }
                            attempt.error = outcome.error_message.clone();
                        }
                        Ok(_) => {}
                        Err(err) => {
                            attempt.error = Some(format!("{err:#}"));
                        }
                    }
                    // A parked or cancelled run is not a finished attempt:
                    // its checkpoint belongs to the same logical attempt,
                    // which resumes later.
                    let parked = matches!(
                        result,
                        Ok(ProcessVerdict::Paused) | Ok(ProcessVerdict::Cancelled)
                    );
                    if !parked {
                        task.attempts.push(attempt);
                        if let Err(err) = store.put_task(&task).await {
                            return (task, Err(err));
                        }
                    }

                    let outcome = match result {
                        Ok(ProcessVerdict::Done(outcome)) if !outcome.success => {
                            Err(anyhow!(
                                "processing produced no output: {}",
                                outcome
                                    .error_message
                                    .unwrap_or_else(|| "no chunks succeeded".to_owned())
                            ))
                        }
                        other => other,
                    };
                    (task, outcome)
                }
                .boxed()
            })
            .await;

        match verdict {
            Ok(ProcessVerdict::Done(outcome)) => {
                // Results of a cancelled task are discarded even when the
                // in-flight work ran to completion.
                if control.is_cancelled() {
                    self.move_to(&mut task, TaskStatus::Cancelled).await?;
                    return Ok(());
                }
                self.finish_or_reprocess(task, outcome).await
            }
            Ok(ProcessVerdict::Cancelled) => {
                self.move_to(&mut task, TaskStatus::Cancelled).await
            }
            Ok(ProcessVerdict::Paused) => {
                // The checkpoint for completed chunks is durable; the queue
                // re-admits the task on resume.
                self.move_to(&mut task, TaskStatus::Paused).await
            }
            Err(err) => {
                warn!(task_id = %task.task_id, "task failed: {err:#}");
                self.move_to(&mut task, TaskStatus::Failed).await
            }
        }
    }
}
