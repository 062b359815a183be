//! The task data model.
//!
//! A [`Task`] is one request to process one document. It owns its
//! [`Attempt`]s, its latest [`Checkpoint`], and its error history. The
//! [`crate::store::TaskStore`] is the system of record for all of these;
//! everything else holds tasks by id.

use std::{collections::BTreeMap, fmt, str::FromStr};

use schemars::JsonSchema;
use uuid::Uuid;

use crate::prelude::*;

/// Generate a fresh opaque task id.
pub fn new_task_id() -> String {
    Uuid::new_v4().to_string()
}

/// Generate a fresh attempt id.
pub fn new_attempt_id() -> String {
    Uuid::new_v4().to_string()
}

/// Scheduling priority of a task.
///
/// The declaration order matters: `Critical` sorts before `High`, and so on
/// down to `Background`. The queue always dequeues the smallest value first.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    Hash,
    JsonSchema,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
    Background,
}

impl Priority {
    /// All priorities, highest first.
    pub const ALL: [Priority; 5] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
        Priority::Background,
    ];

    /// Stable name, used in histograms and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
            Priority::Background => "background",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Priority {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            "background" => Ok(Priority::Background),
            _ => Err(anyhow!("unknown priority {:?}", s)),
        }
    }
}

/// Lifecycle status of a task.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting in the queue.
    Queued,
    /// A worker picked the task up and is analyzing the document.
    Preprocessing,
    /// OCR is running.
    Processing,
    /// Parked by a pause request. Resume returns it to `Queued`.
    Paused,
    /// Eligible to run, but the worker pool is saturated.
    WaitingForResources,
    /// Finished successfully. Terminal.
    Completed,
    /// Finished with a fatal error. Terminal.
    Failed,
    /// Cancelled by request. Terminal.
    Cancelled,
}

impl TaskStatus {
    /// Is this a terminal status? Terminal tasks are immutable.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Stable name, used in histograms and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Preprocessing => "preprocessing",
            TaskStatus::Processing => "processing",
            TaskStatus::Paused => "paused",
            TaskStatus::WaitingForResources => "waiting_for_resources",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// All statuses, in lifecycle order.
    pub const ALL: [TaskStatus; 8] = [
        TaskStatus::Queued,
        TaskStatus::Preprocessing,
        TaskStatus::Processing,
        TaskStatus::Paused,
        TaskStatus::WaitingForResources,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    /// Is `next` a legal successor of `self`?
    ///
    /// Cancellation is allowed from any non-terminal status, pause from any
    /// non-terminal, non-paused status. Terminal statuses allow nothing.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            // Cancel and pause are broadly available.
            (_, Cancelled) => true,
            (Paused, Paused) => false,
            (_, Paused) => true,
            // Normal forward progress.
            (Queued, Preprocessing) => true,
            (Queued, WaitingForResources) => true,
            (WaitingForResources, Queued) => true,
            (WaitingForResources, Preprocessing) => true,
            (Preprocessing, Processing) => true,
            (Preprocessing, Failed) => true,
            (Processing, Completed) => true,
            (Processing, Failed) => true,
            (Processing, WaitingForResources) => true,
            // Resume.
            (Paused, Queued) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| anyhow!("unknown task status {:?}", s))
    }
}

/// Closed set of failure kinds used by the retry supervisor.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Out of memory, disk full, missing external tools.
    System,
    /// The soft deadline expired.
    Timeout,
    /// Bad input, unsupported format, malformed options.
    Validation,
    /// The OCR engine itself reported a fault.
    Ocr,
    /// A network-level failure talking to an external engine.
    Network,
    /// Anything we could not classify.
    Unknown,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::System => "system",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Validation => "validation",
            ErrorKind::Ocr => "ocr",
            ErrorKind::Network => "network",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One recorded failure of a task.
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct TaskError {
    /// What kind of failure this was.
    pub kind: ErrorKind,

    /// A human-readable message. Never empty.
    pub message: String,

    /// Whether the retry supervisor considered this failure recoverable.
    pub recoverable: bool,

    /// When the failure was recorded.
    pub timestamp: DateTime<Utc>,
}

impl TaskError {
    pub fn new(kind: ErrorKind, message: impl Into<String>, recoverable: bool) -> Self {
        Self {
            kind,
            message: message.into(),
            recoverable,
            timestamp: Utc::now(),
        }
    }
}

/// Errors surfaced to submitting clients.
///
/// Internal transients never appear here; the retry supervisor only surfaces
/// final outcomes.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ApiError {
    /// Bad path, unsupported type, malformed options.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Unknown task id.
    #[error("not found: {0}")]
    NotFound(String),

    /// Illegal state transition, such as cancelling a completed task.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The queue is at its hard cap.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A bug or an unclassified failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// The logical, transport-agnostic return code for this error.
    pub fn code(&self) -> u8 {
        match self {
            ApiError::InvalidInput(_) => 1,
            ApiError::NotFound(_) => 2,
            ApiError::Conflict(_) => 3,
            ApiError::ResourceExhausted(_) => 5,
            ApiError::Internal(_) => 5,
        }
    }
}

/// The strategy preference a client may express.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum StrategyPreference {
    /// Sort candidate engines by estimated cost, cheapest first.
    Speed,
    /// Keep the complexity-mapped preference order.
    Accuracy,
}

/// Options accepted at enqueue time.
///
/// Unknown keys are rejected at deserialization time rather than silently
/// ignored, so a misspelled option fails the enqueue.
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct OcrOptions {
    /// Engine to use: `"auto"` lets the selector decide.
    #[serde(default = "default_engine")]
    pub ocr_engine: String,

    /// OCR language code.
    #[serde(default = "default_language")]
    pub language: String,

    /// Pages per chunk. Defaults to the pipeline setting.
    #[serde(default)]
    pub chunk_size: Option<usize>,

    /// Whether to run table extraction heuristics.
    #[serde(default)]
    pub extract_tables: bool,

    /// Whether to record embedded-image statistics.
    #[serde(default)]
    pub extract_images: bool,

    /// Speed/accuracy preference for engine selection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_strategy: Option<StrategyPreference>,
}

fn default_engine() -> String {
    "auto".to_owned()
}

fn default_language() -> String {
    "fra".to_owned()
}

impl Default for OcrOptions {
    fn default() -> Self {
        Self {
            ocr_engine: default_engine(),
            language: default_language(),
            chunk_size: None,
            extract_tables: false,
            extract_images: false,
            preferred_strategy: None,
        }
    }
}

/// Frozen parameter snapshot for one attempt.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct AttemptParams {
    /// OCR language code.
    pub language: String,

    /// Rasterization DPI for image-based engines.
    pub dpi: u32,

    /// Whether aggressive preprocessing (deskew, denoise, binarize) was on.
    pub aggressive_preprocessing: bool,

    /// Specialized processors kept across attempts (formula, schema, table).
    #[serde(default)]
    pub specialized: Vec<String>,
}

impl Default for AttemptParams {
    fn default() -> Self {
        Self {
            language: default_language(),
            dpi: 300,
            aggressive_preprocessing: false,
            specialized: vec![],
        }
    }
}

/// One execution pass of a task.
///
/// Attempts are append-only: attempt N+1 only exists once attempt N is
/// terminal and was not a final success.
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct Attempt {
    /// Unique id within the task.
    pub attempt_id: String,

    /// When this attempt started.
    pub started_at: DateTime<Utc>,

    /// Engine names actually used, in order.
    pub engines_used: Vec<String>,

    /// The frozen parameter snapshot for this attempt.
    pub params: AttemptParams,

    /// Did the attempt produce a usable result?
    pub success: bool,

    /// Wall-clock processing time, in seconds.
    pub processing_time: f64,

    /// How many pages produced output.
    pub pages_processed: usize,

    /// Per-metric confidence scores (`text`, `formula`, `schema`, `table`).
    #[serde(default)]
    pub confidence_scores: BTreeMap<String, f64>,

    /// Error message if the attempt failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Attempt {
    /// Start a new attempt with the given strategy.
    pub fn new(engines: Vec<String>, params: AttemptParams) -> Self {
        Self {
            attempt_id: new_attempt_id(),
            started_at: Utc::now(),
            engines_used: engines,
            params,
            success: false,
            processing_time: 0.0,
            pages_processed: 0,
            confidence_scores: BTreeMap::new(),
            error: None,
        }
    }

    /// Mean of the per-metric confidences, or 0.0 when none were recorded.
    pub fn overall_confidence(&self) -> f64 {
        if self.confidence_scores.is_empty() {
            return 0.0;
        }
        self.confidence_scores.values().sum::<f64>() / self.confidence_scores.len() as f64
    }
}

/// Resumable state of an attempt.
///
/// At most one checkpoint per task survives compaction; the newest must
/// survive process restart until the task is terminal.
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct Checkpoint {
    /// The task this checkpoint belongs to.
    pub task_id: String,

    /// The attempt this checkpoint belongs to.
    pub attempt_id: String,

    /// When this checkpoint was written.
    pub created_at: DateTime<Utc>,

    /// Opaque resumable state. The chunked processor stores its chunk list
    /// here.
    pub state: Value,

    /// The last page index covered.
    pub current_page: usize,

    /// Total pages in the document.
    pub total_pages: usize,

    /// Fractional progress at checkpoint time.
    pub progress: f64,
}

/// A page range split out of a document for OCR.
///
/// The chunks of a task cover `[0, total_pages)` disjointly and contiguously
/// when ordered by `start_page`. Both bounds are 0-based and inclusive.
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct PageChunk {
    /// The source document.
    pub source_path: PathBuf,

    /// Scratch path holding the extracted page range.
    pub output_path: PathBuf,

    /// First page of the chunk.
    pub start_page: usize,

    /// Last page of the chunk, inclusive.
    pub end_page: usize,

    /// Has this chunk been OCRed?
    pub processed: bool,

    /// Extracted text, present once processed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// Engine confidence for this chunk, if the engine reported one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl PageChunk {
    /// Number of pages covered by this chunk.
    pub fn page_count(&self) -> usize {
        self.end_page - self.start_page + 1
    }
}

/// The unit of work: one request to process one document.
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct Task {
    /// Unique opaque id, independent of document content.
    pub task_id: String,

    /// Absolute path to the input document.
    pub document_path: PathBuf,

    /// Where to write the processed document, if requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,

    /// OCR options, frozen at enqueue time.
    pub options: OcrOptions,

    /// Opaque client metadata.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,

    /// Scheduling priority.
    pub priority: Priority,

    /// When the task entered the queue.
    pub added_at: DateTime<Utc>,

    /// Current lifecycle status.
    pub status: TaskStatus,

    /// Fractional progress in `[0, 1]`, monotonic within an attempt.
    pub progress: f64,

    /// Current page index within the document.
    pub current_page: usize,

    /// Total pages, once known.
    pub total_pages: usize,

    /// When the current attempt started running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// When the task reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Execution passes, append-only.
    #[serde(default)]
    pub attempts: Vec<Attempt>,

    /// Failure history.
    #[serde(default)]
    pub errors: Vec<TaskError>,

    /// The most recent failure, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<TaskError>,

    /// Id of the attempt whose result we kept.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_attempt: Option<String>,
}

impl Task {
    /// Create a freshly queued task.
    pub fn new(
        document_path: PathBuf,
        output_path: Option<PathBuf>,
        priority: Priority,
        options: OcrOptions,
        metadata: BTreeMap<String, String>,
    ) -> Self {
        Self {
            task_id: new_task_id(),
            document_path,
            output_path,
            options,
            metadata,
            priority,
            added_at: Utc::now(),
            status: TaskStatus::Queued,
            progress: 0.0,
            current_page: 0,
            total_pages: 0,
            started_at: None,
            completed_at: None,
            attempts: vec![],
            errors: vec![],
            last_error: None,
            best_attempt: None,
        }
    }

    /// Move the task to a new status, enforcing the state machine.
    ///
    /// Sets `started_at` on entering `Processing` and `completed_at` on
    /// entering a terminal status.
    pub fn transition(&mut self, next: TaskStatus) -> Result<(), ApiError> {
        if !self.status.can_transition_to(next) {
            return Err(ApiError::Conflict(format!(
                "task {} cannot move from {} to {}",
                self.task_id, self.status, next
            )));
        }
        if next == TaskStatus::Processing {
            self.started_at = Some(Utc::now());
        }
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        self.status = next;
        Ok(())
    }

    /// Record an error, updating `last_error` as well.
    pub fn record_error(&mut self, error: TaskError) {
        self.last_error = Some(error.clone());
        self.errors.push(error);
    }

    /// Estimate the remaining processing time in seconds.
    ///
    /// Extrapolates from the current attempt's elapsed time and progress.
    /// Returns `None` before processing starts or when progress is zero, so
    /// a resume that lowers progress simply restarts the extrapolation.
    pub fn estimated_time_remaining(&self) -> Option<u64> {
        let started_at = self.started_at?;
        if self.progress <= 0.0 {
            return None;
        }
        let elapsed = (Utc::now() - started_at).num_milliseconds() as f64 / 1000.0;
        if elapsed <= 0.0 {
            return None;
        }
        let estimated_total = elapsed / self.progress;
        Some((estimated_total * (1.0 - self.progress)).max(0.0) as u64)
    }

    /// Wall-clock processing time in seconds, if the task ran to a terminal
    /// status.
    pub fn processing_time(&self) -> Option<f64> {
        let (started, completed) = (self.started_at?, self.completed_at?);
        Some((completed - started).num_milliseconds() as f64 / 1000.0)
    }
}

/// Filter for [`crate::store::TaskStore::list_tasks`].
#[derive(Clone, Debug, Default)]
pub struct TaskFilter {
    /// Keep only these statuses. `None` keeps all.
    pub statuses: Option<Vec<TaskStatus>>,

    /// Keep only tasks added at or after this instant.
    pub added_since: Option<DateTime<Utc>>,

    /// Keep only tasks added at or before this instant.
    pub added_until: Option<DateTime<Utc>>,
}

impl TaskFilter {
    /// Does `task` pass this filter?
    pub fn matches(&self, task: &Task) -> bool {
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&task.status) {
                return false;
            }
        }
        if let Some(since) = self.added_since {
            if task.added_at < since {
                return false;
            }
        }
        if let Some(until) = self.added_until {
            if task.added_at > until {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        Task::new(
            PathBuf::from("/tmp/doc.pdf"),
            None,
            Priority::Normal,
            OcrOptions::default(),
            BTreeMap::new(),
        )
    }

    #[test]
    fn priority_orders_critical_first() {
        assert!(Priority::Critical < Priority::High);
        assert!(Priority::High < Priority::Normal);
        assert!(Priority::Normal < Priority::Low);
        assert!(Priority::Low < Priority::Background);
    }

    #[test]
    fn happy_path_transitions() {
        let mut t = task();
        t.transition(TaskStatus::Preprocessing).unwrap();
        t.transition(TaskStatus::Processing).unwrap();
        t.transition(TaskStatus::Completed).unwrap();
        assert!(t.completed_at.is_some());
        assert!(t.started_at.unwrap() <= t.completed_at.unwrap());
    }

    #[test]
    fn terminal_tasks_are_frozen() {
        let mut t = task();
        t.transition(TaskStatus::Cancelled).unwrap();
        for next in TaskStatus::ALL {
            assert!(t.transition(next).is_err(), "allowed {next}");
        }
    }

    #[test]
    fn pause_and_resume() {
        let mut t = task();
        t.transition(TaskStatus::Paused).unwrap();
        t.transition(TaskStatus::Queued).unwrap();
        t.transition(TaskStatus::Preprocessing).unwrap();
        t.transition(TaskStatus::Paused).unwrap();
        t.transition(TaskStatus::Queued).unwrap();
    }

    #[test]
    fn double_pause_is_rejected() {
        let mut t = task();
        t.transition(TaskStatus::Paused).unwrap();
        assert!(t.transition(TaskStatus::Paused).is_err());
    }

    #[test]
    fn eta_requires_progress() {
        let mut t = task();
        assert_eq!(t.estimated_time_remaining(), None);
        t.transition(TaskStatus::Preprocessing).unwrap();
        t.transition(TaskStatus::Processing).unwrap();
        assert_eq!(t.estimated_time_remaining(), None);
        t.progress = 0.5;
        // Elapsed time is tiny but nonnegative; the estimate must not be
        // negative either.
        if let Some(eta) = t.estimated_time_remaining() {
            assert!(eta < 60 * 60);
        }
    }

    #[test]
    fn options_reject_unknown_keys() {
        let err = serde_json::from_value::<OcrOptions>(json!({
            "ocr_engine": "auto",
            "langauge": "fra",
        }));
        assert!(err.is_err());
    }

    #[test]
    fn options_defaults() {
        let opts: OcrOptions = serde_json::from_value(json!({})).unwrap();
        assert_eq!(opts.ocr_engine, "auto");
        assert_eq!(opts.language, "fra");
        assert_eq!(opts.chunk_size, None);
    }

    #[test]
    fn attempt_overall_confidence() {
        let mut attempt = Attempt::new(vec!["tesseract".to_owned()], AttemptParams::default());
        assert_eq!(attempt.overall_confidence(), 0.0);
        attempt.confidence_scores.insert("text".to_owned(), 0.8);
        attempt.confidence_scores.insert("table".to_owned(), 0.6);
        assert!((attempt.overall_confidence() - 0.7).abs() < 1e-9);
    }

    #[test]
    fn error_codes_match_the_contract() {
        assert_eq!(ApiError::InvalidInput("x".into()).code(), 1);
        assert_eq!(ApiError::NotFound("x".into()).code(), 2);
        assert_eq!(ApiError::Conflict("x".into()).code(), 3);
        assert_eq!(ApiError::Internal("x".into()).code(), 5);
    }
}
