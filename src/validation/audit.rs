//! Sampling audit over processed documents.
//!
//! Periodically draws a sample of recently processed tasks, computes
//! aggregate quality statistics, extracts recurring terms from the error
//! history, and emits plain-language recommendations. Samples and audit
//! results are persisted under the store's `samples/` and `validations/`
//! collections.

use std::collections::BTreeMap;

use rand::seq::SliceRandom;
use uuid::Uuid;

use crate::{
    prelude::*,
    store::{AuditKind, TaskStore},
    task::{Task, TaskFilter, TaskStatus},
};

/// Default sample size.
pub const DEFAULT_SAMPLE_SIZE: usize = 50;

/// How documents are picked into a sample.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingStrategy {
    /// Uniformly random over terminal tasks.
    Random,
    /// Most recently completed first.
    Recent,
    /// Spread evenly across document types (file extensions).
    Stratified,
    /// Lowest best-attempt confidence first.
    LowConfidence,
    /// Only tasks with unrecoverable errors or failed outcomes.
    CriticalIssues,
}

impl std::str::FromStr for SamplingStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "random" => Ok(SamplingStrategy::Random),
            "recent" => Ok(SamplingStrategy::Recent),
            "stratified" => Ok(SamplingStrategy::Stratified),
            "low_confidence" => Ok(SamplingStrategy::LowConfidence),
            "critical_issues" => Ok(SamplingStrategy::CriticalIssues),
            _ => Err(anyhow!("unknown sampling strategy {:?}", s)),
        }
    }
}

/// A drawn sample of task ids.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct ValidationSample {
    pub sample_id: String,
    pub strategy: SamplingStrategy,
    pub created_at: DateTime<Utc>,
    pub task_ids: Vec<String>,
}

/// Confidence statistics over a sample.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct ConfidenceStats {
    pub mean: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
    pub std_dev: f64,
}

/// The audit's aggregate output.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct AuditReport {
    pub validation_id: String,
    pub sample_id: String,
    pub created_at: DateTime<Utc>,
    pub document_count: usize,
    pub confidence: ConfidenceStats,
    /// Documents per quality bucket (excellent/good/acceptable/poor/very_poor).
    pub quality_distribution: BTreeMap<String, usize>,
    /// Mean confidence per engine.
    pub engine_confidence: BTreeMap<String, f64>,
    /// Tasks per error kind.
    pub error_histogram: BTreeMap<String, usize>,
    /// Share of sampled documents that needed more than one attempt.
    pub reprocessing_rate: f64,
    /// Terms recurring in error messages (3+ occurrences).
    pub common_terms: BTreeMap<String, usize>,
    pub recommendations: Vec<String>,
}

/// Draws samples and computes audits over the task store.
pub struct SamplingAuditor {
    store: TaskStore,
    sample_size: usize,
}

impl SamplingAuditor {
    pub fn new(store: TaskStore, sample_size: usize) -> Self {
        Self { store, sample_size }
    }

    /// Draw a sample using the given strategy and persist it.
    #[instrument(level = "debug", skip_all, fields(strategy = ?strategy))]
    pub async fn create_sample(
        &self,
        strategy: SamplingStrategy,
        size: Option<usize>,
    ) -> Result<ValidationSample> {
        let size = size.unwrap_or(self.sample_size);
        let mut terminal: Vec<Task> = self
            .store
            .list_tasks(&TaskFilter {
                statuses: Some(vec![
                    TaskStatus::Completed,
                    TaskStatus::Failed,
                    TaskStatus::Cancelled,
                ]),
                ..TaskFilter::default()
            })
            .await?;

        let selected: Vec<Task> = match strategy {
            SamplingStrategy::Random => {
                let mut rng = rand::thread_rng();
                terminal.shuffle(&mut rng);
                terminal.into_iter().take(size).collect()
            }
            SamplingStrategy::Recent => {
                terminal.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
                terminal.into_iter().take(size).collect()
            }
            SamplingStrategy::Stratified => stratify(terminal, size),
            SamplingStrategy::LowConfidence => {
                terminal.sort_by(|a, b| {
                    best_confidence(a)
                        .partial_cmp(&best_confidence(b))
                        .expect("confidences are finite")
                });
                terminal.into_iter().take(size).collect()
            }
            SamplingStrategy::CriticalIssues => terminal
                .into_iter()
                .filter(|t| {
                    t.status == TaskStatus::Failed
                        || t.errors.iter().any(|e| !e.recoverable)
                })
                .take(size)
                .collect(),
        };

        let sample = ValidationSample {
            sample_id: Uuid::new_v4().to_string(),
            strategy,
            created_at: Utc::now(),
            task_ids: selected.iter().map(|t| t.task_id.clone()).collect(),
        };
        self.store
            .put_audit_record(AuditKind::Sample, &sample.sample_id, &sample)
            .await?;
        info!(
            sample_id = %sample.sample_id,
            "drew {} of requested {} documents",
            sample.task_ids.len(),
            size
        );
        Ok(sample)
    }

    /// Analyze a sample and persist the resulting report.
    #[instrument(level = "debug", skip_all, fields(sample_id = %sample.sample_id))]
    pub async fn analyze(&self, sample: &ValidationSample) -> Result<AuditReport> {
        let mut tasks = vec![];
        for task_id in &sample.task_ids {
            if let Some(task) = self.store.get_task(task_id).await? {
                tasks.push(task);
            }
        }

        let confidences: Vec<f64> = tasks.iter().map(best_confidence).collect();
        let confidence = confidence_stats(&confidences);
        let quality_distribution = quality_distribution(&confidences);

        // Mean confidence per engine, over best attempts.
        let mut per_engine: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for task in &tasks {
            for attempt in &task.attempts {
                if let Some(engine) = attempt.engines_used.first() {
                    per_engine
                        .entry(engine.clone())
                        .or_default()
                        .push(attempt.overall_confidence());
                }
            }
        }
        let engine_confidence: BTreeMap<String, f64> = per_engine
            .into_iter()
            .map(|(engine, scores)| {
                let mean = scores.iter().sum::<f64>() / scores.len().max(1) as f64;
                (engine, (mean * 1000.0).round() / 1000.0)
            })
            .collect();

        let mut error_histogram: BTreeMap<String, usize> = BTreeMap::new();
        let mut descriptions = vec![];
        for task in &tasks {
            for error in &task.errors {
                *error_histogram
                    .entry(error.kind.as_str().to_owned())
                    .or_default() += 1;
                descriptions.push(error.message.clone());
            }
        }

        let reprocessed = tasks.iter().filter(|t| t.attempts.len() > 1).count();
        let reprocessing_rate = if tasks.is_empty() {
            0.0
        } else {
            reprocessed as f64 / tasks.len() as f64
        };

        let common_terms = common_terms(&descriptions, 3);
        let mut report = AuditReport {
            validation_id: Uuid::new_v4().to_string(),
            sample_id: sample.sample_id.clone(),
            created_at: Utc::now(),
            document_count: tasks.len(),
            confidence,
            quality_distribution,
            engine_confidence,
            error_histogram,
            reprocessing_rate,
            common_terms,
            recommendations: vec![],
        };
        report.recommendations = recommendations(&report, &tasks);

        self.store
            .put_audit_record(AuditKind::Validation, &report.validation_id, &report)
            .await?;
        Ok(report)
    }
}

/// Confidence of a task's best attempt, or 0.0 with no attempts.
fn best_confidence(task: &Task) -> f64 {
    task.attempts
        .iter()
        .filter(|a| a.success)
        .map(|a| a.overall_confidence())
        .fold(0.0, f64::max)
}

/// Take roughly `size / groups` documents from each document type.
fn stratify(tasks: Vec<Task>, size: usize) -> Vec<Task> {
    let mut by_type: BTreeMap<String, Vec<Task>> = BTreeMap::new();
    for task in tasks {
        let kind = task
            .document_path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_else(|| "unknown".to_owned());
        by_type.entry(kind).or_default().push(task);
    }
    let groups = by_type.len().max(1);
    let per_group = (size / groups).max(1);

    let mut selected = vec![];
    for (_, mut group) in by_type {
        group.truncate(per_group);
        selected.append(&mut group);
    }
    selected.truncate(size);
    selected
}

fn confidence_stats(confidences: &[f64]) -> ConfidenceStats {
    if confidences.is_empty() {
        return ConfidenceStats::default();
    }
    let n = confidences.len() as f64;
    let mean = confidences.iter().sum::<f64>() / n;
    let mut sorted = confidences.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).expect("confidences are finite"));
    let median = if sorted.len() % 2 == 0 {
        (sorted[sorted.len() / 2 - 1] + sorted[sorted.len() / 2]) / 2.0
    } else {
        sorted[sorted.len() / 2]
    };
    let variance = confidences.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / n;
    ConfidenceStats {
        mean,
        median,
        min: sorted[0],
        max: sorted[sorted.len() - 1],
        std_dev: variance.sqrt(),
    }
}

fn quality_distribution(confidences: &[f64]) -> BTreeMap<String, usize> {
    let mut buckets: BTreeMap<String, usize> = [
        "excellent", "good", "acceptable", "poor", "very_poor",
    ]
    .iter()
    .map(|b| ((*b).to_owned(), 0))
    .collect();
    for &c in confidences {
        let bucket = if c >= 0.9 {
            "excellent"
        } else if c >= 0.8 {
            "good"
        } else if c >= 0.7 {
            "acceptable"
        } else if c >= 0.5 {
            "poor"
        } else {
            "very_poor"
        };
        *buckets.entry(bucket.to_owned()).or_default() += 1;
    }
    buckets
}

/// Terms recurring across error messages, stop words and short words
/// removed.
fn common_terms(descriptions: &[String], min_occurrences: usize) -> BTreeMap<String, usize> {
    const STOP_WORDS: &[&str] = &[
        "avec", "dans", "pour", "les", "des", "the", "for", "with", "and",
        "was", "has", "that", "this", "from", "after", "failed",
    ];
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for description in descriptions {
        for word in description.to_lowercase().split_whitespace() {
            let word: String = word.chars().filter(|c| c.is_alphanumeric()).collect();
            if word.len() <= 3 || STOP_WORDS.contains(&word.as_str()) {
                continue;
            }
            *counts.entry(word).or_default() += 1;
        }
    }
    counts.retain(|_, count| *count >= min_occurrences);
    counts
}

/// Rule-based recommendations from the aggregate numbers.
fn recommendations(report: &AuditReport, tasks: &[Task]) -> Vec<String> {
    let mut out = vec![];

    if tasks.len() < 5 {
        return vec![
            "increase the sample size for more reliable recommendations".to_owned(),
            "keep monitoring OCR quality metrics over a longer window".to_owned(),
        ];
    }

    if report.confidence.mean < 0.7 {
        out.push(format!(
            "mean confidence {:.2} is below the recommended 0.70; consider tuning \
             OCR parameters or switching the default engine",
            report.confidence.mean
        ));
    }

    if report.reprocessing_rate > 0.2 {
        out.push(format!(
            "reprocessing rate {:.0}% is high; investigate the recurring failure \
             causes before documents reach the retry path",
            report.reprocessing_rate * 100.0
        ));
    }

    // Engines that trend low get a targeted nudge. Pick the best-scoring
    // engine as the suggested replacement.
    let best_engine = report
        .engine_confidence
        .iter()
        .max_by(|a, b| a.1.partial_cmp(b.1).expect("confidences are finite"))
        .map(|(name, _)| name.clone());
    for (engine, mean) in &report.engine_confidence {
        if *mean < 0.6 {
            if let Some(best) = &best_engine {
                if best != engine {
                    out.push(format!(
                        "engine {engine} trends at {mean:.2} confidence across the \
                         sample; consider switching those documents to {best}"
                    ));
                }
            }
        }
    }

    let poor = report.quality_distribution.get("poor").copied().unwrap_or(0)
        + report
            .quality_distribution
            .get("very_poor")
            .copied()
            .unwrap_or(0);
    if poor * 10 > tasks.len() * 3 {
        out.push(format!(
            "{poor} of {} sampled documents are of poor quality; review capture \
             and preprocessing settings",
            tasks.len()
        ));
    }

    if report.error_histogram.get("timeout").copied().unwrap_or(0) * 10
        > tasks.len() * 2
    {
        out.push(
            "timeouts are frequent; consider smaller chunk sizes or a longer soft \
             deadline"
                .to_owned(),
        );
    }

    if out.len() < 2 {
        out.push("keep a regular watch on OCR quality metrics".to_owned());
    }
    out
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap as Map;

    use crate::task::{
        Attempt, AttemptParams, ErrorKind, OcrOptions, Priority, TaskError,
    };

    use super::*;

    fn terminal_task(
        dir: &Path,
        ext: &str,
        engine: &str,
        confidence: f64,
        attempts: usize,
    ) -> Task {
        let mut task = Task::new(
            dir.join(format!("{}.{ext}", Uuid::new_v4())),
            None,
            Priority::Normal,
            OcrOptions::default(),
            Map::new(),
        );
        for _ in 0..attempts {
            let mut attempt =
                Attempt::new(vec![engine.to_owned()], AttemptParams::default());
            attempt.success = true;
            attempt
                .confidence_scores
                .insert("text".to_owned(), confidence);
            task.attempts.push(attempt);
        }
        task.status = TaskStatus::Completed;
        task.completed_at = Some(Utc::now());
        task
    }

    async fn seeded_store(dir: &Path) -> TaskStore {
        let store = TaskStore::open(dir.join("store")).unwrap();
        for i in 0..6 {
            let confidence = 0.5 + 0.08 * i as f64;
            let attempts = if i % 3 == 0 { 2 } else { 1 };
            let engine = if i % 2 == 0 { "tesseract" } else { "pdftotext" };
            let mut task = terminal_task(dir, "pdf", engine, confidence, attempts);
            if i == 0 {
                task.record_error(TaskError::new(
                    ErrorKind::Timeout,
                    "chunk processing timed out waiting on engine",
                    true,
                ));
            }
            store.put_task(&task).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn random_sample_draws_from_terminal_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(dir.path()).await;
        let auditor = SamplingAuditor::new(store, 4);
        let sample = auditor
            .create_sample(SamplingStrategy::Random, None)
            .await
            .unwrap();
        assert_eq!(sample.task_ids.len(), 4);
    }

    #[tokio::test]
    async fn low_confidence_sampling_orders_ascending() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(dir.path()).await;
        let auditor = SamplingAuditor::new(store.clone(), 3);
        let sample = auditor
            .create_sample(SamplingStrategy::LowConfidence, Some(3))
            .await
            .unwrap();
        let mut last = 0.0;
        for id in &sample.task_ids {
            let task = store.get_task(id).await.unwrap().unwrap();
            let confidence = best_confidence(&task);
            assert!(confidence >= last);
            last = confidence;
        }
    }

    #[tokio::test]
    async fn analyze_computes_aggregates_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(dir.path()).await;
        let auditor = SamplingAuditor::new(store.clone(), 10);
        let sample = auditor
            .create_sample(SamplingStrategy::Recent, Some(10))
            .await
            .unwrap();
        let report = auditor.analyze(&sample).await.unwrap();

        assert_eq!(report.document_count, 6);
        assert!(report.confidence.mean > 0.5 && report.confidence.mean < 1.0);
        assert!(report.confidence.min <= report.confidence.median);
        assert!(report.confidence.median <= report.confidence.max);
        assert!(report.engine_confidence.contains_key("tesseract"));
        assert!(report.reprocessing_rate > 0.0);
        assert!(!report.recommendations.is_empty());

        // Persisted under validations/.
        let loaded: Option<AuditReport> = store
            .get_audit_record(AuditKind::Validation, &report.validation_id)
            .await
            .unwrap();
        assert!(loaded.is_some());
    }

    #[tokio::test]
    async fn small_samples_get_generic_recommendations() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(dir.path().join("store")).unwrap();
        let task = terminal_task(dir.path(), "pdf", "tesseract", 0.9, 1);
        store.put_task(&task).await.unwrap();

        let auditor = SamplingAuditor::new(store, 10);
        let sample = auditor
            .create_sample(SamplingStrategy::Random, None)
            .await
            .unwrap();
        let report = auditor.analyze(&sample).await.unwrap();
        assert!(report.recommendations[0].contains("sample size"));
    }

    #[test]
    fn stratified_sampling_spreads_across_types() {
        let dir = tempfile::tempdir().unwrap();
        let tasks = vec![
            terminal_task(dir.path(), "pdf", "tesseract", 0.8, 1),
            terminal_task(dir.path(), "pdf", "tesseract", 0.8, 1),
            terminal_task(dir.path(), "png", "tesseract", 0.8, 1),
            terminal_task(dir.path(), "png", "tesseract", 0.8, 1),
        ];
        let selected = stratify(tasks, 2);
        let kinds: std::collections::HashSet<String> = selected
            .iter()
            .map(|t| {
                t.document_path
                    .extension()
                    .unwrap()
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();
        assert_eq!(kinds.len(), 2);
    }

    #[test]
    fn common_terms_require_min_occurrences() {
        let descriptions = vec![
            "engine timeout while processing".to_owned(),
            "engine timeout again".to_owned(),
            "engine timeout persists".to_owned(),
            "one-off parsing oddity".to_owned(),
        ];
        let terms = common_terms(&descriptions, 3);
        assert_eq!(terms.get("timeout"), Some(&3));
        assert_eq!(terms.get("engine"), Some(&3));
        assert!(!terms.contains_key("oddity"));
    }
}
