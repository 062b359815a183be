//! Adaptive reprocessing of low-quality documents.
//!
//! A [`ReprocessingJob`] owns the attempts made at one document. The
//! strategy for attempt N+1 is derived from attempts 0..N and from the
//! issues that triggered reprocessing: switch engines after a
//! low-confidence text result, keep specialized processors across attempts,
//! and raise DPI with aggressive preprocessing after a failure. After
//! `max_attempts` the job settles on its best attempt or escalates to
//! manual validation.

use schemars::JsonSchema;
use uuid::Uuid;

use crate::{
    prelude::*,
    task::{Attempt, AttemptParams},
};

use super::detector::{ContentType, ValidationReport};

/// Default cap on processing attempts per job.
pub const DEFAULT_MAX_ATTEMPTS: usize = 3;

/// Attempts at or above this confidence stop the engine rotation.
const GOOD_ENOUGH_CONFIDENCE: f64 = 0.6;

/// Engine rotation order used when an attempt came back weak.
const ENGINE_ROTATION: &[&str] = &["tesseract", "docai", "pdftotext"];

/// Lifecycle of a reprocessing job.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, no attempt scheduled yet.
    Created,
    /// At least one attempt is running or scheduled.
    InProgress,
    /// Finished with a usable best attempt. Terminal.
    Completed,
    /// Finished without a usable attempt. Terminal.
    Failed,
    /// Finished, but a human must look at it. Terminal, non-success.
    ManualValidation,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::ManualValidation
        )
    }
}

/// The strategy chosen for one attempt.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct ReprocessStrategy {
    /// Engines to use, in preference order.
    pub engines: Vec<String>,

    /// Frozen parameters for the attempt.
    pub params: AttemptParams,
}

/// A reprocessing job: one document, several attempts, one verdict.
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct ReprocessingJob {
    pub job_id: String,

    /// The task whose output triggered reprocessing.
    pub task_id: String,

    pub document_path: PathBuf,

    /// The validation report that opened this job.
    pub issues: ValidationReport,

    /// Attempts made so far, oldest first. Append-only.
    pub attempts: Vec<Attempt>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    pub status: JobStatus,

    pub max_attempts: usize,
}

impl ReprocessingJob {
    /// Open a job for a document whose validation came back bad.
    pub fn new(task_id: String, document_path: PathBuf, issues: ValidationReport) -> Self {
        let now = Utc::now();
        Self {
            job_id: Uuid::new_v4().to_string(),
            task_id,
            document_path,
            issues,
            attempts: vec![],
            created_at: now,
            updated_at: now,
            status: JobStatus::Created,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// The successful attempt with the highest overall confidence.
    pub fn best_attempt(&self) -> Option<&Attempt> {
        self.attempts
            .iter()
            .filter(|a| a.success)
            .max_by(|a, b| {
                a.overall_confidence()
                    .partial_cmp(&b.overall_confidence())
                    .expect("confidences are finite")
            })
    }

    /// Append a finished attempt. Attempts are never rewritten.
    pub fn record_attempt(&mut self, attempt: Attempt) {
        self.attempts.push(attempt);
        self.status = JobStatus::InProgress;
        self.updated_at = Utc::now();
    }

    /// May another attempt be scheduled?
    pub fn can_retry(&self) -> bool {
        !self.status.is_terminal() && self.attempts.len() < self.max_attempts
    }

    /// Close the job: pick the best attempt or escalate.
    pub fn conclude(&mut self) -> JobStatus {
        let verdict = match self.best_attempt() {
            Some(best) if best.overall_confidence() >= GOOD_ENOUGH_CONFIDENCE => {
                JobStatus::Completed
            }
            _ if self.issues.requires_manual_review() => JobStatus::ManualValidation,
            Some(_) => JobStatus::Completed,
            None => JobStatus::Failed,
        };
        self.status = verdict;
        self.updated_at = Utc::now();
        verdict
    }
}

/// Derive the strategy for the next attempt from the job's history.
pub fn derive_strategy(job: &ReprocessingJob, available: &[String]) -> ReprocessStrategy {
    // Specialized processors follow the issue content types and are kept
    // across every attempt.
    let mut specialized = vec![];
    for content_type in [ContentType::Formula, ContentType::Schema, ContentType::Table] {
        if job
            .issues
            .issues
            .iter()
            .any(|i| i.content_type == content_type)
        {
            specialized.push(content_type.as_str().to_owned());
        }
    }

    let mut params = AttemptParams {
        specialized: specialized.clone(),
        ..AttemptParams::default()
    };

    let Some(last) = job.attempts.last() else {
        // First attempt under this job: pick an engine suited to the issue
        // profile. Heavy text damage goes straight to the strongest engine.
        let text_issues = job
            .issues
            .issues
            .iter()
            .filter(|i| i.content_type == ContentType::Text)
            .count();
        let critical_text = job
            .issues
            .issues
            .iter()
            .any(|i| i.content_type == ContentType::Text && i.is_critical());
        let engine = if critical_text && text_issues > 3 {
            pick_available(&["docai", "tesseract"], available)
        } else {
            pick_available(&["tesseract", "docai"], available)
        };
        return ReprocessStrategy {
            engines: vec![engine],
            params,
        };
    };

    if !last.success || last.overall_confidence() < GOOD_ENOUGH_CONFIDENCE {
        // Weak attempt: rotate to an engine we haven't just used, and turn
        // preprocessing up.
        let engine = next_engine(last, available);
        params.dpi = (last.params.dpi + 150).min(600);
        params.aggressive_preprocessing = true;
        ReprocessStrategy {
            engines: vec![engine],
            params,
        }
    } else {
        // Close to good: keep the engines, refine the parameters.
        params.dpi = (last.params.dpi + 150).min(600);
        params.aggressive_preprocessing = last.params.aggressive_preprocessing;
        params.language = last.params.language.clone();
        ReprocessStrategy {
            engines: last.engines_used.clone(),
            params,
        }
    }
}

/// The next engine in the rotation that is available and differs from the
/// last attempt's engine.
fn next_engine(last: &Attempt, available: &[String]) -> String {
    let last_engine = last.engines_used.first().map(String::as_str).unwrap_or("");
    let position = ENGINE_ROTATION.iter().position(|e| *e == last_engine);
    let start = position.map(|p| p + 1).unwrap_or(0);
    for offset in 0..ENGINE_ROTATION.len() {
        let candidate = ENGINE_ROTATION[(start + offset) % ENGINE_ROTATION.len()];
        if candidate != last_engine && available.iter().any(|a| a == candidate) {
            return candidate.to_owned();
        }
    }
    // Nothing else is available; stay on the same engine.
    last_engine.to_owned()
}

/// First preference that is actually available, falling back to the first
/// available engine of all.
fn pick_available(preferences: &[&str], available: &[String]) -> String {
    preferences
        .iter()
        .find(|p| available.iter().any(|a| a == **p))
        .map(|p| (*p).to_owned())
        .or_else(|| available.first().cloned())
        .unwrap_or_else(|| "tesseract".to_owned())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use crate::validation::detector::{ContentIssue, IssueSeverity};

    use super::*;

    fn report_with(issues: Vec<ContentIssue>, global: f64) -> ValidationReport {
        ValidationReport {
            document_id: "doc-1".to_owned(),
            issues,
            global_confidence: global,
            validated_at: Utc::now(),
        }
    }

    fn text_issue(severity: IssueSeverity) -> ContentIssue {
        ContentIssue {
            issue_type: "low_text_confidence".to_owned(),
            content_type: ContentType::Text,
            page: None,
            confidence: 0.2,
            severity,
            description: "low confidence".to_owned(),
            content_sample: String::new(),
            suggested_actions: vec![],
        }
    }

    fn formula_issue() -> ContentIssue {
        ContentIssue {
            issue_type: "low_formula_confidence".to_owned(),
            content_type: ContentType::Formula,
            page: Some(1),
            confidence: 0.3,
            severity: IssueSeverity::Critical,
            description: "bad formula".to_owned(),
            content_sample: String::new(),
            suggested_actions: vec![],
        }
    }

    fn job_with(issues: Vec<ContentIssue>, global: f64) -> ReprocessingJob {
        ReprocessingJob::new(
            "task-1".to_owned(),
            PathBuf::from("/tmp/doc.pdf"),
            report_with(issues, global),
        )
    }

    fn finished_attempt(engine: &str, confidence: f64, success: bool) -> Attempt {
        let mut attempt =
            Attempt::new(vec![engine.to_owned()], AttemptParams::default());
        attempt.success = success;
        attempt.confidence_scores =
            BTreeMap::from([("text".to_owned(), confidence)]);
        attempt
    }

    fn engines() -> Vec<String> {
        vec!["tesseract".to_owned(), "pdftotext".to_owned(), "docai".to_owned()]
    }

    #[test]
    fn first_attempt_uses_the_default_engine() {
        let job = job_with(vec![text_issue(IssueSeverity::Severe)], 0.4);
        let strategy = derive_strategy(&job, &engines());
        assert_eq!(strategy.engines, vec!["tesseract"]);
        assert_eq!(strategy.params.dpi, 300);
        assert!(!strategy.params.aggressive_preprocessing);
    }

    #[test]
    fn heavy_critical_text_damage_goes_to_the_strongest_engine() {
        let issues = vec![
            text_issue(IssueSeverity::Critical),
            text_issue(IssueSeverity::Critical),
            text_issue(IssueSeverity::Severe),
            text_issue(IssueSeverity::Severe),
        ];
        let job = job_with(issues, 0.3);
        let strategy = derive_strategy(&job, &engines());
        assert_eq!(strategy.engines, vec!["docai"]);
    }

    #[test]
    fn specialized_processors_are_preserved() {
        let mut job = job_with(vec![formula_issue()], 0.4);
        let strategy = derive_strategy(&job, &engines());
        assert_eq!(strategy.params.specialized, vec!["formula"]);

        // Still present on the second attempt.
        job.record_attempt(finished_attempt("tesseract", 0.4, true));
        let strategy = derive_strategy(&job, &engines());
        assert_eq!(strategy.params.specialized, vec!["formula"]);
    }

    #[test]
    fn weak_attempt_switches_engine_and_raises_dpi() {
        let mut job = job_with(vec![text_issue(IssueSeverity::Severe)], 0.4);
        job.record_attempt(finished_attempt("tesseract", 0.42, true));

        let strategy = derive_strategy(&job, &engines());
        assert_ne!(strategy.engines, vec!["tesseract"]);
        assert_eq!(strategy.params.dpi, 450);
        assert!(strategy.params.aggressive_preprocessing);
    }

    #[test]
    fn decent_attempt_keeps_the_engine_and_refines() {
        let mut job = job_with(vec![text_issue(IssueSeverity::Minor)], 0.65);
        job.record_attempt(finished_attempt("tesseract", 0.72, true));

        let strategy = derive_strategy(&job, &engines());
        assert_eq!(strategy.engines, vec!["tesseract"]);
        assert_eq!(strategy.params.dpi, 450);
    }

    #[test]
    fn dpi_is_capped() {
        let mut job = job_with(vec![text_issue(IssueSeverity::Severe)], 0.4);
        let mut attempt = finished_attempt("tesseract", 0.3, false);
        attempt.params.dpi = 600;
        job.record_attempt(attempt);

        let strategy = derive_strategy(&job, &engines());
        assert_eq!(strategy.params.dpi, 600);
    }

    #[test]
    fn best_attempt_is_the_highest_confidence_success() {
        let mut job = job_with(vec![text_issue(IssueSeverity::Severe)], 0.4);
        job.record_attempt(finished_attempt("tesseract", 0.42, true));
        job.record_attempt(finished_attempt("docai", 0.88, true));
        job.record_attempt(finished_attempt("pdftotext", 0.6, false));

        let best = job.best_attempt().unwrap();
        assert_eq!(best.engines_used, vec!["docai"]);
        assert_eq!(job.conclude(), JobStatus::Completed);
    }

    #[test]
    fn attempts_stop_at_the_cap() {
        let mut job = job_with(vec![text_issue(IssueSeverity::Severe)], 0.4);
        assert!(job.can_retry());
        for _ in 0..DEFAULT_MAX_ATTEMPTS {
            job.record_attempt(finished_attempt("tesseract", 0.4, true));
        }
        assert!(!job.can_retry());
    }

    #[test]
    fn manual_validation_when_mandated_and_no_good_attempt() {
        let mut job = job_with(vec![formula_issue()], 0.2);
        job.record_attempt(finished_attempt("tesseract", 0.3, false));
        job.record_attempt(finished_attempt("docai", 0.35, false));
        assert_eq!(job.conclude(), JobStatus::ManualValidation);
        assert!(job.status.is_terminal());
    }

    #[test]
    fn failure_without_manual_review_mandate() {
        let mut job = job_with(vec![text_issue(IssueSeverity::Severe)], 0.55);
        job.record_attempt(finished_attempt("tesseract", 0.3, false));
        assert_eq!(job.conclude(), JobStatus::Failed);
    }
}
