//! Low-confidence content detection.
//!
//! Given a processing result, emit [`ContentIssue`]s for anything that looks
//! wrong: scores under the per-content-type thresholds, OCR garbage
//! patterns, suspicious word shapes, empty table cells. The resulting
//! [`ValidationReport`] decides whether the document needs reprocessing or
//! human eyes.

use std::{collections::BTreeMap, sync::LazyLock};

use regex::Regex;
use schemars::JsonSchema;

use crate::prelude::*;

/// Per-content-type confidence thresholds.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct Thresholds {
    pub acceptable: f64,
    pub warning: f64,
    pub critical: f64,
}

/// The content categories we score.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, JsonSchema, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Text,
    Formula,
    Schema,
    Table,
}

impl ContentType {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentType::Text => "text",
            ContentType::Formula => "formula",
            ContentType::Schema => "schema",
            ContentType::Table => "table",
        }
    }
}

/// The default threshold table.
pub fn default_thresholds() -> BTreeMap<ContentType, Thresholds> {
    BTreeMap::from([
        (
            ContentType::Text,
            Thresholds {
                acceptable: 0.70,
                warning: 0.50,
                critical: 0.30,
            },
        ),
        (
            ContentType::Formula,
            Thresholds {
                acceptable: 0.75,
                warning: 0.60,
                critical: 0.40,
            },
        ),
        (
            ContentType::Schema,
            Thresholds {
                acceptable: 0.65,
                warning: 0.50,
                critical: 0.35,
            },
        ),
        (
            ContentType::Table,
            Thresholds {
                acceptable: 0.70,
                warning: 0.55,
                critical: 0.40,
            },
        ),
    ])
}

/// How bad an issue is, measured against its content type's thresholds.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, JsonSchema, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    /// Below `acceptable` but above `warning`.
    Minor,
    /// Below `warning`.
    Severe,
    /// Below `critical`.
    Critical,
}

/// A detected quality defect.
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct ContentIssue {
    /// Machine-readable issue kind, e.g. `low_text_confidence`.
    pub issue_type: String,

    /// The content category the issue concerns.
    pub content_type: ContentType,

    /// The page, when the issue is page-scoped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<usize>,

    /// The confidence that triggered the issue.
    pub confidence: f64,

    /// Severity against the content type's thresholds.
    pub severity: IssueSeverity,

    /// Human-readable description.
    pub description: String,

    /// A short excerpt of the offending content.
    #[serde(default)]
    pub content_sample: String,

    /// Suggested remediations.
    #[serde(default)]
    pub suggested_actions: Vec<String>,
}

impl ContentIssue {
    pub fn is_critical(&self) -> bool {
        self.severity == IssueSeverity::Critical
    }

    pub fn is_severe(&self) -> bool {
        self.severity >= IssueSeverity::Severe
    }
}

/// The validation verdict for one document.
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct ValidationReport {
    /// The task or document this report concerns.
    pub document_id: String,

    /// All detected issues.
    pub issues: Vec<ContentIssue>,

    /// Overall confidence across metrics.
    pub global_confidence: f64,

    /// When the validation ran.
    pub validated_at: DateTime<Utc>,
}

impl ValidationReport {
    pub fn has_critical_issues(&self) -> bool {
        self.issues.iter().any(|i| i.is_critical())
    }

    /// Does the document need another processing pass? True on any critical
    /// issue, three or more severe issues, or low global confidence.
    pub fn requires_reprocessing(&self) -> bool {
        let critical = self.issues.iter().filter(|i| i.is_critical()).count();
        let severe = self
            .issues
            .iter()
            .filter(|i| i.is_severe() && !i.is_critical())
            .count();
        critical > 0 || severe >= 3 || self.global_confidence < 0.5
    }

    /// Does the document need a human? True on a critical formula or schema
    /// issue, or very low global confidence.
    pub fn requires_manual_review(&self) -> bool {
        let critical_special = self.issues.iter().any(|i| {
            i.is_critical()
                && matches!(i.content_type, ContentType::Formula | ContentType::Schema)
        });
        critical_special || self.global_confidence < 0.3
    }
}

/// A specialized region (formula, schema, table) found by processing.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, Serialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct DetectedRegion {
    /// The page holding the region.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<usize>,

    /// Recognition confidence for the region.
    pub confidence: f64,

    /// A short excerpt of the recognized content.
    #[serde(default)]
    pub content_sample: String,

    /// For tables: the share of cells that came back empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub empty_cell_ratio: Option<f64>,
}

/// The processing output the detector scores.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct ProcessingSummary {
    pub document_id: String,
    pub text: String,
    /// Per-metric confidence scores from the processing pass.
    #[serde(default)]
    pub confidence_scores: BTreeMap<String, f64>,
    /// Per-page text confidences, when available.
    #[serde(default)]
    pub page_confidences: Vec<(usize, f64)>,
    #[serde(default)]
    pub formulas: Vec<DetectedRegion>,
    #[serde(default)]
    pub schemas: Vec<DetectedRegion>,
    #[serde(default)]
    pub tables: Vec<DetectedRegion>,
}

static NON_LATIN_RUN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[^\x00-\x7FÀ-ÿ]{3,}").expect("static regex")
});
static CHARACTER_SALAD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"[^\s\w.,;:!?()\[\]{}"'-]{4,}"#).expect("static regex")
});
static REPEATED_PUNCTUATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[.,;:!?]{3,}").expect("static regex"));
static WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\w+\b").expect("static regex"));

/// Detects low-confidence content in processing results.
pub struct LowConfidenceDetector {
    thresholds: BTreeMap<ContentType, Thresholds>,
}

impl Default for LowConfidenceDetector {
    fn default() -> Self {
        Self::new(default_thresholds())
    }
}

impl LowConfidenceDetector {
    pub fn new(thresholds: BTreeMap<ContentType, Thresholds>) -> Self {
        Self { thresholds }
    }

    fn thresholds_for(&self, content_type: ContentType) -> Thresholds {
        self.thresholds
            .get(&content_type)
            .copied()
            .unwrap_or(Thresholds {
                acceptable: 0.7,
                warning: 0.5,
                critical: 0.3,
            })
    }

    /// Severity of a confidence score for a content type, if it is below
    /// the acceptable bar at all.
    fn severity(&self, content_type: ContentType, confidence: f64) -> Option<IssueSeverity> {
        let t = self.thresholds_for(content_type);
        if confidence < t.critical {
            Some(IssueSeverity::Critical)
        } else if confidence < t.warning {
            Some(IssueSeverity::Severe)
        } else if confidence < t.acceptable {
            Some(IssueSeverity::Minor)
        } else {
            None
        }
    }

    /// Analyze one processing result.
    #[instrument(level = "debug", skip_all, fields(document_id = %summary.document_id))]
    pub fn analyze(&self, summary: &ProcessingSummary) -> ValidationReport {
        let mut issues = vec![];

        // Global and per-page text confidence.
        let text_confidence = summary
            .confidence_scores
            .get("text")
            .copied()
            .unwrap_or_else(|| estimate_text_confidence(&summary.text));
        if let Some(severity) = self.severity(ContentType::Text, text_confidence) {
            issues.push(ContentIssue {
                issue_type: "low_text_confidence".to_owned(),
                content_type: ContentType::Text,
                page: None,
                confidence: text_confidence,
                severity,
                description: format!(
                    "global text confidence {text_confidence:.2} is below the acceptable threshold"
                ),
                content_sample: excerpt(&summary.text, 200),
                suggested_actions: vec![
                    "rerun OCR with a different engine".to_owned(),
                    "increase rasterization DPI".to_owned(),
                ],
            });
        }
        for &(page, confidence) in &summary.page_confidences {
            if let Some(severity) = self.severity(ContentType::Text, confidence) {
                if severity >= IssueSeverity::Severe {
                    issues.push(ContentIssue {
                        issue_type: "low_page_confidence".to_owned(),
                        content_type: ContentType::Text,
                        page: Some(page),
                        confidence,
                        severity,
                        description: format!(
                            "page {page} text confidence {confidence:.2} is low"
                        ),
                        content_sample: String::new(),
                        suggested_actions: vec![
                            "reprocess this page with aggressive preprocessing".to_owned(),
                        ],
                    });
                }
            }
        }

        // Specialized regions.
        self.check_regions(
            &summary.formulas,
            ContentType::Formula,
            "low_formula_confidence",
            &mut issues,
        );
        self.check_regions(
            &summary.schemas,
            ContentType::Schema,
            "low_schema_confidence",
            &mut issues,
        );
        self.check_regions(
            &summary.tables,
            ContentType::Table,
            "low_table_confidence",
            &mut issues,
        );
        for table in &summary.tables {
            if let Some(ratio) = table.empty_cell_ratio {
                if ratio > 0.5 {
                    issues.push(ContentIssue {
                        issue_type: "empty_table_cells".to_owned(),
                        content_type: ContentType::Table,
                        page: table.page,
                        confidence: 1.0 - ratio,
                        severity: IssueSeverity::Severe,
                        description: format!(
                            "{:.0}% of table cells came back empty",
                            ratio * 100.0
                        ),
                        content_sample: table.content_sample.clone(),
                        suggested_actions: vec![
                            "re-extract the table with structure preservation".to_owned(),
                        ],
                    });
                }
            }
        }

        // Text-shape heuristics.
        self.check_text_patterns(&summary.text, &mut issues);
        self.check_text_heuristics(&summary.text, &mut issues);

        let global_confidence = if summary.confidence_scores.is_empty() {
            text_confidence
        } else {
            summary.confidence_scores.values().sum::<f64>()
                / summary.confidence_scores.len() as f64
        };

        ValidationReport {
            document_id: summary.document_id.clone(),
            issues,
            global_confidence,
            validated_at: Utc::now(),
        }
    }

    fn check_regions(
        &self,
        regions: &[DetectedRegion],
        content_type: ContentType,
        issue_type: &str,
        issues: &mut Vec<ContentIssue>,
    ) {
        for region in regions {
            if let Some(severity) = self.severity(content_type, region.confidence) {
                issues.push(ContentIssue {
                    issue_type: issue_type.to_owned(),
                    content_type,
                    page: region.page,
                    confidence: region.confidence,
                    severity,
                    description: format!(
                        "{} recognition confidence {:.2} is below the acceptable threshold",
                        content_type.as_str(),
                        region.confidence
                    ),
                    content_sample: region.content_sample.clone(),
                    suggested_actions: vec![format!(
                        "route the {} region to a specialized processor",
                        content_type.as_str()
                    )],
                });
            }
        }
    }

    /// Regex patterns that betray OCR garbage. At most five issues per
    /// pattern so a thoroughly broken page doesn't flood the report.
    fn check_text_patterns(&self, text: &str, issues: &mut Vec<ContentIssue>) {
        if text.is_empty() {
            return;
        }
        let patterns: [(&Regex, &str); 3] = [
            (&NON_LATIN_RUN, "non_latin_run"),
            (&CHARACTER_SALAD, "character_salad"),
            (&REPEATED_PUNCTUATION, "repeated_punctuation"),
        ];
        for (pattern, name) in patterns {
            for m in pattern.find_iter(text).take(5) {
                issues.push(ContentIssue {
                    issue_type: name.to_owned(),
                    content_type: ContentType::Text,
                    page: None,
                    confidence: 0.4,
                    severity: IssueSeverity::Severe,
                    description: format!("suspicious text pattern: {name}"),
                    content_sample: bracket_match(text, m.start(), m.end()),
                    suggested_actions: vec![
                        "check this passage manually".to_owned(),
                        "rerun OCR with a different engine".to_owned(),
                    ],
                });
            }
        }
    }

    /// Statistical text heuristics: non-alphanumeric ratio and word length.
    fn check_text_heuristics(&self, text: &str, issues: &mut Vec<ContentIssue>) {
        if text.is_empty() {
            return;
        }

        let total = text.chars().count();
        let non_alnum = text
            .chars()
            .filter(|c| !(c.is_alphanumeric() || c.is_whitespace()))
            .count();
        let ratio = non_alnum as f64 / total.max(1) as f64;
        if ratio > 0.3 {
            issues.push(ContentIssue {
                issue_type: "high_non_alnum_ratio".to_owned(),
                content_type: ContentType::Text,
                page: None,
                confidence: 0.5,
                severity: IssueSeverity::Severe,
                description: format!(
                    "{:.0}% of characters are neither alphanumeric nor whitespace",
                    ratio * 100.0
                ),
                content_sample: excerpt(text, 200),
                suggested_actions: vec!["rerun OCR with a different engine".to_owned()],
            });
        }

        let words: Vec<&str> = text.split_whitespace().collect();
        if !words.is_empty() {
            let avg_len =
                words.iter().map(|w| w.len()).sum::<usize>() as f64 / words.len() as f64;
            if avg_len > 12.0 {
                let long_words: Vec<&str> =
                    words.iter().filter(|w| w.len() > 15).take(5).copied().collect();
                issues.push(ContentIssue {
                    issue_type: "words_too_long".to_owned(),
                    content_type: ContentType::Text,
                    page: None,
                    confidence: 0.5,
                    severity: IssueSeverity::Severe,
                    description: format!(
                        "average word length {avg_len:.1} suggests missing spaces"
                    ),
                    content_sample: long_words.join(", "),
                    suggested_actions: vec![
                        "rerun OCR with adjusted page segmentation".to_owned(),
                    ],
                });
            }
        }
    }
}

/// Heuristic confidence score for extracted text, in `[0, 1]`.
///
/// Used when the engine reports no confidence of its own. Penalizes the
/// signals the detector also looks for: non-alphanumeric noise, glued
/// words, suspicious character runs.
pub fn estimate_text_confidence(text: &str) -> f64 {
    if text.trim().is_empty() {
        return 0.0;
    }

    let total = text.chars().count() as f64;
    let non_alnum = text
        .chars()
        .filter(|c| !(c.is_alphanumeric() || c.is_whitespace()))
        .count() as f64;
    let noise_ratio = non_alnum / total;

    let words: Vec<&str> = WORD.find_iter(text).map(|m| m.as_str()).collect();
    let avg_word_len = if words.is_empty() {
        20.0
    } else {
        words.iter().map(|w| w.len()).sum::<usize>() as f64 / words.len() as f64
    };

    let salad_hits = CHARACTER_SALAD.find_iter(text).count() as f64;
    let salad_ratio = (salad_hits * 10.0 / total).min(1.0);

    let mut score: f64 = 1.0;
    score -= (noise_ratio * 1.5).min(0.5);
    if avg_word_len > 12.0 {
        score -= ((avg_word_len - 12.0) / 10.0).min(0.3);
    }
    if avg_word_len < 2.0 {
        score -= 0.2;
    }
    score -= (salad_ratio * 0.5).min(0.3);
    score.clamp(0.0, 1.0)
}

/// The first `limit` characters of `text`, with an ellipsis when truncated.
fn excerpt(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_owned();
    }
    let cut: String = text.chars().take(limit).collect();
    format!("{cut}...")
}

/// Surround a match with brackets plus 20 characters of context each side.
fn bracket_match(text: &str, start: usize, end: usize) -> String {
    let mut lo = start.saturating_sub(20);
    while lo > 0 && !text.is_char_boundary(lo) {
        lo -= 1;
    }
    let mut hi = (end + 20).min(text.len());
    while hi < text.len() && !text.is_char_boundary(hi) {
        hi += 1;
    }
    format!(
        "{}[{}]{}",
        &text[lo..start],
        &text[start..end],
        &text[end..hi]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(text: &str, text_confidence: f64) -> ProcessingSummary {
        ProcessingSummary {
            document_id: "doc-1".to_owned(),
            text: text.to_owned(),
            confidence_scores: BTreeMap::from([("text".to_owned(), text_confidence)]),
            ..ProcessingSummary::default()
        }
    }

    #[test]
    fn clean_text_with_good_confidence_has_no_issues() {
        let detector = LowConfidenceDetector::default();
        let report = detector.analyze(&summary(
            "Une procédure de maintenance parfaitement lisible.",
            0.92,
        ));
        assert!(report.issues.is_empty());
        assert!(!report.requires_reprocessing());
        assert!(!report.requires_manual_review());
    }

    #[test]
    fn low_text_confidence_is_flagged_with_the_right_severity() {
        let detector = LowConfidenceDetector::default();

        let report = detector.analyze(&summary("readable", 0.65));
        assert_eq!(report.issues[0].severity, IssueSeverity::Minor);

        let report = detector.analyze(&summary("readable", 0.45));
        assert_eq!(report.issues[0].severity, IssueSeverity::Severe);

        let report = detector.analyze(&summary("readable", 0.25));
        assert_eq!(report.issues[0].severity, IssueSeverity::Critical);
        assert!(report.requires_reprocessing());
    }

    #[test]
    fn formula_thresholds_are_stricter_than_text() {
        let detector = LowConfidenceDetector::default();
        let mut s = summary("fine text", 0.9);
        s.formulas.push(DetectedRegion {
            page: Some(2),
            confidence: 0.72,
            content_sample: "∫ f(x) dx".to_owned(),
            empty_cell_ratio: None,
        });
        let report = detector.analyze(&s);
        // 0.72 passes the text table but fails the formula table.
        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.issues[0].content_type, ContentType::Formula);
        assert_eq!(report.issues[0].page, Some(2));
    }

    #[test]
    fn critical_formula_issue_mandates_manual_review() {
        let detector = LowConfidenceDetector::default();
        let mut s = summary("fine text", 0.9);
        s.formulas.push(DetectedRegion {
            page: Some(1),
            confidence: 0.2,
            ..DetectedRegion::default()
        });
        let report = detector.analyze(&s);
        assert!(report.requires_reprocessing());
        assert!(report.requires_manual_review());
    }

    #[test]
    fn three_severe_issues_trigger_reprocessing() {
        let detector = LowConfidenceDetector::default();
        let mut s = summary("fine text", 0.9);
        for page in 0..3 {
            s.page_confidences.push((page, 0.45));
        }
        let report = detector.analyze(&s);
        assert!(report.requires_reprocessing());
        assert!(!report.requires_manual_review());
    }

    #[test]
    fn garbage_patterns_are_detected() {
        let detector = LowConfidenceDetector::default();
        let text = "normal start ####@@@@#### then punctuation!!!!! everywhere";
        let report = detector.analyze(&summary(text, 0.9));
        let kinds: Vec<&str> = report.issues.iter().map(|i| i.issue_type.as_str()).collect();
        assert!(kinds.contains(&"character_salad"));
        assert!(kinds.contains(&"repeated_punctuation"));
        // The sample brackets the offending run.
        let salad = report
            .issues
            .iter()
            .find(|i| i.issue_type == "character_salad")
            .unwrap();
        assert!(salad.content_sample.contains('['));
    }

    #[test]
    fn empty_table_cells_are_flagged() {
        let detector = LowConfidenceDetector::default();
        let mut s = summary("fine", 0.9);
        s.tables.push(DetectedRegion {
            page: Some(4),
            confidence: 0.8,
            content_sample: String::new(),
            empty_cell_ratio: Some(0.7),
        });
        let report = detector.analyze(&s);
        assert!(report.issues.iter().any(|i| i.issue_type == "empty_table_cells"));
    }

    #[test]
    fn glued_words_are_flagged() {
        let detector = LowConfidenceDetector::default();
        let text = "thequickbrownfoxjumpsoverthelazydog andthistoolongwordkeepsgoingforever stillmorecharacterswithoutanyspaces";
        let report = detector.analyze(&summary(text, 0.9));
        assert!(report.issues.iter().any(|i| i.issue_type == "words_too_long"));
    }

    #[test]
    fn confidence_estimate_orders_clean_above_garbage() {
        let clean = estimate_text_confidence(
            "A perfectly ordinary paragraph describing pump maintenance steps.",
        );
        let noisy = estimate_text_confidence("#@$% &*()! ~~\u{fffd}\u{fffd}@@ ##$$ ^^&&");
        assert!(clean > 0.8, "clean text scored {clean}");
        assert!(noisy < 0.5, "noisy text scored {noisy}");
        assert_eq!(estimate_text_confidence("   "), 0.0);
    }
}
