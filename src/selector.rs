//! Engine selection from document metrics.
//!
//! The selector measures a document (page count, text/image density, image
//! quality), derives a complexity tag, and turns that into an ordered engine
//! preference list plus per-engine cost estimates. Classification and
//! selection are pure functions over [`DocumentMetrics`]; only the metric
//! extraction itself touches the filesystem.

use std::{collections::BTreeMap, fs};

use image::GenericImageView;
use schemars::JsonSchema;
use tokio::process::Command;

use crate::{
    async_utils::{check_for_command_failure, spawn_blocking_propagating_panics},
    cpu_limit::with_cpu_semaphore,
    pages::detect_mime,
    prelude::*,
    task::StrategyPreference,
};

/// Luma standard deviation below which a scan counts as low-contrast.
const CONTRAST_THRESHOLD: f64 = 30.0;

/// Laplacian standard deviation below which an image counts as blurry.
const SHARPNESS_THRESHOLD: f64 = 5.0;

/// Edge-pixel ratio above which an image counts as a technical drawing.
const EDGE_DENSITY_THRESHOLD: f64 = 0.1;

/// Complexity classification of a document for OCR purposes.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    /// Mostly text, few images.
    Simple,
    /// Mixed text and images.
    Medium,
    /// Complex layout, absent text layer, tables.
    Complex,
    /// Schemas, drawings, special symbols.
    Technical,
    /// Contains handwriting.
    Handwritten,
    /// Low quality scan: low contrast or blurry.
    Damaged,
}

impl Complexity {
    /// One step up in difficulty, used when table-like content is detected.
    pub fn bumped(self) -> Complexity {
        match self {
            Complexity::Simple => Complexity::Medium,
            Complexity::Medium => Complexity::Complex,
            other => other,
        }
    }

    /// Relative processing cost multiplier.
    fn cost_factor(self) -> f64 {
        match self {
            Complexity::Simple => 1.0,
            Complexity::Medium => 1.5,
            Complexity::Complex => 2.5,
            Complexity::Technical => 3.0,
            Complexity::Handwritten => 4.0,
            Complexity::Damaged => 3.5,
        }
    }

    /// Ordered engine preference for this complexity, best first.
    ///
    /// The names include cloud engines that may not be registered locally;
    /// selection filters against the available set.
    fn preferred_engines(self) -> &'static [&'static str] {
        match self {
            Complexity::Simple => &["pdftotext", "tesseract", "docai"],
            Complexity::Medium => &["tesseract", "docai", "pdftotext"],
            Complexity::Complex => &["docai", "tesseract", "pdftotext"],
            Complexity::Technical => &["docai", "tesseract"],
            Complexity::Handwritten => &["docai"],
            Complexity::Damaged => &["docai", "tesseract"],
        }
    }
}

/// Per-engine base seconds per page, used by the cost model.
fn engine_base_cost(name: &str) -> Option<f64> {
    match name {
        "pdftotext" => Some(0.5),
        "tesseract" => Some(3.0),
        "docai" => Some(2.0),
        "echo" => Some(0.1),
        _ => None,
    }
}

/// Everything we measured about a document.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct DocumentMetrics {
    pub file_path: PathBuf,
    pub file_size: u64,
    pub mime_type: String,
    pub page_count: usize,
    pub has_text: bool,
    /// Characters per square point of page area.
    pub text_density: f64,
    pub image_count: usize,
    /// Embedded image area relative to page area.
    pub image_density: f64,
    /// Luma standard deviation (images only).
    pub contrast: Option<f64>,
    /// Laplacian standard deviation (images only).
    pub sharpness: Option<f64>,
    /// Edge-pixel ratio (images only).
    pub edge_density: Option<f64>,
    /// Did the text look like it contains tables?
    pub table_like: bool,
    /// Pixel resolution (images only).
    pub resolution: Option<(u32, u32)>,
}

/// The selector's verdict for a document.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct EngineSelection {
    /// False when the document is plain text and needs no OCR at all.
    pub needs_ocr: bool,

    /// The derived complexity tag.
    pub complexity: Complexity,

    /// Ordered preference list, filtered to available engines.
    pub engines: Vec<String>,

    /// Estimated seconds of processing per available engine.
    pub estimated_cost: BTreeMap<String, f64>,
}

/// Classify a document's complexity from its metrics.
pub fn classify(metrics: &DocumentMetrics) -> Complexity {
    let base = if metrics.mime_type.starts_with("image/") {
        let contrast = metrics.contrast.unwrap_or(f64::MAX);
        let sharpness = metrics.sharpness.unwrap_or(f64::MAX);
        let edge_density = metrics.edge_density.unwrap_or(0.0);
        if contrast < CONTRAST_THRESHOLD || sharpness < SHARPNESS_THRESHOLD {
            Complexity::Damaged
        } else if edge_density > EDGE_DENSITY_THRESHOLD {
            Complexity::Technical
        } else {
            Complexity::Medium
        }
    } else if !metrics.has_text && metrics.image_count > 0 {
        Complexity::Complex
    } else if metrics.text_density > 0.01 && metrics.image_density < 0.1 {
        Complexity::Simple
    } else if metrics.image_density > 0.5 {
        Complexity::Technical
    } else {
        Complexity::Medium
    };

    if metrics.table_like { base.bumped() } else { base }
}

/// Estimate per-engine processing cost in seconds.
pub fn estimate_costs(
    metrics: &DocumentMetrics,
    complexity: Complexity,
    available: &[String],
) -> BTreeMap<String, f64> {
    let size_mb = metrics.file_size as f64 / (1024.0 * 1024.0);
    let size_factor = (0.5 * size_mb / 10.0).max(1.0);
    let pages = metrics.page_count.max(1) as f64;

    available
        .iter()
        .filter_map(|name| {
            let base = engine_base_cost(name)?;
            let estimate = base * pages * complexity.cost_factor() + size_factor;
            Some((name.clone(), (estimate * 100.0).round() / 100.0))
        })
        .collect()
}

/// Pick engines for a document. Pure function over the metrics.
pub fn select_engines(
    metrics: &DocumentMetrics,
    available: &[String],
    preference: Option<StrategyPreference>,
) -> EngineSelection {
    let complexity = classify(metrics);
    let estimated_cost = estimate_costs(metrics, complexity, available);

    if metrics.mime_type == "text/plain" {
        return EngineSelection {
            needs_ocr: false,
            complexity,
            engines: vec![],
            estimated_cost,
        };
    }

    let mut engines: Vec<String> = complexity
        .preferred_engines()
        .iter()
        .filter(|name| available.iter().any(|a| a == *name))
        .map(|name| (*name).to_owned())
        .collect();
    if engines.is_empty() {
        // None of the preferred engines exist here; fall back to whatever
        // the registry offers.
        engines = available.to_vec();
    }

    if preference == Some(StrategyPreference::Speed) {
        engines.sort_by(|a, b| {
            let ca = estimated_cost.get(a).copied().unwrap_or(f64::INFINITY);
            let cb = estimated_cost.get(b).copied().unwrap_or(f64::INFINITY);
            ca.partial_cmp(&cb).expect("costs are finite")
        });
    }

    EngineSelection {
        needs_ocr: true,
        complexity,
        engines,
        estimated_cost,
    }
}

/// Measure a document.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub async fn analyze_document(path: &Path) -> Result<DocumentMetrics> {
    let file_size = fs::metadata(path)
        .with_context(|| format!("failed to stat {:?}", path))?
        .len();
    let mime_type = detect_mime(path);

    let mut metrics = DocumentMetrics {
        file_path: path.to_owned(),
        file_size,
        mime_type: mime_type.clone(),
        page_count: 0,
        has_text: false,
        text_density: 0.0,
        image_count: 0,
        image_density: 0.0,
        contrast: None,
        sharpness: None,
        edge_density: None,
        table_like: false,
        resolution: None,
    };

    if mime_type == "application/pdf" {
        analyze_pdf(path, &mut metrics).await?;
    } else if mime_type.starts_with("image/") {
        analyze_image(path, &mut metrics).await?;
    } else if mime_type == "text/plain" {
        let text = fs::read_to_string(path).unwrap_or_default();
        metrics.page_count = if text.is_empty() { 0 } else { 1 };
        metrics.has_text = !text.is_empty();
        metrics.text_density = 1.0;
        metrics.table_like = looks_like_table(&text);
    } else {
        metrics.page_count = 1;
    }

    Ok(metrics)
}

/// PDF analysis via Poppler: page count and size from `pdfinfo`, text volume
/// from `pdftotext`, embedded images from `pdfimages -list`.
async fn analyze_pdf(path: &Path, metrics: &mut DocumentMetrics) -> Result<()> {
    let info = run_tool("pdfinfo", &[path.as_os_str().to_owned()]).await?;
    let mut page_area_pts = 0.0;
    for line in info.lines() {
        if let Some(rest) = line.strip_prefix("Pages:") {
            metrics.page_count = rest.trim().parse().unwrap_or(0);
        } else if let Some(rest) = line.strip_prefix("Page size:") {
            // "Page size:      612 x 792 pts (letter)"
            let nums: Vec<f64> = rest
                .split_whitespace()
                .filter_map(|tok| tok.parse::<f64>().ok())
                .take(2)
                .collect();
            if nums.len() == 2 {
                page_area_pts = nums[0] * nums[1];
            }
        }
    }
    let total_area = page_area_pts * metrics.page_count.max(1) as f64;

    let text = run_tool(
        "pdftotext",
        &[path.as_os_str().to_owned(), "-".into()],
    )
    .await
    .unwrap_or_default();
    let text_chars = text.chars().filter(|c| !c.is_whitespace()).count();
    metrics.has_text = text_chars > 0;
    if total_area > 0.0 {
        metrics.text_density = text_chars as f64 / total_area;
    }
    metrics.table_like = looks_like_table(&text);

    if let Ok(listing) = run_tool(
        "pdfimages",
        &["-list".into(), path.as_os_str().to_owned()],
    )
    .await
    {
        let mut image_area = 0.0;
        let mut count = 0;
        // Skip the two header lines; columns 4 and 5 are width and height.
        for line in listing.lines().skip(2) {
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.len() > 4 {
                if let (Ok(w), Ok(h)) = (cols[3].parse::<f64>(), cols[4].parse::<f64>()) {
                    image_area += w * h;
                    count += 1;
                }
            }
        }
        metrics.image_count = count;
        if total_area > 0.0 {
            metrics.image_density = (image_area / total_area).min(1.0);
        }
    }

    Ok(())
}

/// Image analysis with the `image` crate: contrast, sharpness, edge density.
async fn analyze_image(path: &Path, metrics: &mut DocumentMetrics) -> Result<()> {
    let path = path.to_owned();
    let (resolution, contrast, sharpness, edge_density) =
        spawn_blocking_propagating_panics(move || -> Result<_> {
            let img = image::open(&path)
                .with_context(|| format!("failed to open image {:?}", path))?;
            let resolution = img.dimensions();
            let luma = img.to_luma8();
            Ok((
                resolution,
                luma_stddev(&luma),
                laplacian_stddev(&luma),
                gradient_edge_density(&luma),
            ))
        })
        .await?;

    metrics.page_count = 1;
    metrics.image_count = 1;
    metrics.image_density = 1.0;
    metrics.resolution = Some(resolution);
    metrics.contrast = Some(contrast);
    metrics.sharpness = Some(sharpness);
    metrics.edge_density = Some(edge_density);
    Ok(())
}

/// Standard deviation of the luma channel.
fn luma_stddev(luma: &image::GrayImage) -> f64 {
    let pixels: Vec<f64> = luma.pixels().map(|p| p.0[0] as f64).collect();
    stddev(&pixels)
}

/// Standard deviation of the 4-neighbor Laplacian.
fn laplacian_stddev(luma: &image::GrayImage) -> f64 {
    let (w, h) = luma.dimensions();
    if w < 3 || h < 3 {
        return 0.0;
    }
    let mut values = Vec::with_capacity(((w - 2) * (h - 2)) as usize);
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let center = luma.get_pixel(x, y).0[0] as f64;
            let around = luma.get_pixel(x - 1, y).0[0] as f64
                + luma.get_pixel(x + 1, y).0[0] as f64
                + luma.get_pixel(x, y - 1).0[0] as f64
                + luma.get_pixel(x, y + 1).0[0] as f64;
            values.push(around - 4.0 * center);
        }
    }
    stddev(&values)
}

/// Fraction of pixels whose gradient magnitude exceeds a fixed threshold.
fn gradient_edge_density(luma: &image::GrayImage) -> f64 {
    let (w, h) = luma.dimensions();
    if w < 2 || h < 2 {
        return 0.0;
    }
    let mut edges = 0usize;
    let mut total = 0usize;
    for y in 0..h - 1 {
        for x in 0..w - 1 {
            let here = luma.get_pixel(x, y).0[0] as f64;
            let right = luma.get_pixel(x + 1, y).0[0] as f64;
            let below = luma.get_pixel(x, y + 1).0[0] as f64;
            let magnitude = ((right - here).powi(2) + (below - here).powi(2)).sqrt();
            if magnitude > 64.0 {
                edges += 1;
            }
            total += 1;
        }
    }
    edges as f64 / total.max(1) as f64
}

fn stddev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance =
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

/// Does extracted text look like it contains tables?
///
/// We count lines with several wide whitespace gaps or drawing characters;
/// a handful of them is enough to trigger the complexity bump.
fn looks_like_table(text: &str) -> bool {
    let mut table_lines = 0;
    for line in text.lines() {
        let gap_runs = line.split("  ").filter(|part| !part.trim().is_empty()).count();
        let drawing_chars = line.chars().filter(|c| matches!(c, '|' | '+')).count();
        if gap_runs >= 4 || drawing_chars >= 3 {
            table_lines += 1;
        }
        if table_lines >= 3 {
            return true;
        }
    }
    false
}

/// Run a Poppler tool, returning its stdout as a string.
async fn run_tool(name: &str, args: &[std::ffi::OsString]) -> Result<String> {
    let output = with_cpu_semaphore(|| async {
        Command::new(name)
            .args(args)
            .output()
            .await
            .with_context(|| format!("failed to run {}", name))
    })
    .await?;
    check_for_command_failure(name, &output)?;
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
