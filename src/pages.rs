//! Page-level document handling via Poppler's CLI tools.
//!
//! We shell out to `pdfinfo`, `pdfseparate`, `pdfunite`, and `pdftocairo`
//! rather than linking a PDF library. All subprocesses run under the CPU
//! semaphore so a large document cannot monopolize the machine.

use std::fs;

use tokio::process::Command;

use crate::{
    async_utils::check_for_command_failure,
    cpu_limit::with_cpu_semaphore,
    prelude::*,
    task::PageChunk,
};

/// Image types we treat as single-page documents.
const SINGLE_PAGE_IMAGE_TYPES: &[&str] = &[
    "image/png",
    "image/jpeg",
    "image/webp",
    "image/gif",
    "image/tiff",
    "image/bmp",
];

/// Detect a document's MIME type.
///
/// Magic bytes first, then the file extension, then a generic fallback.
/// Plain text files have no magic bytes, so the extension check matters.
pub fn detect_mime(path: &Path) -> String {
    if let Ok(Some(kind)) = infer::get_from_path(path) {
        return kind.mime_type().to_owned();
    }
    mime_guess::from_path(path)
        .first_raw()
        .unwrap_or("application/octet-stream")
        .to_owned()
}

/// Determine how many pages a document has.
///
/// PDFs are counted with `pdfinfo`; images count as one page; any other
/// non-empty file counts as one page. An empty file has zero pages.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub async fn page_count(path: &Path) -> Result<usize> {
    let len = fs::metadata(path)
        .with_context(|| format!("failed to stat {:?}", path))?
        .len();
    if len == 0 {
        return Ok(0);
    }

    let mime = detect_mime(path);
    if mime == "application/pdf" {
        pdf_page_count(path).await
    } else {
        Ok(1)
    }
}

/// Count PDF pages using `pdfinfo`.
async fn pdf_page_count(path: &Path) -> Result<usize> {
    let output = with_cpu_semaphore(|| async {
        Command::new("pdfinfo")
            .arg(path)
            .output()
            .await
            .with_context(|| format!("failed to run pdfinfo on {:?}", path))
    })
    .await?;
    check_for_command_failure("pdfinfo", &output)?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    for line in stdout.lines() {
        if let Some(rest) = line.strip_prefix("Pages:") {
            return rest
                .trim()
                .parse::<usize>()
                .with_context(|| format!("unparseable page count in {:?}", line));
        }
    }
    Err(anyhow!("pdfinfo output had no page count for {:?}", path))
}

/// Plan page-range chunks covering `[0, total_pages)`.
///
/// Ranges are 0-based and inclusive on both ends, disjoint, and contiguous
/// when ordered by `start_page`. Non-PDF documents always become a single
/// chunk covering every page they have.
pub fn plan_chunks(
    source: &Path,
    total_pages: usize,
    chunk_size: usize,
    scratch_dir: &Path,
) -> Vec<PageChunk> {
    let chunk_size = chunk_size.max(1);
    let mime = detect_mime(source);
    let splittable = mime == "application/pdf";

    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_owned());
    let extension = source
        .extension()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "bin".to_owned());

    let mut chunks = vec![];
    if total_pages == 0 {
        return chunks;
    }

    if !splittable || total_pages <= chunk_size {
        chunks.push(PageChunk {
            source_path: source.to_owned(),
            output_path: scratch_dir.join(format!("{stem}_chunk_1_{total_pages}.{extension}")),
            start_page: 0,
            end_page: total_pages - 1,
            processed: false,
            text: None,
            confidence: None,
        });
        return chunks;
    }

    let mut start = 0;
    while start < total_pages {
        let end = (start + chunk_size - 1).min(total_pages - 1);
        chunks.push(PageChunk {
            source_path: source.to_owned(),
            output_path: scratch_dir
                .join(format!("{stem}_chunk_{}_{}.{extension}", start + 1, end + 1)),
            start_page: start,
            end_page: end,
            processed: false,
            text: None,
            confidence: None,
        });
        start = end + 1;
    }
    chunks
}

/// Extract a chunk's page range into its `output_path`.
///
/// PDFs go through `pdfseparate` page-by-page and `pdfunite` to reassemble
/// the range; anything else is copied whole.
#[instrument(level = "debug", skip_all, fields(start = chunk.start_page, end = chunk.end_page))]
pub async fn extract_range(chunk: &PageChunk) -> Result<()> {
    let mime = detect_mime(&chunk.source_path);
    if mime != "application/pdf" {
        fs::copy(&chunk.source_path, &chunk.output_path).with_context(|| {
            format!(
                "failed to copy {:?} to {:?}",
                chunk.source_path, chunk.output_path
            )
        })?;
        return Ok(());
    }

    // pdfseparate writes one file per page; pattern digits keep them sorted.
    let tmpdir = tempfile::TempDir::with_prefix("range")?;
    let pattern = tmpdir.path().join("page-%09d.pdf");
    let output = with_cpu_semaphore(|| async {
        Command::new("pdfseparate")
            .arg("-f")
            .arg((chunk.start_page + 1).to_string())
            .arg("-l")
            .arg((chunk.end_page + 1).to_string())
            .arg(&chunk.source_path)
            .arg(&pattern)
            .output()
            .await
            .with_context(|| {
                format!("failed to run pdfseparate on {:?}", chunk.source_path)
            })
    })
    .await?;
    check_for_command_failure("pdfseparate", &output)?;

    let mut pages = list_sorted(tmpdir.path())?;
    if pages.is_empty() {
        return Err(anyhow!(
            "pdfseparate produced no pages for {:?} range {}-{}",
            chunk.source_path,
            chunk.start_page,
            chunk.end_page
        ));
    }
    if pages.len() == 1 {
        fs::copy(&pages[0], &chunk.output_path)?;
        return Ok(());
    }

    pages.push(chunk.output_path.clone());
    let output = with_cpu_semaphore(|| async {
        Command::new("pdfunite")
            .args(&pages)
            .output()
            .await
            .context("failed to run pdfunite")
    })
    .await?;
    check_for_command_failure("pdfunite", &output)
}

/// Merge processed chunk files into `output_path`, in `start_page` order.
///
/// Only chunks marked `processed` participate. For PDFs we `pdfunite`; for a
/// single chunk of any type we copy.
#[instrument(level = "debug", skip_all, fields(output = %output_path.display()))]
pub async fn merge_ranges(chunks: &[PageChunk], output_path: &Path) -> Result<()> {
    let mut done: Vec<&PageChunk> = chunks
        .iter()
        .filter(|c| c.processed && c.output_path.exists())
        .collect();
    if done.is_empty() {
        return Err(anyhow!("no processed chunks to merge"));
    }
    done.sort_by_key(|c| c.start_page);

    if done.len() == 1 {
        fs::copy(&done[0].output_path, output_path)?;
        return Ok(());
    }

    let mut args: Vec<PathBuf> = done.iter().map(|c| c.output_path.clone()).collect();
    args.push(output_path.to_owned());
    let output = with_cpu_semaphore(|| async {
        Command::new("pdfunite")
            .args(&args)
            .output()
            .await
            .context("failed to run pdfunite")
    })
    .await?;
    check_for_command_failure("pdfunite", &output)
}

/// Rasterize a PDF (or pass through an image) to per-page PNGs.
///
/// Returns the scratch directory guard along with the sorted page images.
/// The guard must stay alive while the images are in use.
pub async fn rasterize(
    path: &Path,
    dpi: u32,
) -> Result<(tempfile::TempDir, Vec<PathBuf>)> {
    let tmpdir = tempfile::TempDir::with_prefix("raster")?;

    let mime = detect_mime(path);
    if SINGLE_PAGE_IMAGE_TYPES.contains(&mime.as_str()) {
        // Already an image. Hand it back unchanged.
        let dest = tmpdir.path().join(
            path.file_name()
                .ok_or_else(|| anyhow!("no file name in {:?}", path))?,
        );
        fs::copy(path, &dest)?;
        return Ok((tmpdir, vec![dest]));
    }

    let out_base = tmpdir.path().join("page");
    let output = with_cpu_semaphore(|| async {
        Command::new("pdftocairo")
            .arg("-png")
            .arg("-r")
            .arg(dpi.to_string())
            .arg(path)
            .arg(&out_base)
            .output()
            .await
            .with_context(|| format!("failed to run pdftocairo on {:?}", path))
    })
    .await?;
    check_for_command_failure("pdftocairo", &output)?;

    let pages = list_sorted(tmpdir.path())?;
    Ok((tmpdir, pages))
}

/// List a directory's files in lexical order.
fn list_sorted(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("failed to read {:?}", dir))?
        .map(|entry| Ok(entry?.path()))
        .collect::<Result<_>>()?;
    paths.sort();
    Ok(paths)
}
