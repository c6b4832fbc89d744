use std::path::Path;

use async_trait::async_trait;
use common::error::AppError;
use tracing::debug;

/// One contiguous piece of extracted text with its provenance. Segment order
/// follows the document; page numbers are present where the format has pages.
#[derive(Debug, Clone, PartialEq)]
pub struct TextSegment {
    pub text: String,
    pub source: String,
    pub page: Option<u32>,
}

/// Turns a file path into ordered text segments. The extraction technique is
/// deliberately opaque to the rest of the pipeline; only the segment contract
/// matters.
#[async_trait]
pub trait DocumentLoader: Send + Sync {
    async fn load(&self, path: &Path) -> Result<Vec<TextSegment>, AppError>;
}

/// Default loader: plain text and markdown are read as a single segment, PDFs
/// are extracted per page. Every other extension is `UnsupportedFormat`.
pub struct FileLoader;

#[async_trait]
impl DocumentLoader for FileLoader {
    async fn load(&self, path: &Path) -> Result<Vec<TextSegment>, AppError> {
        let source = file_name(path);

        let mime_type = mime_guess::from_path(path)
            .first()
            .map(|mime| mime.essence_str().to_owned())
            .unwrap_or_default();

        match mime_type.as_str() {
            t if t.starts_with("text/") => {
                let text = tokio::fs::read_to_string(path).await?;
                Ok(vec![TextSegment {
                    text,
                    source,
                    page: None,
                }])
            }
            "application/pdf" => extract_pdf_segments(path, source).await,
            _ => Err(AppError::UnsupportedFormat(format!(
                "no extractor for '{}'",
                path.display()
            ))),
        }
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Per-page extraction via the PDF's text layer, falling back to a
/// whole-document pass when no page yields text. Both extractors are
/// synchronous, so they run on the blocking pool.
async fn extract_pdf_segments(path: &Path, source: String) -> Result<Vec<TextSegment>, AppError> {
    let bytes = tokio::fs::read(path).await?;

    tokio::task::spawn_blocking(move || pdf_segments_blocking(&bytes, &source)).await?
}

fn pdf_segments_blocking(bytes: &[u8], source: &str) -> Result<Vec<TextSegment>, AppError> {
    match lopdf::Document::load_mem(bytes) {
        Ok(document) => {
            let mut segments = Vec::new();
            for page in document.get_pages().keys() {
                match document.extract_text(&[*page]) {
                    Ok(text) if !text.trim().is_empty() => segments.push(TextSegment {
                        text,
                        source: source.to_owned(),
                        page: Some(*page),
                    }),
                    Ok(_) => {}
                    Err(err) => {
                        debug!(page, error = %err, "page has no extractable text layer");
                    }
                }
            }
            if !segments.is_empty() {
                return Ok(segments);
            }
        }
        Err(err) => {
            debug!(error = %err, "lopdf could not parse document, trying whole-file extraction");
        }
    }

    let text = pdf_extract::extract_text_from_mem(bytes)
        .map_err(|err| AppError::InternalError(format!("Failed to extract text from PDF: {err}")))?;

    Ok(vec![TextSegment {
        text,
        source: source.to_owned(),
        page: None,
    }])
}
