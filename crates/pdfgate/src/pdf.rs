//! PDF extractor backed by `pdf-extract`.

use crate::extractor::{ExtractionError, ExtractionJob, ExtractionResult, Extractor};
use crate::table::ExtractedTable;

/// Leading bytes of every PDF file.
pub const PDF_MAGIC: &[u8] = b"%PDF-";

/// Cheap format sniff. Does not parse the document.
pub fn looks_like_pdf(bytes: &[u8]) -> bool {
    // Some producers emit a few junk bytes before the header.
    bytes
        .windows(PDF_MAGIC.len())
        .take(1024)
        .any(|w| w == PDF_MAGIC)
}

/// Extracts page text with `pdf-extract`, then rebuilds manifest rows from it.
#[derive(Debug, Default, Clone, Copy)]
pub struct PdfTableExtractor;

impl PdfTableExtractor {
    pub fn new() -> Self {
        Self
    }
}

impl Extractor for PdfTableExtractor {
    fn name(&self) -> &'static str {
        "pdf-extract"
    }

    fn extract(&self, job: &ExtractionJob) -> ExtractionResult {
        let text =
            pdf_extract::extract_text_from_mem(job.document.bytes()).map_err(|e| match e {
                pdf_extract::OutputError::PdfError(e) => {
                    ExtractionError::InvalidDocument(e.to_string())
                }
                other => ExtractionError::Failed(other.to_string()),
            })?;

        let table = ExtractedTable::from_text(&text);
        tracing::debug!(
            request_id = %job.request_id,
            text_chars = text.len(),
            rows = table.len(),
            "Extracted rows from document text"
        );
        Ok(table)
    }
}
