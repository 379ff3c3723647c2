//! Extraction worker boundary.
//!
//! An `Extractor` turns document bytes into a table. Calls are blocking and may
//! run for minutes; the service runs them on the blocking pool while holding
//! the processing slot, so implementations never see concurrent calls.

use std::time::{Duration, Instant};

use axum::body::Bytes;

use crate::table::ExtractedTable;

/// An uploaded document, as received.
#[derive(Debug, Clone)]
pub struct Document {
    bytes: Bytes,
    filename: Option<String>,
}

impl Document {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            filename: None,
        }
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        let filename = filename.into();
        if !filename.trim().is_empty() {
            self.filename = Some(filename);
        }
        self
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    /// Filename without directories or a trailing `.pdf`, for naming outputs.
    pub fn stem(&self) -> Option<&str> {
        let name = self.filename()?;
        let name = name.rsplit(['/', '\\']).next().unwrap_or(name);
        let stem = name
            .len()
            .checked_sub(4)
            .filter(|&i| name.is_char_boundary(i) && name[i..].eq_ignore_ascii_case(".pdf"))
            .map(|i| &name[..i])
            .unwrap_or(name);
        (!stem.is_empty()).then_some(stem)
    }
}

/// One unit of work for the extractor. Not retained after the call.
#[derive(Debug)]
pub struct ExtractionJob {
    pub request_id: String,
    pub document: Document,
}

impl ExtractionJob {
    pub fn new(request_id: impl Into<String>, document: Document) -> Self {
        Self {
            request_id: request_id.into(),
            document,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    /// The document is corrupt or cannot be parsed. User-correctable.
    #[error("document could not be parsed: {0}")]
    InvalidDocument(String),

    /// The extractor failed on a document that looked valid.
    #[error("extraction failed: {0}")]
    Failed(String),
}

pub type ExtractionResult = Result<ExtractedTable, ExtractionError>;

/// The extraction capability. Assumed non-reentrant.
pub trait Extractor: Send + Sync + 'static {
    /// Short identifier for logs and health output.
    fn name(&self) -> &'static str;

    fn extract(&self, job: &ExtractionJob) -> ExtractionResult;
}

/// Wall-clock bounds of one extractor call.
#[derive(Debug, Clone, Copy)]
pub struct ExtractionTiming {
    pub started: Instant,
    pub finished: Instant,
}

impl ExtractionTiming {
    pub fn duration(&self) -> Duration {
        self.finished.saturating_duration_since(self.started)
    }

    pub fn overlaps(&self, other: &ExtractionTiming) -> bool {
        self.started < other.finished && other.started < self.finished
    }
}
