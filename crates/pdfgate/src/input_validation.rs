//! Document validation, run before any admission or slot interaction.

use crate::extractor::Document;
use crate::pdf::looks_like_pdf;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("no document was uploaded")]
    Missing,

    #[error("document is {size} bytes, the limit is {limit} bytes")]
    TooLarge { size: usize, limit: usize },

    /// Size unknown because the upload was cut off at the limit.
    #[error("document exceeds the {limit} byte limit")]
    ExceedsLimit { limit: usize },

    #[error("document is not a PDF")]
    NotPdf,

    #[error("failed to read upload: {0}")]
    Unreadable(String),

    #[error("unsupported output format '{0}', expected json or csv")]
    UnsupportedFormat(String),
}

impl ValidationError {
    /// Size violations get their own HTTP status.
    pub fn is_too_large(&self) -> bool {
        matches!(
            self,
            ValidationError::TooLarge { .. } | ValidationError::ExceedsLimit { .. }
        )
    }
}

/// Check presence, size and format of an uploaded document.
pub fn validate_document(document: &Document, max_bytes: usize) -> Result<(), ValidationError> {
    if document.is_empty() {
        return Err(ValidationError::Missing);
    }

    if document.len() > max_bytes {
        return Err(ValidationError::TooLarge {
            size: document.len(),
            limit: max_bytes,
        });
    }

    if !looks_like_pdf(document.bytes()) {
        return Err(ValidationError::NotPdf);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_small_pdf() {
        let doc = Document::new(b"%PDF-1.7 body".to_vec());
        assert_eq!(validate_document(&doc, 1024), Ok(()));
    }

    #[test]
    fn rejects_empty_upload() {
        let doc = Document::new(Vec::new());
        assert_eq!(validate_document(&doc, 1024), Err(ValidationError::Missing));
    }

    #[test]
    fn rejects_oversized_upload() {
        let doc = Document::new(vec![b'x'; 11]);
        let err = validate_document(&doc, 10).unwrap_err();
        assert!(err.is_too_large());
        assert_eq!(err.to_string(), "document is 11 bytes, the limit is 10 bytes");
    }

    #[test]
    fn size_limit_is_inclusive() {
        let mut bytes = b"%PDF-".to_vec();
        bytes.resize(10, b' ');
        assert_eq!(validate_document(&Document::new(bytes), 10), Ok(()));
    }

    #[test]
    fn rejects_non_pdf_bytes() {
        let doc = Document::new(b"<html>not a pdf</html>".to_vec());
        assert_eq!(validate_document(&doc, 1024), Err(ValidationError::NotPdf));
    }
}
