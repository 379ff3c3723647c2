//! pdfgate: single-flight PDF table extraction behind admission control.

mod health;
mod version;

pub mod config;
pub mod error;
pub mod extractor;
pub mod fetch;
pub mod gate;
pub mod input_validation;
pub mod pdf;
pub mod service;
pub mod table;
pub mod transport;

pub use config::{ConfigError, DEFAULT_MAX_DOCUMENT_BYTES, ServiceConfig};
pub use error::{ErrorKind, ServiceError};
pub use extractor::{
    Document, ExtractionError, ExtractionJob, ExtractionResult, ExtractionTiming, Extractor,
};
pub use gate::{AdmissionController, AdmissionPolicy, SingleFlightGate};
pub use health::Health;
pub use pdf::PdfTableExtractor;
pub use service::{Extraction, ExtractionService, HealthSnapshot};
pub use table::{Column, ExtractedTable, Row};
pub use version::{PDFGATE_VERSION, VersionInfo};
