//! HTTP route handlers.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    extract::{
        DefaultBodyLimit, Multipart, Query, State,
        multipart::{MultipartError, MultipartRejection},
        rejection::JsonRejection,
    },
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use http_body_util::LengthLimitError;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, ServiceError};
use crate::extractor::Document;
use crate::input_validation::ValidationError;
use crate::service::{Extraction, ExtractionService, HealthSnapshot};
use crate::table::TablePayload;

pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// Room for multipart boundaries and part headers on top of the document.
const MULTIPART_OVERHEAD: usize = 16 * 1024;

#[derive(Debug, Serialize)]
pub struct HealthzResponse {
    pub ok: bool,
    #[serde(flatten)]
    pub snapshot: HealthSnapshot,
}

#[derive(Debug, Serialize)]
pub struct ExtractResponse {
    pub request_id: String,
    #[serde(flatten)]
    pub table: TablePayload,
    pub elapsed_ms: u64,
    pub slot_wait_ms: u64,
}

#[derive(Debug, Deserialize)]
pub struct UrlRequest {
    pub file_url: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct FormatQuery {
    pub format: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Json,
    Csv,
}

/// `?format=` wins over `Accept`. Among accepted types the first of
/// `text/csv` or `application/json` decides.
fn output_format(
    query: &FormatQuery,
    headers: &HeaderMap,
) -> Result<OutputFormat, ValidationError> {
    if let Some(format) = query.format.as_deref() {
        return match format.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "csv" => Ok(OutputFormat::Csv),
            other => Err(ValidationError::UnsupportedFormat(other.to_string())),
        };
    }

    let accept = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let preferred = accept
        .split(',')
        .map(|media| media.split(';').next().unwrap_or_default().trim())
        .find(|media| {
            media.eq_ignore_ascii_case("text/csv")
                || media.eq_ignore_ascii_case("application/json")
        });

    Ok(match preferred {
        Some(media) if media.eq_ignore_ascii_case("text/csv") => OutputFormat::Csv,
        _ => OutputFormat::Json,
    })
}

/// Caller-supplied `x-request-id` if usable, otherwise a fresh one.
fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(&REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty() && id.len() <= 128)
        .map(str::to_string)
        .unwrap_or_else(|| format!("req_{}", uuid::Uuid::new_v4().simple()))
}

/// Error response with the `{error: {kind, message}, request_id}` envelope.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: ErrorKind,
    message: String,
    request_id: String,
    retry_after: Option<u64>,
}

impl ApiError {
    fn new(request_id: &str, err: ServiceError, gate_timeout: Duration) -> Self {
        let kind = err.kind();
        let (status, retry_after) = match kind {
            ErrorKind::InvalidInput if err.is_too_large() => (StatusCode::PAYLOAD_TOO_LARGE, None),
            ErrorKind::InvalidInput => (StatusCode::BAD_REQUEST, None),
            ErrorKind::AdmissionTimeout => (StatusCode::TOO_MANY_REQUESTS, Some(1)),
            ErrorKind::ExtractionTimeout => (
                StatusCode::SERVICE_UNAVAILABLE,
                Some(gate_timeout.as_secs().max(1)),
            ),
            ErrorKind::WorkerFailure => (StatusCode::INTERNAL_SERVER_ERROR, None),
        };

        Self {
            status,
            kind,
            message: err.public_message(),
            request_id: request_id.to_string(),
            retry_after,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "kind": self.kind,
                "message": self.message,
            },
            "request_id": self.request_id,
        });

        let mut response = (self.status, Json(body)).into_response();
        let headers = response.headers_mut();
        if let Some(secs) = self.retry_after {
            headers.insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        if let Ok(id) = HeaderValue::from_str(&self.request_id) {
            headers.insert(REQUEST_ID_HEADER, id);
        }
        response
    }
}

/// Per-request context shared by the extraction routes.
struct RequestCtx {
    service: Arc<ExtractionService>,
    request_id: String,
}

impl RequestCtx {
    fn new(service: Arc<ExtractionService>, headers: &HeaderMap) -> Self {
        Self {
            service,
            request_id: request_id(headers),
        }
    }

    fn error(&self, err: impl Into<ServiceError>) -> ApiError {
        ApiError::new(&self.request_id, err.into(), self.service.config().gate_timeout)
    }

    fn max_bytes(&self) -> usize {
        self.service.config().max_document_bytes
    }

    async fn run(self, document: Document, format: OutputFormat) -> Result<Response, ApiError> {
        let name = document.stem().unwrap_or("output").to_string();
        let extraction = self
            .service
            .extract(&self.request_id, document)
            .await
            .map_err(|e| self.error(e))?;
        self.render(extraction, format, &name)
    }

    fn render(
        &self,
        extraction: Extraction,
        format: OutputFormat,
        name: &str,
    ) -> Result<Response, ApiError> {
        let mut response = match format {
            OutputFormat::Json => Json(ExtractResponse {
                request_id: self.request_id.clone(),
                table: extraction.table.to_payload(),
                elapsed_ms: extraction.timing.duration().as_millis() as u64,
                slot_wait_ms: extraction.slot_wait.as_millis() as u64,
            })
            .into_response(),
            OutputFormat::Csv => {
                let csv = extraction.table.to_csv().map_err(|e| {
                    tracing::error!(
                        request_id = %self.request_id,
                        error = %e,
                        "CSV rendering failed"
                    );
                    self.error(ServiceError::Worker(format!("csv rendering failed: {e}")))
                })?;
                (
                    [
                        (
                            header::CONTENT_TYPE,
                            HeaderValue::from_static("text/csv; charset=utf-8"),
                        ),
                        (header::CONTENT_DISPOSITION, content_disposition(name)),
                    ],
                    csv,
                )
                    .into_response()
            }
        };

        if let Ok(id) = HeaderValue::from_str(&self.request_id) {
            response.headers_mut().insert(REQUEST_ID_HEADER, id);
        }
        Ok(response)
    }
}

fn content_disposition(stem: &str) -> HeaderValue {
    let safe: String = stem
        .chars()
        .map(|c| {
            if c == ' ' || (c.is_ascii_graphic() && c != '"' && c != '\\') {
                c
            } else {
                '_'
            }
        })
        .collect();
    HeaderValue::from_str(&format!("attachment; filename=\"{safe}.csv\""))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment; filename=\"output.csv\""))
}

fn multipart_error(err: MultipartError, limit: usize) -> ValidationError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ValidationError::ExceedsLimit { limit }
    } else {
        ValidationError::Unreadable(err.body_text())
    }
}

async fn healthz(State(service): State<Arc<ExtractionService>>) -> impl IntoResponse {
    let snapshot = service.health().await;
    let ok = snapshot.is_live();
    let status = if ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(HealthzResponse { ok, snapshot }))
}

/// Raw PDF bytes as the request body.
async fn extract_raw(
    State(service): State<Arc<ExtractionService>>,
    Query(query): Query<FormatQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ApiError> {
    let ctx = RequestCtx::new(service, &headers);
    let format = output_format(&query, &headers).map_err(|e| ctx.error(e))?;
    let limit = ctx.max_bytes();

    if let Some(size) = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok())
        && size > limit
    {
        return Err(ctx.error(ValidationError::TooLarge { size, limit }));
    }

    let bytes = axum::body::to_bytes(body, limit).await.map_err(|e| {
        let e = e.into_inner();
        if e.downcast_ref::<LengthLimitError>().is_some() {
            ctx.error(ValidationError::ExceedsLimit { limit })
        } else {
            ctx.error(ValidationError::Unreadable(e.to_string()))
        }
    })?;

    tracing::debug!(request_id = %ctx.request_id, bytes = bytes.len(), "Received document");
    ctx.run(Document::new(bytes), format).await
}

/// Multipart upload, document in the `file` field.
async fn process_file(
    State(service): State<Arc<ExtractionService>>,
    Query(query): Query<FormatQuery>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, ApiError> {
    let ctx = RequestCtx::new(service, &headers);
    let format = output_format(&query, &headers).map_err(|e| ctx.error(e))?;
    let limit = ctx.max_bytes();

    let mut multipart =
        multipart.map_err(|e| ctx.error(ValidationError::Unreadable(e.body_text())))?;

    let mut document = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ctx.error(multipart_error(e, limit)))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().map(str::to_string);
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ctx.error(multipart_error(e, limit)))?;

        tracing::debug!(
            request_id = %ctx.request_id,
            bytes = bytes.len(),
            ?filename,
            "Received document"
        );
        let doc = Document::new(bytes);
        document = Some(match filename {
            Some(name) => doc.with_filename(name),
            None => doc,
        });
        break;
    }

    let document = document.ok_or_else(|| ctx.error(ValidationError::Missing))?;
    ctx.run(document, format).await
}

/// `{"file_url": "..."}`; the document is downloaded before admission.
async fn process_url(
    State(service): State<Arc<ExtractionService>>,
    Query(query): Query<FormatQuery>,
    headers: HeaderMap,
    request: Result<Json<UrlRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let ctx = RequestCtx::new(service, &headers);
    let format = output_format(&query, &headers).map_err(|e| ctx.error(e))?;

    let Json(request) =
        request.map_err(|e| ctx.error(ValidationError::Unreadable(e.body_text())))?;

    let document = ctx
        .service
        .fetch_document(&ctx.request_id, &request.file_url)
        .await
        .map_err(|e| ctx.error(e))?;

    ctx.run(document, format).await
}

pub fn routes(service: Arc<ExtractionService>) -> Router {
    let body_limit = service
        .config()
        .max_document_bytes
        .saturating_add(MULTIPART_OVERHEAD);

    Router::new()
        .route("/healthz", get(healthz))
        .route("/extract", post(extract_raw))
        .route("/process/file", post(process_file))
        .route("/process/url", post(process_url))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(service)
}
