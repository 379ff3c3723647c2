//! HTTP transport via axum.

mod routes;
mod server;

pub use routes::{ApiError, ExtractResponse, HealthzResponse, REQUEST_ID_HEADER, UrlRequest, routes};
pub use server::{ServerConfig, serve};
