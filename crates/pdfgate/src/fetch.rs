//! Document download for `/process/url`.

use std::time::Duration;

use reqwest::{StatusCode, Url};

use crate::config::ConfigError;
use crate::extractor::Document;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("invalid file_url: {0}")]
    InvalidUrl(String),

    #[error("download_error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("download_error: upstream returned {0}")]
    Status(StatusCode),

    #[error("file too large: {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: u64, limit: usize },
}

impl FetchError {
    pub fn is_too_large(&self) -> bool {
        matches!(self, FetchError::TooLarge { .. })
    }
}

/// Downloads documents into memory, enforcing the size limit while streaming.
#[derive(Debug, Clone)]
pub struct UrlFetcher {
    client: reqwest::Client,
    max_bytes: usize,
}

impl UrlFetcher {
    pub fn new(timeout: Duration, max_bytes: usize) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("pdfgate/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;

        Ok(Self { client, max_bytes })
    }

    pub async fn fetch(&self, file_url: &str) -> Result<Document, FetchError> {
        let url = Url::parse(file_url).map_err(|e| FetchError::InvalidUrl(e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(FetchError::InvalidUrl(format!(
                "unsupported scheme '{}'",
                url.scheme()
            )));
        }

        let filename = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        let mut response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(FetchError::Status(response.status()));
        }

        if let Some(size) = response.content_length()
            && size > self.max_bytes as u64
        {
            return Err(FetchError::TooLarge {
                size,
                limit: self.max_bytes,
            });
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if body.len() + chunk.len() > self.max_bytes {
                return Err(FetchError::TooLarge {
                    size: (body.len() + chunk.len()) as u64,
                    limit: self.max_bytes,
                });
            }
            body.extend_from_slice(&chunk);
        }

        tracing::debug!(bytes = body.len(), ?filename, "Downloaded document");

        let document = Document::new(body);
        Ok(match filename {
            Some(name) => document.with_filename(name),
            None => document,
        })
    }
}
