//! pdfgate server binary.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use pdfgate::{
    DEFAULT_MAX_DOCUMENT_BYTES, ExtractionService, PdfTableExtractor, ServiceConfig,
    transport::{ServerConfig, serve},
};

/// Single-flight PDF table extraction over HTTP.
#[derive(Debug, Parser)]
#[command(name = "pdfgate", version, about)]
struct Args {
    /// Address to bind
    #[arg(long, env = "PDFGATE_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = 8000)]
    port: u16,

    /// Requests allowed in flight at once, including the one extracting
    #[arg(long, env = "PDFGATE_MAX_CONCURRENCY", default_value_t = 2)]
    max_concurrency: usize,

    /// How long a request may wait for admission. 0 rejects immediately
    #[arg(long, env = "PDFGATE_ADMISSION_TIMEOUT_MS", default_value_t = 0)]
    admission_timeout_ms: u64,

    /// How long an admitted request may wait for the processing slot
    #[arg(long, env = "PDFGATE_GATE_TIMEOUT_MS", default_value_t = 30_000)]
    gate_timeout_ms: u64,

    /// Largest accepted document, in bytes
    #[arg(long, env = "PDFGATE_MAX_DOCUMENT_BYTES", default_value_t = DEFAULT_MAX_DOCUMENT_BYTES)]
    max_document_bytes: usize,
}

impl Args {
    fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            max_concurrency: self.max_concurrency,
            admission_timeout: Duration::from_millis(self.admission_timeout_ms),
            gate_timeout: Duration::from_millis(self.gate_timeout_ms),
            max_document_bytes: self.max_document_bytes,
            ..ServiceConfig::default()
        }
    }

    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
        }
    }
}

/// Filter used when `RUST_LOG` is unset, from the `PDFGATE_LOG` level.
fn default_filter(level: Option<&str>) -> String {
    let base_level = match level {
        Some("debug") => "debug",
        Some("trace") => "trace",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };
    format!("pdfgate={base_level},pdfgate_server={base_level}")
}

/// Initialize tracing with PDFGATE_LOG and LOG_FORMAT support.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(default_filter(std::env::var("PDFGATE_LOG").ok().as_deref()))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing();

    let config = args.service_config();
    tracing::debug!(?config, "Loaded configuration");

    let service = ExtractionService::new(config, Arc::new(PdfTableExtractor::new()))?;
    serve(args.server_config(), Arc::new(service)).await
}
