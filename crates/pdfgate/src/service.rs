//! ExtractionService: transport-agnostic request handling.
//!
//! This service owns:
//! - Admission control (bounded in-flight requests)
//! - The single-flight gate around the extractor
//! - Health tracking
//!
//! One instance lives for the whole process and is shared by reference with
//! every request. Running several processes would give each its own gate, so
//! the single-flight guarantee holds only with a single worker process.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::config::{ConfigError, ServiceConfig};
use crate::error::ServiceError;
use crate::extractor::{Document, ExtractionError, ExtractionJob, ExtractionTiming, Extractor};
use crate::fetch::UrlFetcher;
use crate::gate::{AdmissionController, SingleFlightGate, SlotState};
use crate::health::Health;
use crate::input_validation::validate_document;
use crate::table::ExtractedTable;
use crate::version::VersionInfo;

/// Successful extraction of one document.
#[derive(Debug)]
pub struct Extraction {
    pub table: ExtractedTable,
    /// Time spent queued for the processing slot.
    pub slot_wait: Duration,
    pub timing: ExtractionTiming,
}

/// Snapshot of service health for transports to query.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthSnapshot {
    pub status: Health,
    pub slot: SlotState,
    pub in_flight: usize,
    pub capacity: usize,
    /// Admissions that can be granted right now.
    pub available: usize,
    pub waiting_for_slot: usize,
    pub rejected_total: u64,
    pub extractions_total: u64,
    /// ISO 8601.
    pub started_at: String,
    pub uptime_secs: u64,
    pub version: VersionInfo,
}

impl HealthSnapshot {
    pub fn is_live(&self) -> bool {
        self.status.is_live()
    }
}

pub struct ExtractionService {
    config: ServiceConfig,
    admission: AdmissionController,
    gate: SingleFlightGate,
    extractor: Arc<dyn Extractor>,
    fetcher: UrlFetcher,

    health: RwLock<Health>,
    started_at: chrono::DateTime<chrono::Utc>,
    started: Instant,
    invocations: AtomicU64,
    version: VersionInfo,
}

impl ExtractionService {
    /// Build the service. Health stays STARTING until `set_health(Ready)`.
    pub fn new(config: ServiceConfig, extractor: Arc<dyn Extractor>) -> Result<Self, ConfigError> {
        config.validate()?;

        let admission = AdmissionController::new(
            config.max_concurrency,
            config.admission_policy(),
            config.gate_timeout,
        );
        let fetcher = UrlFetcher::new(config.fetch_timeout, config.max_document_bytes)?;
        let version = VersionInfo::new(extractor.name());

        Ok(Self {
            config,
            admission,
            gate: SingleFlightGate::new(),
            extractor,
            fetcher,
            health: RwLock::new(Health::Starting),
            started_at: chrono::Utc::now(),
            started: Instant::now(),
            invocations: AtomicU64::new(0),
            version,
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub fn gate(&self) -> &SingleFlightGate {
        &self.gate
    }

    /// Number of extractor calls started since boot.
    pub fn invocations_total(&self) -> u64 {
        self.invocations.load(Ordering::Acquire)
    }

    /// Set the stored lifecycle state. BUSY is derived from the slot and is
    /// never stored.
    pub async fn set_health(&self, health: Health) {
        if health == Health::Busy {
            tracing::warn!("BUSY is derived from the processing slot, ignoring");
            return;
        }
        *self.health.write().await = health;
    }

    /// Reads counters only; never touches the slot or admission.
    pub async fn health(&self) -> HealthSnapshot {
        let stored = *self.health.read().await;
        let slot = self.gate.state();
        let status = match stored {
            Health::Ready if slot == SlotState::Held => Health::Busy,
            other => other,
        };

        HealthSnapshot {
            status,
            slot,
            in_flight: self.admission.in_flight(),
            capacity: self.admission.capacity(),
            available: self.admission.available(),
            waiting_for_slot: self.gate.waiting(),
            rejected_total: self.admission.rejected_total(),
            extractions_total: self.invocations_total(),
            started_at: self.started_at.to_rfc3339(),
            uptime_secs: self.started.elapsed().as_secs(),
            version: self.version.clone(),
        }
    }

    pub async fn is_live(&self) -> bool {
        self.health.read().await.is_live()
    }

    /// Run one document through validation, admission, the gate and the
    /// extractor.
    ///
    /// The slot and the admission ticket move into the blocking task and are
    /// released there, slot first, once the extractor returns or panics. If
    /// the caller stops waiting (client disconnect), the extractor still runs
    /// to completion before the slot frees up.
    pub async fn extract(
        &self,
        request_id: &str,
        document: Document,
    ) -> Result<Extraction, ServiceError> {
        validate_document(&document, self.config.max_document_bytes)?;

        let ticket = self.admission.try_admit().await.inspect_err(|e| {
            tracing::warn!(
                request_id,
                in_flight = e.in_flight,
                capacity = e.capacity,
                "Rejected: at admission capacity"
            );
        })?;

        let slot = self.gate.acquire(ticket.remaining()).await.inspect_err(|e| {
            tracing::warn!(request_id, waited = ?e.waited, "Timed out waiting for processing slot");
        })?;
        let slot_wait = slot.waited();

        tracing::info!(
            request_id,
            bytes = document.len(),
            ticket = ticket.number(),
            grant = slot.grant(),
            ?slot_wait,
            "Extraction started"
        );

        let extractor = Arc::clone(&self.extractor);
        let job = ExtractionJob::new(request_id, document);
        self.invocations.fetch_add(1, Ordering::AcqRel);

        let worker = tokio::task::spawn_blocking(move || {
            let started = Instant::now();
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| extractor.extract(&job)));
            let timing = ExtractionTiming {
                started,
                finished: Instant::now(),
            };
            drop(slot);
            drop(ticket);
            (outcome, timing)
        });

        let (outcome, timing) = worker.await.map_err(|e| {
            tracing::error!(request_id, error = %e, "Extraction task lost");
            ServiceError::Worker(format!("extraction task lost: {e}"))
        })?;

        match outcome {
            Ok(Ok(table)) => {
                tracing::info!(
                    request_id,
                    rows = table.len(),
                    elapsed = ?timing.duration(),
                    "Extraction succeeded"
                );
                Ok(Extraction {
                    table,
                    slot_wait,
                    timing,
                })
            }
            Ok(Err(ExtractionError::InvalidDocument(msg))) => {
                tracing::info!(request_id, error = %msg, "Document could not be parsed");
                Err(ServiceError::InvalidDocument(msg))
            }
            Ok(Err(ExtractionError::Failed(msg))) => {
                tracing::error!(
                    request_id,
                    error = %msg,
                    elapsed = ?timing.duration(),
                    "Extraction failed"
                );
                Err(ServiceError::Worker(msg))
            }
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                tracing::error!(
                    request_id,
                    panic = %msg,
                    elapsed = ?timing.duration(),
                    "Extractor panicked"
                );
                Err(ServiceError::Worker(format!("extractor panicked: {msg}")))
            }
        }
    }

    /// Download a document for extraction. Happens before admission, so a
    /// slow upstream never holds a ticket.
    pub async fn fetch_document(
        &self,
        request_id: &str,
        file_url: &str,
    ) -> Result<Document, ServiceError> {
        let document = self.fetcher.fetch(file_url).await.inspect_err(|e| {
            tracing::info!(request_id, error = %e, "Document download failed");
        })?;
        Ok(document)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::table::{Column, Row};
    use std::sync::Mutex as StdMutex;

    pub(crate) const PDF: &[u8] = b"%PDF-1.7\n% test document\n";

    #[derive(Clone, Copy)]
    pub(crate) enum Behavior {
        Succeed,
        InvalidDocument,
        Fail,
        Panic,
    }

    /// Extractor that sleeps, records its call window and checks it never
    /// runs concurrently with itself.
    pub(crate) struct MockExtractor {
        duration: Duration,
        behavior: StdMutex<Behavior>,
        running: std::sync::atomic::AtomicBool,
        overlapped: std::sync::atomic::AtomicBool,
        timings: StdMutex<Vec<ExtractionTiming>>,
    }

    impl MockExtractor {
        pub(crate) fn new(duration: Duration) -> Self {
            Self {
                duration,
                behavior: StdMutex::new(Behavior::Succeed),
                running: Default::default(),
                overlapped: Default::default(),
                timings: StdMutex::new(Vec::new()),
            }
        }

        pub(crate) fn behaving(self, behavior: Behavior) -> Self {
            *self.behavior.lock().unwrap() = behavior;
            self
        }

        pub(crate) fn set_behavior(&self, behavior: Behavior) {
            *self.behavior.lock().unwrap() = behavior;
        }

        pub(crate) fn calls(&self) -> usize {
            self.timings.lock().unwrap().len()
        }

        pub(crate) fn overlapped(&self) -> bool {
            self.overlapped.load(Ordering::SeqCst)
        }

        pub(crate) fn timings(&self) -> Vec<ExtractionTiming> {
            self.timings.lock().unwrap().clone()
        }
    }

    struct RunningGuard<'a>(&'a MockExtractor, Instant);

    impl Drop for RunningGuard<'_> {
        fn drop(&mut self) {
            self.0.running.store(false, Ordering::SeqCst);
            self.0.timings.lock().unwrap().push(ExtractionTiming {
                started: self.1,
                finished: Instant::now(),
            });
        }
    }

    impl Extractor for MockExtractor {
        fn name(&self) -> &'static str {
            "mock"
        }

        fn extract(&self, _job: &ExtractionJob) -> crate::extractor::ExtractionResult {
            if self.running.swap(true, Ordering::SeqCst) {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            let _running = RunningGuard(self, Instant::now());

            std::thread::sleep(self.duration);

            let behavior = *self.behavior.lock().unwrap();
            match behavior {
                Behavior::Succeed => Ok(ExtractedTable::new(vec![
                    Row::new()
                        .with(Column::Type, "Delivery")
                        .with(Column::ConsignmentNumber, "CN100")
                        .with(Column::Pay, "£1.5"),
                ])),
                Behavior::InvalidDocument => {
                    Err(ExtractionError::InvalidDocument("broken xref table".into()))
                }
                Behavior::Fail => Err(ExtractionError::Failed("native state corrupted".into())),
                Behavior::Panic => panic!("extractor blew up"),
            }
        }
    }

    pub(crate) fn config(max_concurrency: usize, gate_timeout: Duration) -> ServiceConfig {
        ServiceConfig {
            max_concurrency,
            admission_timeout: Duration::ZERO,
            gate_timeout,
            max_document_bytes: 1024,
            fetch_timeout: Duration::from_secs(5),
        }
    }

    pub(crate) async fn service_with(
        config: ServiceConfig,
        extractor: Arc<MockExtractor>,
    ) -> Arc<ExtractionService> {
        let service = Arc::new(ExtractionService::new(config, extractor).unwrap());
        service.set_health(Health::Ready).await;
        service
    }

    fn assert_idle(service: &ExtractionService) {
        assert_eq!(service.gate().state(), SlotState::Free);
        assert_eq!(service.admission().in_flight(), 0);
        assert_eq!(service.gate().waiting(), 0);
    }

    #[tokio::test]
    async fn successful_extraction_releases_everything() {
        let extractor = Arc::new(MockExtractor::new(Duration::from_millis(5)));
        let service = service_with(config(2, Duration::from_secs(1)), Arc::clone(&extractor)).await;

        let extraction = service.extract("req_1", Document::new(PDF)).await.unwrap();

        assert_eq!(extraction.table.len(), 1);
        assert!(extraction.timing.duration() >= Duration::from_millis(5));
        assert_eq!(extractor.calls(), 1);
        assert_eq!(service.invocations_total(), 1);
        assert_idle(&service);
    }

    #[tokio::test]
    async fn malformed_bytes_never_reach_the_gate() {
        let extractor = Arc::new(MockExtractor::new(Duration::ZERO));
        let service = service_with(config(2, Duration::from_secs(1)), Arc::clone(&extractor)).await;

        let err = service
            .extract("req_bad", Document::new(b"\x00\x01 not a pdf".to_vec()))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert_eq!(extractor.calls(), 0);
        assert_eq!(service.gate().grants_total(), 0);
        assert_eq!(service.admission().issued_total(), 0);
    }

    #[tokio::test]
    async fn oversized_document_is_invalid_input() {
        let extractor = Arc::new(MockExtractor::new(Duration::ZERO));
        let service = service_with(config(2, Duration::from_secs(1)), Arc::clone(&extractor)).await;

        let mut big = PDF.to_vec();
        big.resize(2048, b' ');
        let err = service.extract("req_big", Document::new(big)).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(err.is_too_large());
        assert_eq!(extractor.calls(), 0);
    }

    #[tokio::test]
    async fn worker_failures_release_slot_and_ticket() {
        let extractor = Arc::new(MockExtractor::new(Duration::from_millis(1)));
        let service = service_with(config(2, Duration::from_secs(1)), Arc::clone(&extractor)).await;

        for (behavior, kind) in [
            (Behavior::InvalidDocument, ErrorKind::InvalidInput),
            (Behavior::Fail, ErrorKind::WorkerFailure),
            (Behavior::Panic, ErrorKind::WorkerFailure),
        ] {
            extractor.set_behavior(behavior);
            let err = service.extract("req_fail", Document::new(PDF)).await.unwrap_err();
            assert_eq!(err.kind(), kind);
            assert_idle(&service);
        }

        // The slot is usable again after a panic.
        extractor.set_behavior(Behavior::Succeed);
        assert!(service.extract("req_ok", Document::new(PDF)).await.is_ok());
        assert_eq!(service.gate().grants_total(), 4);
        assert_idle(&service);
    }

    #[tokio::test]
    async fn panic_message_stays_internal() {
        let extractor = Arc::new(MockExtractor::new(Duration::ZERO).behaving(Behavior::Panic));
        let service = service_with(config(1, Duration::from_secs(1)), extractor).await;

        let err = service.extract("req_panic", Document::new(PDF)).await.unwrap_err();
        assert!(err.to_string().contains("extractor blew up"));
        assert!(!err.public_message().contains("blew up"));
    }

    #[tokio::test]
    async fn concurrent_requests_never_overlap_in_the_extractor() {
        let extractor = Arc::new(MockExtractor::new(Duration::from_millis(10)));
        let mut cfg = config(4, Duration::from_secs(10));
        cfg.admission_timeout = Duration::from_secs(10);
        let service = service_with(cfg, Arc::clone(&extractor)).await;

        let requests = (0..8).map(|i| {
            let service = Arc::clone(&service);
            async move {
                let result = service
                    .extract(&format!("req_{i}"), Document::new(PDF))
                    .await;
                assert!(service.admission().in_flight() <= 4);
                result
            }
        });
        let results = futures::future::join_all(requests).await;

        assert!(results.iter().all(Result::is_ok));
        assert!(!extractor.overlapped());

        let timings = extractor.timings();
        assert_eq!(timings.len(), 8);
        for (i, a) in timings.iter().enumerate() {
            for b in &timings[i + 1..] {
                assert!(!a.overlaps(b));
            }
        }
        assert_idle(&service);
    }

    #[tokio::test]
    async fn gate_timeout_releases_ticket_without_invoking_worker() {
        let extractor = Arc::new(MockExtractor::new(Duration::from_millis(300)));
        let service =
            service_with(config(2, Duration::from_millis(50)), Arc::clone(&extractor)).await;

        let first = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.extract("req_first", Document::new(PDF)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(service.gate().is_held());

        let err = service
            .extract("req_second", Document::new(PDF))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExtractionTimeout);
        assert_eq!(service.admission().in_flight(), 1);

        assert!(first.await.unwrap().is_ok());
        assert_eq!(extractor.calls(), 1);
        assert_idle(&service);
    }

    #[tokio::test]
    async fn admission_timeout_leaves_counter_unchanged() {
        let extractor = Arc::new(MockExtractor::new(Duration::from_millis(200)));
        let mut cfg = config(1, Duration::from_secs(5));
        cfg.admission_timeout = Duration::from_millis(30);
        let service = service_with(cfg, Arc::clone(&extractor)).await;

        let first = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.extract("req_first", Document::new(PDF)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let before = service.admission().in_flight();

        let err = service
            .extract("req_second", Document::new(PDF))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AdmissionTimeout);
        assert_eq!(service.admission().in_flight(), before);

        assert!(first.await.unwrap().is_ok());
        assert_eq!(extractor.calls(), 1);
        assert_idle(&service);
    }

    #[tokio::test]
    async fn two_slots_three_requests() {
        // C=2: one extracts, one times out on the gate, one is turned away.
        let extractor = Arc::new(MockExtractor::new(Duration::from_millis(500)));
        let service =
            service_with(config(2, Duration::from_millis(100)), Arc::clone(&extractor)).await;

        let spawn = |id: &'static str| {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.extract(id, Document::new(PDF)).await })
        };

        let first = spawn("req_a");
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = spawn("req_b");
        tokio::time::sleep(Duration::from_millis(20)).await;
        let third = spawn("req_c");

        let third = third.await.unwrap().unwrap_err();
        assert_eq!(third.kind(), ErrorKind::AdmissionTimeout);

        let second = second.await.unwrap().unwrap_err();
        assert_eq!(second.kind(), ErrorKind::ExtractionTimeout);

        assert!(first.await.unwrap().is_ok());
        assert_eq!(extractor.calls(), 1);
        assert_idle(&service);
    }

    #[tokio::test]
    async fn abandoned_request_holds_slot_until_worker_finishes() {
        let extractor = Arc::new(MockExtractor::new(Duration::from_millis(150)));
        let service = service_with(config(2, Duration::from_secs(1)), Arc::clone(&extractor)).await;

        let request = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.extract("req_gone", Document::new(PDF)).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(service.gate().is_held());

        // Client disconnect: the request future is dropped mid-extraction.
        request.abort();
        let _ = request.await;
        assert!(service.gate().is_held());
        assert_eq!(service.admission().in_flight(), 1);

        let next = service.extract("req_next", Document::new(PDF)).await;
        assert!(next.is_ok());
        assert!(!extractor.overlapped());
        assert_eq!(extractor.calls(), 2);
        assert_idle(&service);
    }

    #[tokio::test]
    async fn request_dropped_while_queued_leaves_no_state() {
        let extractor = Arc::new(MockExtractor::new(Duration::from_millis(200)));
        let service = service_with(config(2, Duration::from_secs(5)), Arc::clone(&extractor)).await;

        let running = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.extract("req_running", Document::new(PDF)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let queued = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.extract("req_queued", Document::new(PDF)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(service.gate().waiting(), 1);
        assert_eq!(service.admission().in_flight(), 2);

        // Client disconnect before the slot is granted.
        queued.abort();
        assert!(queued.await.unwrap_err().is_cancelled());

        assert_eq!(service.gate().waiting(), 0);
        assert_eq!(service.admission().in_flight(), 1);
        assert!(service.gate().is_held());

        assert!(running.await.unwrap().is_ok());
        assert_eq!(extractor.calls(), 1);
        assert_eq!(service.gate().grants_total(), 1);
        assert_idle(&service);

        // The slot is still grantable after the abandoned wait.
        assert!(service.extract("req_after", Document::new(PDF)).await.is_ok());
        assert_idle(&service);
    }

    #[tokio::test]
    async fn health_reports_busy_without_touching_the_slot() {
        let extractor = Arc::new(MockExtractor::new(Duration::from_millis(200)));
        let service =
            service_with(config(2, Duration::from_millis(50)), Arc::clone(&extractor)).await;

        assert_eq!(service.health().await.status, Health::Ready);

        let running = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.extract("req_long", Document::new(PDF)).await })
        };
        // Longer than the gate timeout.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let snapshot = service.health().await;
        assert!(snapshot.is_live());
        assert_eq!(snapshot.status, Health::Busy);
        assert_eq!(snapshot.slot, SlotState::Held);
        assert_eq!(snapshot.in_flight, 1);
        assert_eq!(snapshot.capacity, 2);
        assert_eq!(snapshot.available, 1);
        assert_eq!(snapshot.version.extractor, "mock");

        assert!(running.await.unwrap().is_ok());
        assert_eq!(service.health().await.status, Health::Ready);
        assert_eq!(service.health().await.extractions_total, 1);
    }

    #[tokio::test]
    async fn starting_service_is_not_live() {
        let service = ExtractionService::new(
            config(1, Duration::from_secs(1)),
            Arc::new(MockExtractor::new(Duration::ZERO)),
        )
        .unwrap();

        assert!(!service.is_live().await);
        service.set_health(Health::Busy).await;
        assert_eq!(service.health().await.status, Health::Starting);

        service.set_health(Health::Ready).await;
        assert!(service.is_live().await);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let result = ExtractionService::new(
            config(0, Duration::from_secs(1)),
            Arc::new(MockExtractor::new(Duration::ZERO)),
        );
        assert!(matches!(result, Err(ConfigError::ZeroConcurrency)));
    }
}
