//! Single-flight gate: one processing slot, held by at most one request.
//!
//! The slot is a single token circulating through a capacity-1 channel. Holding
//! the token is holding the slot. Waiters queue on the receiver mutex, which
//! tokio hands out in FIFO order, so each release wakes exactly one waiter.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{Mutex, mpsc};

/// Observable state of the processing slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotState {
    Free,
    Held,
}

/// The one token in circulation. Never cloned.
#[derive(Debug)]
struct SlotToken {
    grant: u64,
}

/// Returned when the slot could not be acquired within the wait budget.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("processing slot not available within {waited:?}")]
pub struct GateTimedOut {
    pub waited: Duration,
}

/// Holder of the processing slot. Dropping it releases the slot.
#[must_use = "dropping the guard releases the processing slot immediately"]
#[derive(Debug)]
pub struct SlotGuard {
    token: Option<SlotToken>,
    return_tx: mpsc::Sender<SlotToken>,
    held: Arc<AtomicBool>,
    acquired_at: Instant,
    waited: Duration,
}

impl SlotGuard {
    /// Sequence number of this grant (1 for the first holder).
    pub fn grant(&self) -> u64 {
        self.token.as_ref().map(|t| t.grant).unwrap_or_default()
    }

    /// How long the holder waited before the slot was granted.
    pub fn waited(&self) -> Duration {
        self.waited
    }

    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// Release the slot now. Equivalent to dropping the guard.
    pub fn release(self) -> Duration {
        self.held_for()
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };

        // Clear the flag before the token goes back so the next holder never
        // observes a stale Held.
        if !self.held.swap(false, Ordering::AcqRel) {
            debug_assert!(false, "processing slot released while already free");
            tracing::error!(
                grant = token.grant,
                "Bug: processing slot released while already free"
            );
        }

        let grant = token.grant;
        if let Err(e) = self.return_tx.try_send(token) {
            // Capacity is 1 and only this guard owns the token, so the channel
            // can only be full if a second token was minted.
            debug_assert!(false, "processing slot channel rejected the token");
            tracing::error!(grant, error = %e, "Bug: failed to return processing slot");
            return;
        }

        tracing::debug!(grant, held_for = ?self.acquired_at.elapsed(), "Processing slot released");
    }
}

/// Decrements the waiter count when a wait ends, including when the waiting
/// future is dropped by a timeout or a disconnected client.
struct WaitingGuard<'a>(&'a AtomicUsize);

impl<'a> WaitingGuard<'a> {
    fn enter(count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, Ordering::AcqRel);
        Self(count)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Process-wide mutual exclusion for the extraction worker.
pub struct SingleFlightGate {
    available_rx: Mutex<mpsc::Receiver<SlotToken>>,
    available_tx: mpsc::Sender<SlotToken>,
    held: Arc<AtomicBool>,
    grants: AtomicU64,
    waiting: AtomicUsize,
}

impl SingleFlightGate {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        if let Err(e) = tx.try_send(SlotToken { grant: 0 }) {
            tracing::error!(error = %e, "Failed to seed processing slot");
        }

        Self {
            available_rx: Mutex::new(rx),
            available_tx: tx,
            held: Arc::new(AtomicBool::new(false)),
            grants: AtomicU64::new(0),
            waiting: AtomicUsize::new(0),
        }
    }

    /// Acquire the slot, waiting at most `timeout`.
    ///
    /// A zero timeout still succeeds when the slot is free. A timed-out waiter
    /// leaves the gate exactly as it found it.
    pub async fn acquire(&self, timeout: Duration) -> Result<SlotGuard, GateTimedOut> {
        let started = Instant::now();
        let waiting = WaitingGuard::enter(&self.waiting);

        let received = tokio::time::timeout(timeout, async {
            let mut rx = self.available_rx.lock().await;
            rx.recv().await
        })
        .await;
        drop(waiting);

        match received {
            Ok(Some(token)) => Ok(self.hold(token, started.elapsed())),
            Ok(None) => {
                // The gate owns a sender, so the channel cannot close.
                tracing::error!("Bug: processing slot channel closed");
                Err(GateTimedOut {
                    waited: started.elapsed(),
                })
            }
            Err(_) => {
                tracing::debug!(
                    waited = ?started.elapsed(),
                    "Timed out waiting for processing slot"
                );
                Err(GateTimedOut {
                    waited: started.elapsed(),
                })
            }
        }
    }

    fn hold(&self, mut token: SlotToken, waited: Duration) -> SlotGuard {
        if self.held.swap(true, Ordering::AcqRel) {
            debug_assert!(false, "processing slot granted while already held");
            tracing::error!("Bug: processing slot granted while already held");
        }

        token.grant = self.grants.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::debug!(grant = token.grant, ?waited, "Processing slot acquired");

        SlotGuard {
            token: Some(token),
            return_tx: self.available_tx.clone(),
            held: Arc::clone(&self.held),
            acquired_at: Instant::now(),
            waited,
        }
    }

    pub fn state(&self) -> SlotState {
        if self.held.load(Ordering::Acquire) {
            SlotState::Held
        } else {
            SlotState::Free
        }
    }

    pub fn is_held(&self) -> bool {
        self.state() == SlotState::Held
    }

    /// Number of requests currently suspended in `acquire`.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::Acquire)
    }

    /// Total grants since start.
    pub fn grants_total(&self) -> u64 {
        self.grants.load(Ordering::Acquire)
    }
}

impl Default for SingleFlightGate {
    fn default() -> Self {
        Self::new()
    }
}
