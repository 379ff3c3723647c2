//! Admission control in front of the processing slot.
//!
//! Bounds how many requests may be in flight at once, counting both the one
//! holding the slot and those queued on it. Excess requests either wait for
//! capacity up to a budget or are turned away immediately.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// What to do with a request that arrives while the service is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionPolicy {
    /// Turn the request away without waiting.
    Reject,
    /// Wait up to the given budget for capacity to free up.
    Wait(Duration),
}

impl AdmissionPolicy {
    /// A zero budget means reject immediately.
    pub fn from_wait(budget: Duration) -> Self {
        if budget.is_zero() {
            Self::Reject
        } else {
            Self::Wait(budget)
        }
    }
}

/// Request could not be admitted.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("service at capacity ({in_flight}/{capacity} requests in flight)")]
pub struct AdmissionRejected {
    pub in_flight: usize,
    pub capacity: usize,
    pub waited: Duration,
}

/// One request's right to proceed toward the processing slot.
///
/// Not `Clone`. Dropping the ticket returns its capacity to the controller.
#[must_use = "dropping the ticket releases the admission immediately"]
#[derive(Debug)]
pub struct AdmissionTicket {
    number: u64,
    issued_at: Instant,
    deadline: Instant,
    _permit: OwnedSemaphorePermit,
}

impl AdmissionTicket {
    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn issued_at(&self) -> Instant {
        self.issued_at
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left before the deadline, zero once it has passed.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn age(&self) -> Duration {
        self.issued_at.elapsed()
    }
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        tracing::debug!(ticket = self.number, age = ?self.age(), "Admission released");
    }
}

/// Process-wide admission counter with a fixed ceiling.
pub struct AdmissionController {
    permits: Arc<Semaphore>,
    capacity: usize,
    policy: AdmissionPolicy,
    ticket_budget: Duration,
    issued: AtomicU64,
    rejected: AtomicU64,
}

impl AdmissionController {
    /// `ticket_budget` sets each ticket's deadline relative to its issue time.
    pub fn new(capacity: usize, policy: AdmissionPolicy, ticket_budget: Duration) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            policy,
            ticket_budget,
            issued: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Admit under the configured policy.
    pub async fn try_admit(&self) -> Result<AdmissionTicket, AdmissionRejected> {
        match self.policy {
            AdmissionPolicy::Reject => self.admit_within(Duration::ZERO).await,
            AdmissionPolicy::Wait(budget) => self.admit_within(budget).await,
        }
    }

    /// Admit, waiting at most `timeout` for capacity.
    ///
    /// On timeout the counter is left unchanged.
    pub async fn admit_within(
        &self,
        timeout: Duration,
    ) -> Result<AdmissionTicket, AdmissionRejected> {
        let started = Instant::now();

        let permit = match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => Some(permit),
            Err(_) if timeout.is_zero() => None,
            Err(_) => tokio::time::timeout(timeout, Arc::clone(&self.permits).acquire_owned())
                .await
                .ok()
                .and_then(Result::ok),
        };

        let Some(permit) = permit else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            let rejected = AdmissionRejected {
                in_flight: self.in_flight(),
                capacity: self.capacity,
                waited: started.elapsed(),
            };
            tracing::debug!(
                in_flight = rejected.in_flight,
                capacity = rejected.capacity,
                waited = ?rejected.waited,
                "Admission rejected"
            );
            return Err(rejected);
        };

        let issued_at = Instant::now();
        let number = self.issued.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(ticket = number, waited = ?started.elapsed(), "Admitted");

        Ok(AdmissionTicket {
            number,
            issued_at,
            deadline: issued_at + self.ticket_budget,
            _permit: permit,
        })
    }

    /// Requests currently holding a ticket.
    pub fn in_flight(&self) -> usize {
        self.capacity.saturating_sub(self.permits.available_permits())
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> AdmissionPolicy {
        self.policy
    }

    /// Total rejections since start.
    pub fn rejected_total(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn issued_total(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }
}
