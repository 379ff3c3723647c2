//! Concurrency control for extraction requests.
//!
//! Two layers, always acquired in this order and released in reverse:
//! - `AdmissionController` bounds how many requests are in flight.
//! - `SingleFlightGate` lets exactly one admitted request run the extractor.
//!
//! Both hand out RAII guards (`AdmissionTicket`, `SlotGuard`); release happens
//! on drop, so every exit path gives the capacity back.

mod admission;
mod slot;

pub use admission::{AdmissionController, AdmissionPolicy, AdmissionRejected, AdmissionTicket};
pub use slot::{GateTimedOut, SingleFlightGate, SlotGuard, SlotState};
