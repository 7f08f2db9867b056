//! Bounded Uniform Sampling Containers
//!
//! Fixed-capacity containers for unbounded telemetry event streams. A
//! [`Reservoir`] keeps an at-most-N, statistically representative random
//! subset of everything offered to it; an [`EventQueue`] adds the bookkeeping
//! every telemetry producer needs on top of that (seen/limit/overflow counts,
//! drain-and-reset at harvest boundaries, merge-back after a failed harvest,
//! and payload splitting so no single outbound payload is unboundedly large).
//!
//! These are purely synchronous, single-threaded data structures. Callers
//! that share them across threads must provide their own locking; no method
//! here is reentrant-safe by itself.

mod event_queue;
mod reservoir;

pub use event_queue::{EventQueue, EventSegment};
pub use reservoir::Reservoir;
