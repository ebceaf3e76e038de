//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Call into the proxy runtime:
//!     → timeouts.rs (every call has a deadline)
//!     → On failure: caller logs, degrades to "unknown", retries on its own schedule
//!     → backoff.rs (spacing for startup topology prefetch)
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every external call has a deadline
//! - Failures are swallowed at the lowest level that can make progress

pub mod backoff;
pub mod timeouts;
