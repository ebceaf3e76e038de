//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Scheduler, synchronizer, cache and coordinator produce:
//!     → logging.rs (structured log events via `tracing`)
//!     → metrics.rs (counters, gauges, histograms via `metrics`)
//!
//! Consumers:
//!     → stdout (fmt layer, filtered by RUST_LOG or config)
//!     → Prometheus scrape endpoint (optional)
//! ```
//!
//! # Design Decisions
//! - Structured fields (group, index, session) on every event
//! - Metrics are cheap (atomic increments behind the `metrics` facade)
//! - Without an installed recorder metric calls are no-ops

pub mod logging;
pub mod metrics;
