//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     Signal received → coordinator stops all test sessions → exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Every long-running task subscribes to one broadcast channel
//! - Dispatched runtime calls are not awaited on shutdown

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
