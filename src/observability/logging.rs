//! Structured logging.
//!
//! Uses `tracing` with an env-filter: `RUST_LOG` wins, otherwise the
//! configured level applies to this crate.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the global tracing subscriber.
///
/// Calling this twice is harmless; the second installation is ignored.
pub fn init_logging(level: &str) {
    let fallback = format!("proxy_health={level},warn");
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| fallback.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
