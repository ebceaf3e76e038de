//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → EngineConfig (validated, immutable)
//!     → shared via SharedConfig to scheduler and synchronizer
//!
//! On file change:
//!     watcher.rs detects change, drops unchanged or invalid files
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → coordinator layers overrides.rs (CLI flags, runtime toggles)
//!     → stores it into SharedConfig (atomic swap)
//!     → components read the new values on their next operation
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require full reload
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod overrides;
pub mod schema;
pub mod validation;
pub mod watcher;

use arc_swap::ArcSwap;
use std::sync::Arc;

pub use overrides::ConfigOverrides;
pub use schema::{
    BudgetTier, CacheConfig, EngineConfig, ObservabilityConfig, ProbeStrategy, ProxySort,
    RuntimeConfig, SchedulerConfig, ViewConfig,
};

/// Hot-swappable configuration handle passed to components at construction.
pub type SharedConfig = Arc<ArcSwap<EngineConfig>>;

/// Wrap a configuration into a shared handle.
pub fn shared(config: EngineConfig) -> SharedConfig {
    Arc::new(ArcSwap::from_pointee(config))
}
