//! Health-check and selection-state engine for nested proxy groups.

pub mod cache;
pub mod config;
pub mod engine;
pub mod lifecycle;
pub mod observability;
pub mod resilience;
pub mod resolver;
pub mod runtime;
pub mod scheduler;
pub mod state;
pub mod topology;

pub use config::schema::EngineConfig;
pub use engine::{Engine, EngineHandle, Intent};
pub use lifecycle::Shutdown;
