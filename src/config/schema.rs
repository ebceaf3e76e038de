//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the engine.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration for the health-check engine.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    /// Proxy runtime controller settings.
    pub runtime: RuntimeConfig,

    /// Health-check scheduling settings.
    pub scheduler: SchedulerConfig,

    /// Delay cache settings.
    pub cache: CacheConfig,

    /// How group state is presented to consumers.
    pub view: ViewConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Proxy runtime controller configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// External controller base URL (e.g., "http://127.0.0.1:9090").
    pub controller_url: String,

    /// Optional bearer secret for the controller.
    pub secret: Option<String>,

    /// Deadline for a single controller request in milliseconds.
    pub request_timeout_ms: u64,

    /// URL the runtime probes through each proxy.
    pub probe_url: String,

    /// Per-proxy probe timeout passed to the runtime, in milliseconds.
    pub probe_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            controller_url: "http://127.0.0.1:9090".to_string(),
            secret: None,
            request_timeout_ms: 5_000,
            probe_url: "https://www.gstatic.com/generate_204".to_string(),
            probe_timeout_ms: 5_000,
        }
    }
}

impl RuntimeConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// How a test session obtains delays from the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStrategy {
    /// One group-wide trigger, then poll the group until it settles.
    #[default]
    Group,
    /// Probe every member individually, bounded by the concurrency budget.
    PerProxy,
}

/// Longest wait a budget tier may grant a session (one hour).
pub const MAX_TIER_WAIT_MS: u64 = 3_600_000;

/// Longest interval allowed between session polls (one minute).
pub const MAX_POLL_INTERVAL_MS: u64 = 60_000;

/// One row of the group-size budget table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct BudgetTier {
    /// Largest group size (inclusive) this tier applies to.
    pub max_group_size: usize,

    /// Concurrent probe calls allowed.
    pub concurrency: usize,

    /// Maximum time a session may wait for results, in milliseconds.
    /// At most `MAX_TIER_WAIT_MS`.
    pub max_wait_ms: u64,
}

/// Health-check scheduler configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// A running session younger than this coalesces new requests.
    pub in_progress_timeout_secs: u64,

    /// A session older than this is forcibly stopped by the cleanup sweep.
    pub cleanup_timeout_secs: u64,

    /// Interval between cleanup sweeps.
    pub cleanup_interval_secs: u64,

    /// Interval between group polls while a session runs.
    pub poll_interval_ms: u64,

    /// Upper bound on polls per session.
    pub max_polls: u32,

    /// Consecutive unchanged polls after which a session is converged.
    pub stable_polls_required: u32,

    /// Probe strategy.
    pub strategy: ProbeStrategy,

    /// Permits shared by all group queries (reloads and polls).
    ///
    /// Read once when the engine is built; a hot reload does not resize
    /// the permit pool.
    pub reload_concurrency: usize,

    /// Attempts made to fetch a non-empty topology at startup.
    pub prefetch_attempts: u32,

    /// Base delay for prefetch backoff in milliseconds.
    pub prefetch_base_delay_ms: u64,

    /// Group-size budget table, ordered by `max_group_size`.
    /// Groups larger than the last row use the last row.
    pub tiers: Vec<BudgetTier>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            in_progress_timeout_secs: 60,
            cleanup_timeout_secs: 90,
            cleanup_interval_secs: 5,
            poll_interval_ms: 500,
            max_polls: 30,
            stable_polls_required: 2,
            strategy: ProbeStrategy::Group,
            reload_concurrency: 8,
            prefetch_attempts: 10,
            prefetch_base_delay_ms: 200,
            tiers: default_tiers(),
        }
    }
}

fn default_tiers() -> Vec<BudgetTier> {
    vec![
        BudgetTier { max_group_size: 50, concurrency: 8, max_wait_ms: 8_000 },
        BudgetTier { max_group_size: 100, concurrency: 12, max_wait_ms: 12_000 },
        BudgetTier { max_group_size: 200, concurrency: 16, max_wait_ms: 16_000 },
        BudgetTier { max_group_size: usize::MAX, concurrency: 20, max_wait_ms: 20_000 },
    ]
}

impl SchedulerConfig {
    pub fn in_progress_timeout(&self) -> Duration {
        Duration::from_secs(self.in_progress_timeout_secs)
    }

    pub fn cleanup_timeout(&self) -> Duration {
        Duration::from_secs(self.cleanup_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.min(MAX_POLL_INTERVAL_MS))
    }
}

/// Delay cache configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Time-to-live of a cached delay in seconds.
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl_secs: 30 }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Ordering the runtime applies to a group's members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProxySort {
    #[default]
    Default,
    Title,
    Delay,
}

/// Presentation settings for published group state.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ViewConfig {
    /// Sort mode requested from the runtime on every group query.
    pub sort: ProxySort,

    /// Re-sort published groups by delay as results arrive.
    pub sort_by_delay: bool,

    /// Debounce window for delay re-sorts in milliseconds.
    pub sort_debounce_ms: u64,

    /// Only expose groups that accept manual selection.
    pub exclude_not_selectable: bool,
}

impl Default for ViewConfig {
    fn default() -> Self {
        Self {
            sort: ProxySort::Default,
            sort_by_delay: false,
            sort_debounce_ms: 200,
            exclude_not_selectable: false,
        }
    }
}

impl ViewConfig {
    pub fn sort_debounce(&self) -> Duration {
        Duration::from_millis(self.sort_debounce_ms)
    }
}

/// Observability configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9464".to_string(),
        }
    }
}
