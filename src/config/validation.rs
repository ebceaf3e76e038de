//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, intervals > 0)
//! - Check timeout ordering (cleanup outlives in-progress)
//! - Check the budget table is monotonic in group size
//! - Bound waits that feed deadline arithmetic
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: EngineConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use thiserror::Error;

use crate::config::schema::{EngineConfig, MAX_POLL_INTERVAL_MS, MAX_TIER_WAIT_MS};

/// A single semantic problem with a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("cleanup timeout ({cleanup}s) must exceed in-progress timeout ({in_progress}s)")]
    CleanupNotAfterInProgress { cleanup: u64, in_progress: u64 },

    #[error("invalid controller URL '{0}'")]
    ControllerUrl(String),

    #[error("budget table is empty")]
    EmptyTiers,

    #[error("budget tier {index} is not monotonic with the tier before it")]
    TierOrder { index: usize },

    #[error("{field} must not exceed {max}ms")]
    TooLarge { field: &'static str, max: u64 },
}

/// Validate a parsed configuration.
pub fn validate_config(config: &EngineConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let sched = &config.scheduler;

    let non_zero: [(&'static str, u64); 7] = [
        ("scheduler.in_progress_timeout_secs", sched.in_progress_timeout_secs),
        ("scheduler.cleanup_interval_secs", sched.cleanup_interval_secs),
        ("scheduler.poll_interval_ms", sched.poll_interval_ms),
        ("scheduler.max_polls", u64::from(sched.max_polls)),
        ("scheduler.reload_concurrency", sched.reload_concurrency as u64),
        ("cache.ttl_secs", config.cache.ttl_secs),
        ("runtime.request_timeout_ms", config.runtime.request_timeout_ms),
    ];
    for (field, value) in non_zero {
        if value == 0 {
            errors.push(ValidationError::Zero { field });
        }
    }

    if sched.cleanup_timeout_secs <= sched.in_progress_timeout_secs {
        errors.push(ValidationError::CleanupNotAfterInProgress {
            cleanup: sched.cleanup_timeout_secs,
            in_progress: sched.in_progress_timeout_secs,
        });
    }

    if url::Url::parse(&config.runtime.controller_url).is_err() {
        errors.push(ValidationError::ControllerUrl(config.runtime.controller_url.clone()));
    }

    if sched.tiers.is_empty() {
        errors.push(ValidationError::EmptyTiers);
    }
    for (index, pair) in sched.tiers.windows(2).enumerate() {
        let (prev, next) = (&pair[0], &pair[1]);
        if next.max_group_size <= prev.max_group_size
            || next.concurrency < prev.concurrency
            || next.max_wait_ms < prev.max_wait_ms
        {
            errors.push(ValidationError::TierOrder { index: index + 1 });
        }
    }
    for tier in &sched.tiers {
        if tier.concurrency == 0 {
            errors.push(ValidationError::Zero { field: "scheduler.tiers.concurrency" });
        }
        if tier.max_wait_ms > MAX_TIER_WAIT_MS {
            errors.push(ValidationError::TooLarge {
                field: "scheduler.tiers.max_wait_ms",
                max: MAX_TIER_WAIT_MS,
            });
        }
    }
    if sched.poll_interval_ms > MAX_POLL_INTERVAL_MS {
        errors.push(ValidationError::TooLarge {
            field: "scheduler.poll_interval_ms",
            max: MAX_POLL_INTERVAL_MS,
        });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
