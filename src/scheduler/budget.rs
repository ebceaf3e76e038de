//! Probe budget per group size.

use std::time::Duration;

use crate::config::schema::MAX_TIER_WAIT_MS;
use crate::config::BudgetTier;

const FALLBACK: ProbeBudget = ProbeBudget {
    concurrency: 8,
    max_wait: Duration::from_secs(8),
};

/// Concurrency and wait limits for one test session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeBudget {
    pub concurrency: usize,
    pub max_wait: Duration,
}

impl ProbeBudget {
    /// First tier whose `max_group_size` covers `size`; the last tier
    /// covers anything larger. The wait is clamped to `MAX_TIER_WAIT_MS`.
    pub fn for_group_size(size: usize, tiers: &[BudgetTier]) -> Self {
        tiers
            .iter()
            .find(|tier| size <= tier.max_group_size)
            .or_else(|| tiers.last())
            .map(|tier| ProbeBudget {
                concurrency: tier.concurrency.max(1),
                max_wait: Duration::from_millis(tier.max_wait_ms.min(MAX_TIER_WAIT_MS)),
            })
            .unwrap_or(FALLBACK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;

    #[test]
    fn test_default_tiers() {
        let tiers = SchedulerConfig::default().tiers;
        let budget = |size| ProbeBudget::for_group_size(size, &tiers);

        assert_eq!(budget(1), ProbeBudget { concurrency: 8, max_wait: Duration::from_secs(8) });
        assert_eq!(budget(50).concurrency, 8);
        assert_eq!(budget(51).concurrency, 12);
        assert_eq!(budget(200).max_wait, Duration::from_secs(16));
        assert_eq!(budget(201), ProbeBudget { concurrency: 20, max_wait: Duration::from_secs(20) });
        assert_eq!(budget(10_000).concurrency, 20);
    }

    #[test]
    fn test_monotonic_in_size() {
        let tiers = SchedulerConfig::default().tiers;
        let mut last = ProbeBudget::for_group_size(0, &tiers);
        for size in 1..400 {
            let next = ProbeBudget::for_group_size(size, &tiers);
            assert!(next.concurrency >= last.concurrency);
            assert!(next.max_wait >= last.max_wait);
            last = next;
        }
    }

    #[test]
    fn test_short_table_uses_last_row() {
        let tiers = vec![BudgetTier { max_group_size: 10, concurrency: 2, max_wait_ms: 1_000 }];
        assert_eq!(ProbeBudget::for_group_size(500, &tiers).concurrency, 2);
        assert_eq!(ProbeBudget::for_group_size(3, &[]), FALLBACK);
    }

    #[test]
    fn test_wait_is_clamped() {
        let tiers = vec![BudgetTier { max_group_size: 10, concurrency: 2, max_wait_ms: u64::MAX }];
        assert_eq!(
            ProbeBudget::for_group_size(3, &tiers).max_wait,
            Duration::from_millis(MAX_TIER_WAIT_MS)
        );
    }
}
