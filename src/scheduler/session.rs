//! One test session: dispatch probes, apply results as they arrive.
//!
//! # Strategies
//! - Group: a single group-wide trigger runs as its own task while the
//!   session polls the group; ends early once the delay map stops changing
//! - Per proxy: every member is probed individually through a semaphore
//!   sized by the budget; ends when every member has reported
//!
//! Probe and trigger tasks are detached from the supervising task. Stopping
//! a session aborts the supervisor only; late results still land in the
//! delay cache but no longer touch group state.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::cache::DelayCache;
use crate::config::{EngineConfig, ProbeStrategy};
use crate::observability::metrics;
use crate::resilience::timeouts::with_timeout;
use crate::runtime::ProxyRuntime;
use crate::scheduler::budget::ProbeBudget;
use crate::topology::TopologyStore;

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Delays stopped changing.
    Converged,
    /// Every member reported, or the poll limit was reached.
    Completed,
    /// The budget's max wait passed first.
    TimedOut,
    /// Stopped on request or superseded.
    Stopped,
    /// Removed by the cleanup sweep.
    Expired,
}

impl SessionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionOutcome::Converged => "converged",
            SessionOutcome::Completed => "completed",
            SessionOutcome::TimedOut => "timed_out",
            SessionOutcome::Stopped => "stopped",
            SessionOutcome::Expired => "expired",
        }
    }
}

/// Scheduler-side record of a running session.
pub struct SessionHandle {
    pub id: u64,
    pub name: String,
    pub started_at: Instant,
    pub max_wait_deadline: Instant,
    active: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    pub(crate) fn new(id: u64, name: String, budget: ProbeBudget, active: Arc<AtomicBool>) -> Self {
        let started_at = Instant::now();
        Self {
            id,
            name,
            started_at,
            max_wait_deadline: started_at + budget.max_wait,
            active,
            task: None,
        }
    }

    pub(crate) fn attach(&mut self, task: JoinHandle<()>) {
        self.task = Some(task);
    }

    /// Stop applying results and abort the supervising task.
    pub(crate) fn cancel(&self) {
        self.active.store(false, Ordering::Release);
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

/// Everything a supervising task needs.
pub(crate) struct SessionContext {
    pub index: usize,
    pub name: String,
    pub members: Vec<String>,
    pub budget: ProbeBudget,
    pub active: Arc<AtomicBool>,
    pub runtime: Arc<dyn ProxyRuntime>,
    pub store: Arc<TopologyStore>,
    pub cache: DelayCache,
    pub query_permits: Arc<Semaphore>,
    pub config: Arc<EngineConfig>,
}

impl SessionContext {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) async fn run(&self) -> SessionOutcome {
        match self.config.scheduler.strategy {
            ProbeStrategy::Group => self.run_group().await,
            ProbeStrategy::PerProxy => self.run_per_proxy().await,
        }
    }

    async fn run_group(&self) -> SessionOutcome {
        let deadline = Instant::now() + self.budget.max_wait;
        let trigger = self.spawn_trigger();

        let scheduler = &self.config.scheduler;
        let interval = scheduler.poll_interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        let mut last: Option<BTreeMap<String, i32>> = None;
        let mut stable = 0;

        for _ in 0..scheduler.max_polls {
            if tokio::time::timeout_at(deadline, ticker.tick()).await.is_err() {
                return SessionOutcome::TimedOut;
            }
            let Some(delays) = self.poll().await else {
                stable = 0;
                continue;
            };

            if last.as_ref() == Some(&delays) {
                // Unchanged polls only count once the runtime finished probing.
                if trigger.is_finished() {
                    stable += 1;
                    if stable >= scheduler.stable_polls_required {
                        return SessionOutcome::Converged;
                    }
                }
            } else {
                stable = 0;
                last = Some(delays);
            }
        }
        SessionOutcome::Completed
    }

    fn spawn_trigger(&self) -> JoinHandle<()> {
        let runtime = Arc::clone(&self.runtime);
        let name = self.name.clone();
        let wait = self.budget.max_wait;
        tokio::spawn(async move {
            if let Err(e) = with_timeout(wait, runtime.trigger_health_check(&name)).await {
                metrics::record_runtime_error("trigger_health_check");
                tracing::warn!(group = %name, error = %e, "Health check trigger failed");
            }
        })
    }

    /// Query the group once and apply what it reports.
    async fn poll(&self) -> Option<BTreeMap<String, i32>> {
        let info = {
            let _permit = self.query_permits.acquire().await.ok()?;
            let query = self.runtime.query_group(&self.name, self.config.view.sort);
            with_timeout(self.config.runtime.request_timeout(), query).await
        };
        let info = match info {
            Ok(info) => info,
            Err(e) => {
                metrics::record_runtime_error("query_group");
                tracing::warn!(group = %self.name, error = %e, "Poll failed");
                return None;
            }
        };

        let delays: BTreeMap<String, i32> = info
            .proxies
            .iter()
            .map(|p| (p.name.clone(), p.delay))
            .collect();
        for (proxy, &delay) in &delays {
            self.cache.put(proxy, delay);
            metrics::record_delay(delay);
        }

        if self.is_active() {
            self.store.apply_delays(self.index, &self.name, &delays);
            if let Some(now) = info.now() {
                self.store.set_selection(self.index, &self.name, now);
            }
        }
        Some(delays)
    }

    async fn run_per_proxy(&self) -> SessionOutcome {
        let deadline = Instant::now() + self.budget.max_wait;
        let semaphore = Arc::new(Semaphore::new(self.budget.concurrency));
        let (tx, mut rx) = mpsc::channel(self.members.len().max(1));
        let probe_deadline = std::time::Duration::from_millis(self.config.runtime.probe_timeout_ms)
            + self.config.runtime.request_timeout();

        for proxy in &self.members {
            let runtime = Arc::clone(&self.runtime);
            let cache = self.cache.clone();
            let semaphore = Arc::clone(&semaphore);
            let tx = tx.clone();
            let proxy = proxy.clone();

            tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                let delay = match with_timeout(probe_deadline, runtime.probe_proxy(&proxy)).await {
                    Ok(delay) => delay,
                    Err(e) => {
                        metrics::record_runtime_error("probe_proxy");
                        tracing::debug!(proxy = %proxy, error = %e, "Probe failed");
                        0
                    }
                };
                cache.put(&proxy, delay);
                metrics::record_delay(delay);
                let _ = tx.send((proxy, delay)).await;
            });
        }
        drop(tx);

        let mut pending = self.members.len();
        while pending > 0 {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some((proxy, delay))) => {
                    pending -= 1;
                    if self.is_active() {
                        self.store.apply_delay(self.index, &self.name, &proxy, delay);
                    }
                }
                Ok(None) => break,
                Err(_) => return SessionOutcome::TimedOut,
            }
        }
        SessionOutcome::Completed
    }
}
