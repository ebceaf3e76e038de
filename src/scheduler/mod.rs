//! Health-check scheduling.
//!
//! # Data Flow
//! ```text
//! request_test(index)
//!     → coalesce with a running session younger than the in-progress timeout
//!     → budget.rs (concurrency and max wait from group size)
//!     → session.rs supervising task
//!         → runtime trigger / probes
//!         → DelayCache + TopologyStore (per result, as it arrives)
//!     → finish: session removed, testing cleared
//! ```
//!
//! # Design Decisions
//! - At most one session per group index
//! - A group's `testing` flag is only written while its session entry is
//!   locked, so the flag always agrees with the session table
//! - `request_test` never waits on the runtime
//! - Sessions that never finish are reaped by `cleanup_stale`

pub mod budget;
pub mod session;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::cache::DelayCache;
use crate::config::SharedConfig;
use crate::observability::metrics;
use crate::runtime::ProxyRuntime;
use crate::topology::TopologyStore;

pub use budget::ProbeBudget;
pub use session::{SessionHandle, SessionOutcome};

use session::SessionContext;

/// Why a test request did not start a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    UnknownGroup,
    EmptyGroup,
}

/// What `request_test` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestRequest {
    Started { session: u64 },
    Coalesced { session: u64 },
    /// Every member already has a fresh cached delay.
    Skipped,
    Rejected(RejectReason),
}

pub struct HealthCheckScheduler {
    runtime: Arc<dyn ProxyRuntime>,
    store: Arc<TopologyStore>,
    cache: DelayCache,
    config: SharedConfig,
    query_permits: Arc<Semaphore>,
    sessions: DashMap<usize, SessionHandle>,
    next_id: AtomicU64,
}

impl HealthCheckScheduler {
    pub fn new(
        runtime: Arc<dyn ProxyRuntime>,
        store: Arc<TopologyStore>,
        cache: DelayCache,
        config: SharedConfig,
        query_permits: Arc<Semaphore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            store,
            cache,
            config,
            query_permits,
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
        })
    }

    /// Start a test session for `index` unless one is already running.
    pub fn request_test(self: &Arc<Self>, index: usize) -> TestRequest {
        let Some(group) = self.store.group(index) else {
            return TestRequest::Rejected(RejectReason::UnknownGroup);
        };
        if group.proxies.is_empty() {
            return TestRequest::Rejected(RejectReason::EmptyGroup);
        }

        let config = self.config.load_full();
        let budget = ProbeBudget::for_group_size(group.proxies.len(), &config.scheduler.tiers);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(true));

        match self.sessions.entry(index) {
            Entry::Occupied(mut entry) => {
                let running = entry.get();
                if running.started_at.elapsed() < config.scheduler.in_progress_timeout() {
                    tracing::debug!(index, group = %group.name, session = running.id, "Test already running");
                    return TestRequest::Coalesced { session: running.id };
                }
                tracing::warn!(index, group = %group.name, session = running.id, "Replacing overdue session");
                running.cancel();
                metrics::record_session(SessionOutcome::Stopped.as_str());
                self.store.set_testing(index, &group.name, true);
                entry.insert(SessionHandle::new(id, group.name.clone(), budget, Arc::clone(&active)));
            }
            Entry::Vacant(entry) => {
                self.store.set_testing(index, &group.name, true);
                entry.insert(SessionHandle::new(id, group.name.clone(), budget, Arc::clone(&active)));
            }
        }
        tracing::info!(
            index,
            group = %group.name,
            session = id,
            members = group.proxies.len(),
            concurrency = budget.concurrency,
            max_wait_ms = budget.max_wait.as_millis() as u64,
            "Test session started"
        );

        let ctx = SessionContext {
            index,
            name: group.name,
            members: group.proxies.into_iter().map(|p| p.name).collect(),
            budget,
            active,
            runtime: Arc::clone(&self.runtime),
            store: Arc::clone(&self.store),
            cache: self.cache.clone(),
            query_permits: Arc::clone(&self.query_permits),
            config,
        };
        let scheduler = Arc::clone(self);
        let task = tokio::spawn(async move {
            let outcome = ctx.run().await;
            scheduler.finish(ctx.index, id, outcome);
        });

        // The task may already have finished and removed its entry.
        if let Some(mut handle) = self.sessions.get_mut(&index) {
            if handle.id == id {
                handle.attach(task);
            }
        }
        metrics::record_active_sessions(self.sessions.len());
        TestRequest::Started { session: id }
    }

    /// Like `request_test`, but skipped while every member has a fresh
    /// cached delay.
    pub fn request_background_test(self: &Arc<Self>, index: usize) -> TestRequest {
        if let Some(group) = self.store.group(index) {
            if !group.proxies.is_empty()
                && self.cache.is_fresh_for_all(group.proxies.iter().map(|p| p.name.as_str()))
            {
                tracing::debug!(index, group = %group.name, "Cached delays fresh; background test skipped");
                return TestRequest::Skipped;
            }
        }
        self.request_test(index)
    }

    fn finish(&self, index: usize, id: u64, outcome: SessionOutcome) {
        let handle = match self.sessions.entry(index) {
            Entry::Occupied(entry) if entry.get().id == id => {
                self.store.set_testing(index, &entry.get().name, false);
                entry.remove()
            }
            _ => return,
        };
        metrics::record_session(outcome.as_str());
        metrics::record_active_sessions(self.sessions.len());
        tracing::info!(
            index,
            group = %handle.name,
            session = id,
            outcome = outcome.as_str(),
            elapsed_ms = handle.started_at.elapsed().as_millis() as u64,
            "Test session finished"
        );
    }

    fn stop_with(&self, index: usize, outcome: SessionOutcome) -> bool {
        let handle = match self.sessions.entry(index) {
            Entry::Occupied(entry) => {
                self.store.set_testing(index, &entry.get().name, false);
                entry.remove()
            }
            Entry::Vacant(_) => return false,
        };
        handle.cancel();
        metrics::record_session(outcome.as_str());
        metrics::record_active_sessions(self.sessions.len());
        tracing::info!(index, group = %handle.name, session = handle.id, outcome = outcome.as_str(), "Test session stopped");
        true
    }

    /// Force the session for `index` idle. Returns whether one was running.
    pub fn stop_test(&self, index: usize) -> bool {
        self.stop_with(index, SessionOutcome::Stopped)
    }

    /// Stop every session. Returns how many were running.
    pub fn stop_all(&self) -> usize {
        let indices: Vec<usize> = self.sessions.iter().map(|entry| *entry.key()).collect();
        indices
            .into_iter()
            .filter(|&index| self.stop_with(index, SessionOutcome::Stopped))
            .count()
    }

    /// Stop every session older than the cleanup timeout.
    pub fn cleanup_stale(&self) -> usize {
        let timeout = self.config.load().scheduler.cleanup_timeout();
        let stale: Vec<usize> = self
            .sessions
            .iter()
            .filter(|entry| entry.started_at.elapsed() >= timeout)
            .map(|entry| *entry.key())
            .collect();

        let stopped = stale
            .into_iter()
            .filter(|&index| self.stop_with(index, SessionOutcome::Expired))
            .count();
        if stopped > 0 {
            tracing::warn!(stopped, "Cleaned up stale test sessions");
        }
        stopped
    }

    pub fn is_testing(&self, index: usize) -> bool {
        self.sessions.contains_key(&index)
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }
}
