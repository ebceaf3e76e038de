//! Engine coordinator.
//!
//! # Data Flow
//! ```text
//! EngineHandle ──Intent──▶ coordinator task (tokio::select!)
//!                              ├── ReloadAll / Reload   → runtime query → TopologyStore
//!                              ├── Select               → runtime patch → TopologyStore
//!                              ├── UrlTest / Stop*      → HealthCheckScheduler
//!                              ├── RefreshTopology      → cascade: sessions, cache, store
//!                              ├── cleanup ticker       → stale sessions, expired delays
//!                              ├── config updates       → overrides layered, SharedConfig swap
//!                              └── shutdown             → stop all sessions, exit
//! ```
//!
//! # Design Decisions
//! - One task consumes every intent; work that waits on the runtime is
//!   spawned so the queue keeps moving
//! - Group queries from reloads and session polls share one semaphore

pub mod command;

use futures_util::future::join_all;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::cache::DelayCache;
use crate::config::{ConfigOverrides, EngineConfig, SharedConfig};
use crate::lifecycle::Shutdown;
use crate::observability::metrics;
use crate::resilience::backoff::Backoff;
use crate::resilience::timeouts::with_timeout;
use crate::resolver::{resolve_endpoint, Endpoint, RuntimeLookup};
use crate::runtime::{ProxyRuntime, RuntimeResult, TunnelMode};
use crate::scheduler::{HealthCheckScheduler, TestRequest};
use crate::state::{GroupState, StateEvent, StateSynchronizer};
use crate::topology::model::{Proxy, ProxyGroup};
use crate::topology::TopologyStore;

pub use command::{EngineError, EngineHandle, EngineResult, Intent};

const INTENT_CAPACITY: usize = 64;
const PREFETCH_MAX_DELAY: Duration = Duration::from_secs(5);

/// The assembled health-check engine.
pub struct Engine {
    runtime: Arc<dyn ProxyRuntime>,
    config: SharedConfig,
    sync: Arc<StateSynchronizer>,
    store: Arc<TopologyStore>,
    cache: DelayCache,
    scheduler: Arc<HealthCheckScheduler>,
    query_permits: Arc<Semaphore>,
    overrides: Mutex<ConfigOverrides>,
}

impl Engine {
    /// Wire up every component. Must be called inside a tokio runtime.
    pub fn new(runtime: Arc<dyn ProxyRuntime>, config: SharedConfig) -> Arc<Self> {
        Self::with_overrides(runtime, config, ConfigOverrides::default())
    }

    /// Like `new`, with settings that outrank every config file reload.
    pub fn with_overrides(
        runtime: Arc<dyn ProxyRuntime>,
        config: SharedConfig,
        overrides: ConfigOverrides,
    ) -> Arc<Self> {
        if !overrides.is_empty() {
            config.rcu(|current| overrides.applied_to(current));
        }
        let query_permits = Arc::new(Semaphore::new(
            config.load().scheduler.reload_concurrency.max(1),
        ));
        let sync = StateSynchronizer::new(Arc::clone(&config));
        let store = Arc::new(TopologyStore::new(Arc::clone(&sync)));
        let cache = DelayCache::new(Arc::clone(&config));
        let scheduler = HealthCheckScheduler::new(
            Arc::clone(&runtime),
            Arc::clone(&store),
            cache.clone(),
            Arc::clone(&config),
            Arc::clone(&query_permits),
        );

        Arc::new(Self {
            runtime,
            config,
            sync,
            store,
            cache,
            scheduler,
            query_permits,
            overrides: Mutex::new(overrides),
        })
    }

    pub fn config(&self) -> Arc<EngineConfig> {
        self.config.load_full()
    }

    pub fn store(&self) -> &Arc<TopologyStore> {
        &self.store
    }

    pub fn cache(&self) -> &DelayCache {
        &self.cache
    }

    pub fn scheduler(&self) -> &Arc<HealthCheckScheduler> {
        &self.scheduler
    }

    pub fn synchronizer(&self) -> &Arc<StateSynchronizer> {
        &self.sync
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.sync.subscribe()
    }

    pub fn snapshot(&self, index: usize) -> Option<Arc<GroupState>> {
        self.sync.snapshot(index)
    }

    fn request_timeout(&self) -> Duration {
        self.config.load().runtime.request_timeout()
    }

    async fn query_names(&self) -> RuntimeResult<Vec<String>> {
        let exclude = self.config.load().view.exclude_not_selectable;
        with_timeout(self.request_timeout(), self.runtime.query_group_names(exclude)).await
    }

    /// Replace the group set and cascade to sessions and cache.
    fn apply_topology(&self, names: Vec<String>) -> bool {
        if self.store.names() == names {
            return false;
        }
        let stopped = self.scheduler.stop_all();
        let change = self.store.replace_groups(names);
        if change.changed {
            self.cache.retain_proxies(&change.referenced);
            tracing::info!(
                groups = self.store.len(),
                sessions_stopped = stopped,
                cached = self.cache.len(),
                "Topology changed"
            );
        }
        change.changed
    }

    /// Fetch group names, retrying with backoff while the runtime has none,
    /// then load every group. Returns the number of groups loaded.
    pub async fn prefetch(&self) -> usize {
        let (attempts, base) = {
            let config = self.config.load();
            (
                config.scheduler.prefetch_attempts.max(1),
                Duration::from_millis(config.scheduler.prefetch_base_delay_ms),
            )
        };
        let mut backoff = Backoff::new(base, PREFETCH_MAX_DELAY);

        for attempt in 1..=attempts {
            match self.query_names().await {
                Ok(names) if !names.is_empty() => {
                    tracing::info!(groups = names.len(), attempt, "Topology fetched");
                    self.apply_topology(names);
                    return self.reload_all().await;
                }
                Ok(_) => tracing::debug!(attempt, "Runtime reports no groups yet"),
                Err(e) => {
                    metrics::record_runtime_error("query_group_names");
                    tracing::warn!(attempt, error = %e, "Topology fetch failed");
                }
            }
            if attempt < attempts {
                tokio::time::sleep(backoff.next_delay()).await;
            }
        }
        tracing::warn!(attempts, "No topology after prefetch; waiting for refresh");
        0
    }

    /// Re-read group names. Returns whether the topology changed.
    pub async fn refresh_topology(&self) -> EngineResult<bool> {
        let names = self.query_names().await.inspect_err(|_| {
            metrics::record_runtime_error("query_group_names");
        })?;
        let changed = self.apply_topology(names);
        if changed {
            self.reload_all().await;
        }
        Ok(changed)
    }

    /// Query one group and apply it. Unknown delays are filled from the cache.
    pub async fn reload(&self, index: usize) -> bool {
        let Some(name) = self.store.name_at(index) else {
            return false;
        };
        let config = self.config.load_full();

        let info = {
            let Ok(_permit) = self.query_permits.acquire().await else {
                return false;
            };
            let query = self.runtime.query_group(&name, config.view.sort);
            with_timeout(config.runtime.request_timeout(), query).await
        };
        let info = match info {
            Ok(info) => info,
            Err(e) => {
                metrics::record_runtime_error("query_group");
                tracing::warn!(index, group = %name, error = %e, "Group reload failed");
                return false;
            }
        };

        let selectable = info.selectable();
        let now = info.now().map(str::to_string);
        let mut proxies = info.proxies;
        for proxy in proxies.iter_mut().filter(|p| !p.has_known_delay()) {
            if let Some(delay) = self.cache.get(&proxy.name) {
                proxy.delay = delay;
            }
        }

        self.store.apply_group_snapshot(
            index,
            ProxyGroup {
                name,
                proxies,
                selectable,
                now,
            },
        );
        true
    }

    /// Reload every group concurrently. Returns how many succeeded.
    pub async fn reload_all(&self) -> usize {
        let results = join_all((0..self.store.len()).map(|index| self.reload(index))).await;
        results.into_iter().filter(|ok| *ok).count()
    }

    /// Commit a manual selection.
    ///
    /// Selecting a member that is itself a group starts a background delay
    /// test of that group.
    pub async fn select(&self, index: usize, proxy: &str) -> EngineResult<bool> {
        let group = self
            .store
            .group(index)
            .ok_or(EngineError::UnknownIndex(index))?;

        let patch = self.runtime.patch_selection(&group.name, proxy);
        let accepted = with_timeout(self.request_timeout(), patch).await.inspect_err(|_| {
            metrics::record_runtime_error("patch_selection");
        })?;
        if !accepted {
            tracing::warn!(index, group = %group.name, proxy = %proxy, "Runtime rejected selection");
            return Ok(false);
        }

        if !self.store.set_selection(index, &group.name, proxy) {
            tracing::debug!(index, group = %group.name, proxy = %proxy, "Group moved during selection; next reload picks it up");
        }
        tracing::info!(index, group = %group.name, proxy = %proxy, "Selection committed");

        if group.member(proxy).is_some_and(Proxy::is_group) {
            self.background_test_by_name(proxy);
        }
        Ok(true)
    }

    fn background_test_by_name(&self, group: &str) {
        if let Some(index) = self.store.index_of(group) {
            self.scheduler.request_background_test(index);
            return;
        }

        // Not tracked here; let the runtime refresh its own delays.
        let runtime = Arc::clone(&self.runtime);
        let name = group.to_string();
        let deadline = self.config.load().runtime.request_timeout()
            + Duration::from_millis(self.config.load().runtime.probe_timeout_ms);
        tokio::spawn(async move {
            if let Err(e) = with_timeout(deadline, runtime.trigger_health_check(&name)).await {
                metrics::record_runtime_error("trigger_health_check");
                tracing::debug!(group = %name, error = %e, "Background trigger failed");
            }
        });
    }

    pub async fn patch_mode(&self, mode: Option<TunnelMode>) -> EngineResult<()> {
        with_timeout(self.request_timeout(), self.runtime.patch_mode(mode))
            .await
            .inspect_err(|_| metrics::record_runtime_error("patch_mode"))?;
        tracing::info!(mode = ?mode, "Mode override applied");
        Ok(())
    }

    /// Resolve the endpoint behind `group`, one runtime query per hop.
    pub async fn resolve_endpoint(&self, group: &str) -> Option<Endpoint> {
        let lookup = RuntimeLookup::new(Arc::clone(&self.runtime), self.request_timeout());
        resolve_endpoint(&lookup, group).await
    }

    /// Endpoint behind the first group, falling back to that group's own
    /// selected member when the chain cannot be resolved.
    pub async fn current_endpoint(&self) -> Option<Endpoint> {
        let first = self.store.name_at(0)?;
        if let Some(endpoint) = self.resolve_endpoint(&first).await {
            return Some(endpoint);
        }

        let group = self.store.group(0)?;
        let selected = group.selected()?;
        Some(Endpoint {
            name: selected.name.clone(),
            subtitle: selected.subtitle.clone(),
            delay: selected.delay,
        })
    }

    fn overrides(&self) -> MutexGuard<'_, ConfigOverrides> {
        self.overrides.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Toggle delay ordering. The choice outlives config file reloads.
    pub fn set_sort_by_delay(&self, enabled: bool) {
        self.overrides().sort_by_delay = Some(enabled);
        self.sync.set_sort_by_delay(enabled);
    }

    /// Swap in a reloaded configuration with the overrides layered on top.
    pub fn apply_config(&self, next: EngineConfig) {
        let next = self.overrides().applied_to(&next);
        let current = self.config.load_full();

        if next.scheduler.reload_concurrency != current.scheduler.reload_concurrency {
            tracing::warn!(
                current = current.scheduler.reload_concurrency,
                requested = next.scheduler.reload_concurrency,
                "reload_concurrency takes effect on restart"
            );
        }
        if next.runtime != current.runtime {
            tracing::warn!("Runtime controller settings take effect on restart");
        }
        let sort_changed = next.view.sort_by_delay != current.view.sort_by_delay;
        let sort_by_delay = next.view.sort_by_delay;

        self.config.store(Arc::new(next));
        if sort_changed {
            self.sync.set_sort_by_delay(sort_by_delay);
        }
        tracing::info!("Configuration reloaded");
    }

    /// Start the coordinator task.
    pub fn spawn(
        self: &Arc<Self>,
        shutdown: &Shutdown,
        config_updates: Option<mpsc::UnboundedReceiver<EngineConfig>>,
    ) -> (EngineHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(INTENT_CAPACITY);
        let engine = Arc::clone(self);
        let task = tokio::spawn(engine.run(rx, shutdown.subscribe(), config_updates));
        (EngineHandle::new(tx), task)
    }

    async fn run(
        self: Arc<Self>,
        mut intents: mpsc::Receiver<Intent>,
        mut shutdown: broadcast::Receiver<()>,
        mut config_updates: Option<mpsc::UnboundedReceiver<EngineConfig>>,
    ) {
        let mut cleanup = cleanup_ticker(self.config.load().scheduler.cleanup_interval());
        tracing::info!("Engine coordinator started");

        loop {
            tokio::select! {
                intent = intents.recv() => match intent {
                    Some(intent) => self.dispatch(intent),
                    None => break,
                },
                _ = cleanup.tick() => self.sweep(),
                update = next_config(&mut config_updates) => match update {
                    Some(next) => {
                        let interval = next.scheduler.cleanup_interval();
                        self.apply_config(next);
                        cleanup = cleanup_ticker(interval);
                    }
                    None => config_updates = None,
                },
                _ = shutdown.recv() => break,
            }
        }

        let stopped = self.scheduler.stop_all();
        tracing::info!(sessions_stopped = stopped, "Engine coordinator stopped");
    }

    fn sweep(&self) {
        let stale = self.scheduler.cleanup_stale();
        let evicted = self.cache.evict_expired();
        if stale > 0 || evicted > 0 {
            tracing::debug!(stale, evicted, "Cleanup sweep");
        }
    }

    fn dispatch(self: &Arc<Self>, intent: Intent) {
        tracing::debug!(intent = ?intent, "Dispatching intent");
        match intent {
            Intent::ReloadAll => {
                let engine = Arc::clone(self);
                tokio::spawn(async move {
                    engine.reload_all().await;
                });
            }
            Intent::Reload(index) => {
                let engine = Arc::clone(self);
                tokio::spawn(async move {
                    engine.reload(index).await;
                });
            }
            Intent::Select { index, name } => {
                let engine = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = engine.select(index, &name).await {
                        tracing::warn!(index, proxy = %name, error = %e, "Selection failed");
                    }
                });
            }
            Intent::UrlTest(index) => {
                if let TestRequest::Rejected(reason) = self.scheduler.request_test(index) {
                    tracing::debug!(index, reason = ?reason, "Test request rejected");
                }
            }
            Intent::PatchMode(mode) => {
                let engine = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = engine.patch_mode(mode).await {
                        tracing::warn!(error = %e, "Mode override failed");
                    }
                });
            }
            Intent::StopTest(index) => {
                self.scheduler.stop_test(index);
            }
            Intent::StopAll => {
                self.scheduler.stop_all();
            }
            Intent::RefreshTopology => {
                let engine = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = engine.refresh_topology().await {
                        tracing::warn!(error = %e, "Topology refresh failed");
                    }
                });
            }
            Intent::SetSortByDelay(enabled) => self.set_sort_by_delay(enabled),
        }
    }
}

fn cleanup_ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn next_config(
    updates: &mut Option<mpsc::UnboundedReceiver<EngineConfig>>,
) -> Option<EngineConfig> {
    match updates {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
