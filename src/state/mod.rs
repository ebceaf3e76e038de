//! Published per-group state.
//!
//! # Data Flow
//! ```text
//! TopologyStore (snapshots, selections)   Scheduler (delays, testing flag)
//!                  \                        /
//!                   → StateSynchronizer ←
//!                          │
//!                          ├── DashMap<index, Arc<GroupState>>  (readers)
//!                          └── broadcast<StateEvent>            (subscribers)
//! ```
//!
//! # Design Decisions
//! - A group record is never edited in place; a new `Arc` replaces it under
//!   the map's entry lock, so readers see either the old or the new record
//! - Revisions come from one counter, so they only ever grow per group
//! - Delay re-sorting is debounced by a background task that holds only a
//!   weak reference

use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc};

use crate::config::{EngineConfig, ProxySort, SharedConfig};
use crate::observability::metrics;
use crate::topology::model::{links_for, sort_proxies, LinkState, Proxy, ProxyGroup};

const EVENT_CAPACITY: usize = 256;

/// Externally observable record of one group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupState {
    pub index: usize,
    pub name: String,
    pub proxies: Vec<Proxy>,
    pub selectable: bool,
    pub now: Option<String>,
    pub links: BTreeMap<String, LinkState>,
    pub testing: bool,
    pub revision: u64,
}

impl GroupState {
    /// The topology part of this record.
    pub fn to_group(&self) -> ProxyGroup {
        ProxyGroup {
            name: self.name.clone(),
            proxies: self.proxies.clone(),
            selectable: self.selectable,
            now: self.now.clone(),
        }
    }

    fn same_topology(&self, group: &ProxyGroup) -> bool {
        self.name == group.name
            && self.proxies == group.proxies
            && self.selectable == group.selectable
            && self.now == group.now
    }

    /// Delay of every member keyed by name.
    pub fn delays(&self) -> BTreeMap<String, i32> {
        self.links
            .values()
            .map(|link| (link.name.clone(), link.delay))
            .collect()
    }
}

/// Change notifications for subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
    GroupUpdated { index: usize, revision: u64 },
    GroupRemoved { index: usize },
    Reset,
}

/// The single writer of published group state.
pub struct StateSynchronizer {
    groups: DashMap<usize, Arc<GroupState>>,
    events: broadcast::Sender<StateEvent>,
    revision: AtomicU64,
    resorts: AtomicU64,
    resort_tx: mpsc::UnboundedSender<usize>,
    config: SharedConfig,
}

impl StateSynchronizer {
    /// Create the synchronizer and its re-sort debouncer.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(config: SharedConfig) -> Arc<Self> {
        let (resort_tx, resort_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Arc::new_cyclic(|weak: &Weak<Self>| {
            tokio::spawn(run_debouncer(weak.clone(), resort_rx));
            Self {
                groups: DashMap::new(),
                events,
                revision: AtomicU64::new(0),
                resorts: AtomicU64::new(0),
                resort_tx,
                config,
            }
        })
    }

    fn next_revision(&self) -> u64 {
        self.revision.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn sort_by_delay(&self) -> bool {
        self.config.load().view.sort_by_delay
    }

    fn emit(&self, event: StateEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Replace the record at `index` with whatever `f` builds from it.
    /// `f` returning `None` leaves the record untouched.
    fn modify<F>(&self, index: usize, cause: &'static str, f: F) -> bool
    where
        F: FnOnce(&GroupState) -> Option<GroupState>,
    {
        let revision = {
            let Some(mut entry) = self.groups.get_mut(&index) else {
                return false;
            };
            let Some(mut next) = f(entry.value()) else {
                return false;
            };
            next.revision = self.next_revision();
            let revision = next.revision;
            *entry.value_mut() = Arc::new(next);
            revision
        };
        metrics::record_publish(cause);
        self.emit(StateEvent::GroupUpdated { index, revision });
        true
    }

    /// Merge a topology update for `index`.
    ///
    /// `testing` carries over from the previous record; `links` are rebuilt.
    /// Returns false when the record already holds exactly this topology.
    pub fn publish(&self, index: usize, group: ProxyGroup) -> bool {
        let mut group = group;
        if self.sort_by_delay() {
            sort_proxies(&mut group.proxies, ProxySort::Delay);
        }

        let revision = {
            let mut entry = self.groups.entry(index).or_insert_with(|| {
                Arc::new(GroupState {
                    index,
                    name: group.name.clone(),
                    proxies: Vec::new(),
                    selectable: false,
                    now: None,
                    links: BTreeMap::new(),
                    testing: false,
                    revision: 0,
                })
            });
            let current = entry.value();
            if current.revision > 0 && current.same_topology(&group) {
                return false;
            }
            let testing = current.name == group.name && current.testing;

            let revision = self.next_revision();
            *entry.value_mut() = Arc::new(GroupState {
                index,
                links: links_for(&group.proxies),
                name: group.name,
                proxies: group.proxies,
                selectable: group.selectable,
                now: group.now,
                testing,
                revision,
            });
            revision
        };
        metrics::record_publish("topology");
        self.emit(StateEvent::GroupUpdated { index, revision });
        true
    }

    /// Apply one probe result. Equal values and unknown members are ignored.
    pub fn on_delay_update(&self, index: usize, proxy: &str, delay: i32) -> bool {
        let changed = self.modify(index, "delay", |current| {
            let link = current.links.get(proxy)?;
            if link.delay == delay {
                return None;
            }
            let mut next = current.clone();
            apply_delay(&mut next, proxy, delay);
            Some(next)
        });
        if changed {
            self.schedule_resort(index);
        }
        changed
    }

    /// Apply several probe results with a single republish.
    pub fn on_delay_updates(&self, index: usize, delays: &BTreeMap<String, i32>) -> bool {
        let changed = self.modify(index, "delay", |current| {
            let mut next = current.clone();
            let mut any = false;
            for (proxy, &delay) in delays {
                if current.links.get(proxy).is_some_and(|link| link.delay != delay) {
                    apply_delay(&mut next, proxy, delay);
                    any = true;
                }
            }
            any.then_some(next)
        });
        if changed {
            self.schedule_resort(index);
        }
        changed
    }

    pub fn set_testing(&self, index: usize, testing: bool) -> bool {
        self.modify(index, "testing", |current| {
            (current.testing != testing).then(|| GroupState {
                testing,
                ..current.clone()
            })
        })
    }

    pub fn set_selection(&self, index: usize, now: &str) -> bool {
        self.modify(index, "selection", |current| {
            (current.now.as_deref() != Some(now)).then(|| GroupState {
                now: Some(now.to_string()),
                ..current.clone()
            })
        })
    }

    pub fn remove(&self, index: usize) -> bool {
        let removed = self.groups.remove(&index).is_some();
        if removed {
            self.emit(StateEvent::GroupRemoved { index });
        }
        removed
    }

    /// Drop every record.
    pub fn reset(&self) {
        self.groups.clear();
        self.emit(StateEvent::Reset);
    }

    pub fn snapshot(&self, index: usize) -> Option<Arc<GroupState>> {
        self.groups.get(&index).map(|entry| Arc::clone(entry.value()))
    }

    /// Every record, ordered by index.
    pub fn snapshot_all(&self) -> Vec<Arc<GroupState>> {
        let mut all: Vec<_> = self
            .groups
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        all.sort_by_key(|state| state.index);
        all
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.events.subscribe()
    }

    /// Number of debounced re-sorts performed so far.
    pub fn resort_count(&self) -> u64 {
        self.resorts.load(Ordering::Relaxed)
    }

    /// Toggle sort-by-delay. Enabling it schedules a re-sort of every group.
    pub fn set_sort_by_delay(&self, enabled: bool) {
        self.config.rcu(|current| {
            let mut next = EngineConfig::clone(current);
            next.view.sort_by_delay = enabled;
            next
        });
        if enabled {
            let indices: Vec<usize> = self.groups.iter().map(|entry| *entry.key()).collect();
            for index in indices {
                self.schedule_resort(index);
            }
        }
    }

    fn schedule_resort(&self, index: usize) {
        if self.sort_by_delay() {
            let _ = self.resort_tx.send(index);
        }
    }

    fn resort(&self, indices: &BTreeSet<usize>) {
        if !self.sort_by_delay() {
            return;
        }
        self.resorts.fetch_add(1, Ordering::Relaxed);
        metrics::record_resort();

        for &index in indices {
            self.modify(index, "resort", |current| {
                let mut proxies = current.proxies.clone();
                sort_proxies(&mut proxies, ProxySort::Delay);
                (proxies != current.proxies).then(|| GroupState {
                    proxies,
                    ..current.clone()
                })
            });
        }
        tracing::debug!(groups = indices.len(), "Re-sorted groups by delay");
    }
}

fn apply_delay(state: &mut GroupState, proxy: &str, delay: i32) {
    if let Some(link) = state.links.get_mut(proxy) {
        link.delay = delay;
    }
    if let Some(member) = state.proxies.iter_mut().find(|p| p.name == proxy) {
        member.delay = delay;
    }
}

/// Collect re-sort requests until the debounce window passes with no new
/// request, then re-sort everything collected.
async fn run_debouncer(sync: Weak<StateSynchronizer>, mut rx: mpsc::UnboundedReceiver<usize>) {
    while let Some(first) = rx.recv().await {
        let mut pending = BTreeSet::from([first]);
        loop {
            let window = match sync.upgrade() {
                Some(sync) => sync.config.load().view.sort_debounce(),
                None => return,
            };
            tokio::select! {
                next = rx.recv() => match next {
                    Some(index) => {
                        pending.insert(index);
                    }
                    None => return,
                },
                _ = tokio::time::sleep(window) => break,
            }
        }
        match sync.upgrade() {
            Some(sync) => sync.resort(&pending),
            None => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{shared, EngineConfig};
    use std::time::Duration;

    fn group(now: &str) -> ProxyGroup {
        ProxyGroup {
            name: "G1".into(),
            proxies: vec![
                Proxy::terminal("P1", "Vmess", 50),
                Proxy::terminal("P2", "Vmess", 200),
                Proxy::terminal("P3", "Vmess", 0),
            ],
            selectable: true,
            now: Some(now.into()),
        }
    }

    fn sorted_sync() -> Arc<StateSynchronizer> {
        let mut config = EngineConfig::default();
        config.view.sort_by_delay = true;
        StateSynchronizer::new(shared(config))
    }

    #[tokio::test]
    async fn test_identical_publish_is_noop() {
        let sync = StateSynchronizer::new(shared(EngineConfig::default()));
        let mut events = sync.subscribe();

        assert!(sync.publish(0, group("P1")));
        assert!(!sync.publish(0, group("P1")));
        assert!(sync.publish(0, group("P2")));

        assert!(matches!(events.recv().await, Ok(StateEvent::GroupUpdated { index: 0, revision: 1 })));
        assert!(matches!(events.recv().await, Ok(StateEvent::GroupUpdated { index: 0, revision: 2 })));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_keeps_testing_flag() {
        let sync = StateSynchronizer::new(shared(EngineConfig::default()));
        sync.publish(0, group("P1"));
        sync.set_testing(0, true);
        sync.publish(0, group("P2"));

        let state = sync.snapshot(0).unwrap();
        assert!(state.testing);
        assert_eq!(state.now.as_deref(), Some("P2"));
    }

    #[tokio::test]
    async fn test_delay_update_touches_one_link() {
        let sync = StateSynchronizer::new(shared(EngineConfig::default()));
        sync.publish(0, group("P1"));
        let before = sync.snapshot(0).unwrap();

        assert!(sync.on_delay_update(0, "P3", 310));
        assert!(!sync.on_delay_update(0, "P3", 310));
        assert!(!sync.on_delay_update(0, "missing", 10));

        let after = sync.snapshot(0).unwrap();
        assert_eq!(after.links["P3"].delay, 310);
        assert_eq!(after.links["P1"], before.links["P1"]);
        assert_eq!(after.proxies[2].delay, 310);
        assert_eq!(before.links["P3"].delay, 0);
        assert!(after.revision > before.revision);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resort_is_debounced() {
        let sync = sorted_sync();
        sync.publish(0, group("P1"));

        sync.on_delay_update(0, "P3", 30);
        tokio::time::sleep(Duration::from_millis(50)).await;
        sync.on_delay_update(0, "P2", 400);
        tokio::time::sleep(Duration::from_millis(50)).await;
        sync.on_delay_update(0, "P1", 100);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(sync.resort_count(), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sync.resort_count(), 1);

        let names: Vec<_> = sync.snapshot(0).unwrap().proxies.iter().map(|p| p.name.clone()).collect();
        assert_eq!(names, ["P3", "P1", "P2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_resort_without_sort_by_delay() {
        let sync = StateSynchronizer::new(shared(EngineConfig::default()));
        sync.publish(0, group("P1"));
        sync.on_delay_update(0, "P1", 900);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(sync.resort_count(), 0);
        assert_eq!(sync.snapshot(0).unwrap().proxies[0].name, "P1");
    }

    #[tokio::test]
    async fn test_remove_and_reset_emit_events() {
        let sync = StateSynchronizer::new(shared(EngineConfig::default()));
        sync.publish(0, group("P1"));
        sync.publish(1, group("P1"));
        let mut events = sync.subscribe();

        assert!(sync.remove(1));
        assert!(!sync.remove(1));
        sync.reset();

        assert_eq!(events.recv().await.unwrap(), StateEvent::GroupRemoved { index: 1 });
        assert_eq!(events.recv().await.unwrap(), StateEvent::Reset);
        assert!(sync.snapshot_all().is_empty());
    }
}
