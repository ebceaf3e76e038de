//! Ordered group-name set and the write gate for group state.
//!
//! # Responsibilities
//! - Own the ordered list of group names
//! - Drop results addressed to an `(index, name)` pair that no longer exists
//! - Forward every accepted mutation to the state synchronizer
//!
//! The name list sits behind a read-write lock. Writers of group state hold
//! the read side across the check and the publish, so a topology swap can
//! never interleave with a publish for the old topology.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::state::StateSynchronizer;
use crate::topology::model::ProxyGroup;

/// Result of replacing the group-name set.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TopologyChange {
    /// Whether the name list differed from the previous one.
    pub changed: bool,
    /// Proxy names still referenced by any group after the swap.
    pub referenced: HashSet<String>,
}

pub struct TopologyStore {
    names: RwLock<Vec<String>>,
    sync: Arc<StateSynchronizer>,
}

impl TopologyStore {
    pub fn new(sync: Arc<StateSynchronizer>) -> Self {
        Self {
            names: RwLock::new(Vec::new()),
            sync,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<String>> {
        self.names.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<String>> {
        self.names.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn matches(names: &[String], index: usize, name: &str) -> bool {
        names.get(index).is_some_and(|n| n == name)
    }

    pub fn synchronizer(&self) -> &Arc<StateSynchronizer> {
        &self.sync
    }

    /// Swap in a new group-name set.
    ///
    /// Surviving groups keep their last snapshot under their new index;
    /// new names start empty. Every record is republished after a reset,
    /// so no `testing` flag survives the swap.
    pub fn replace_groups(&self, next: Vec<String>) -> TopologyChange {
        let mut names = self.write();
        if *names == next {
            return TopologyChange {
                changed: false,
                referenced: self.referenced(&names),
            };
        }

        let mut previous: HashMap<String, ProxyGroup> = self
            .sync
            .snapshot_all()
            .into_iter()
            .filter(|state| Self::matches(&names, state.index, &state.name))
            .map(|state| (state.name.clone(), state.to_group()))
            .collect();

        self.sync.reset();
        let mut referenced = HashSet::new();
        for (index, name) in next.iter().enumerate() {
            let group = previous
                .remove(name)
                .unwrap_or_else(|| ProxyGroup::empty(name.clone()));
            referenced.extend(group.proxies.iter().map(|p| p.name.clone()));
            self.sync.publish(index, group);
        }

        tracing::info!(
            previous = names.len(),
            current = next.len(),
            dropped = previous.len(),
            "Group topology replaced"
        );
        *names = next;
        TopologyChange {
            changed: true,
            referenced,
        }
    }

    fn referenced(&self, names: &[String]) -> HashSet<String> {
        (0..names.len())
            .filter_map(|index| self.sync.snapshot(index))
            .flat_map(|state| {
                state
                    .proxies
                    .iter()
                    .map(|p| p.name.clone())
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Replace one group's members and selection.
    ///
    /// Discarded when `index` no longer names `group.name`; a no-op when the
    /// snapshot equals the published one.
    pub fn apply_group_snapshot(&self, index: usize, group: ProxyGroup) -> bool {
        let names = self.read();
        if !Self::matches(&names, index, &group.name) {
            tracing::debug!(index, group = %group.name, "Dropping snapshot for vanished group");
            return false;
        }
        self.sync.publish(index, group)
    }

    /// Point `now` at `proxy` without touching the member list, if the
    /// group at `index` is still `name`.
    pub fn set_selection(&self, index: usize, name: &str, proxy: &str) -> bool {
        let names = self.read();
        Self::matches(&names, index, name) && self.sync.set_selection(index, proxy)
    }

    /// Apply probe results for the group at `index`, if it is still `name`.
    pub fn apply_delays(&self, index: usize, name: &str, delays: &BTreeMap<String, i32>) -> bool {
        let names = self.read();
        Self::matches(&names, index, name) && self.sync.on_delay_updates(index, delays)
    }

    /// Apply one probe result for the group at `index`, if it is still `name`.
    pub fn apply_delay(&self, index: usize, name: &str, proxy: &str, delay: i32) -> bool {
        let names = self.read();
        Self::matches(&names, index, name) && self.sync.on_delay_update(index, proxy, delay)
    }

    pub fn set_testing(&self, index: usize, name: &str, testing: bool) -> bool {
        let names = self.read();
        Self::matches(&names, index, name) && self.sync.set_testing(index, testing)
    }

    pub fn names(&self) -> Vec<String> {
        self.read().clone()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn name_at(&self, index: usize) -> Option<String> {
        self.read().get(index).cloned()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.read().iter().position(|n| n == name)
    }

    pub fn group(&self, index: usize) -> Option<ProxyGroup> {
        let names = self.read();
        let state = self.sync.snapshot(index)?;
        Self::matches(&names, index, &state.name).then(|| state.to_group())
    }

    pub fn group_by_name(&self, name: &str) -> Option<ProxyGroup> {
        let index = self.index_of(name)?;
        self.group(index)
    }
}
