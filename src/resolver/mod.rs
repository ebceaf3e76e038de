//! Endpoint resolution through nested selector groups.
//!
//! Follows `now` from a group to its selected member, descending into
//! group-typed members until a terminal proxy is reached. A visited set of
//! group names stops selection cycles.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ProxySort;
use crate::observability::metrics;
use crate::resilience::timeouts::with_timeout;
use crate::runtime::ProxyRuntime;
use crate::topology::model::ProxyGroup;
use crate::topology::TopologyStore;

/// The concrete proxy a group chain currently routes through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    pub name: String,
    pub subtitle: String,
    pub delay: i32,
}

/// Source of group data for the resolver.
#[async_trait]
pub trait GroupLookup: Send + Sync {
    /// The named group, or `None` when it is unknown or cannot be read.
    async fn lookup(&self, name: &str) -> Option<ProxyGroup>;
}

/// Looks every hop up in the runtime. One call per hop.
pub struct RuntimeLookup {
    runtime: Arc<dyn ProxyRuntime>,
    deadline: Duration,
}

impl RuntimeLookup {
    pub fn new(runtime: Arc<dyn ProxyRuntime>, deadline: Duration) -> Self {
        Self { runtime, deadline }
    }
}

#[async_trait]
impl GroupLookup for RuntimeLookup {
    async fn lookup(&self, name: &str) -> Option<ProxyGroup> {
        match with_timeout(self.deadline, self.runtime.query_group(name, ProxySort::Default)).await {
            Ok(info) => Some(ProxyGroup {
                selectable: info.selectable(),
                now: info.now().map(str::to_string),
                name: info.name,
                proxies: info.proxies,
            }),
            Err(e) => {
                metrics::record_runtime_error("query_group");
                tracing::debug!(group = %name, error = %e, "Group lookup failed");
                None
            }
        }
    }
}

#[async_trait]
impl GroupLookup for TopologyStore {
    async fn lookup(&self, name: &str) -> Option<ProxyGroup> {
        self.group_by_name(name)
    }
}

/// Resolve the terminal endpoint currently selected by `group`.
pub async fn resolve_endpoint<L>(lookup: &L, group: &str) -> Option<Endpoint>
where
    L: GroupLookup + ?Sized,
{
    let mut visited = HashSet::new();
    let mut current = group.to_string();

    loop {
        if !visited.insert(current.clone()) {
            tracing::warn!(group = %group, at = %current, "Selection cycle detected");
            return None;
        }

        let group = lookup.lookup(&current).await?;
        let selected = group.selected()?;
        if !selected.is_group() {
            return Some(Endpoint {
                name: selected.name.clone(),
                subtitle: selected.subtitle.clone(),
                delay: selected.delay,
            });
        }
        current = selected.name.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::model::Proxy;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct MapLookup {
        groups: HashMap<String, ProxyGroup>,
        calls: AtomicUsize,
    }

    impl MapLookup {
        fn with(mut self, name: &str, now: &str, proxies: Vec<Proxy>) -> Self {
            self.groups.insert(
                name.to_string(),
                ProxyGroup {
                    name: name.to_string(),
                    proxies,
                    selectable: true,
                    now: Some(now.to_string()),
                },
            );
            self
        }
    }

    #[async_trait]
    impl GroupLookup for MapLookup {
        async fn lookup(&self, name: &str) -> Option<ProxyGroup> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.groups.get(name).cloned()
        }
    }

    #[tokio::test]
    async fn test_cycle_returns_none() {
        let lookup = MapLookup::default()
            .with("A", "B", vec![Proxy::group("B", "Selector", 0)])
            .with("B", "A", vec![Proxy::group("A", "Selector", 0)]);

        assert_eq!(resolve_endpoint(&lookup, "A").await, None);
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_self_reference_returns_none() {
        let lookup = MapLookup::default().with("A", "A", vec![Proxy::group("A", "Selector", 0)]);
        assert_eq!(resolve_endpoint(&lookup, "A").await, None);
    }

    #[tokio::test]
    async fn test_now_outside_member_list() {
        let lookup = MapLookup::default().with("A", "ghost", vec![Proxy::terminal("x", "Http", 5)]);
        assert_eq!(resolve_endpoint(&lookup, "A").await, None);
    }

    #[tokio::test]
    async fn test_missing_group_mid_chain() {
        let lookup = MapLookup::default().with("A", "B", vec![Proxy::group("B", "Selector", 0)]);
        assert_eq!(resolve_endpoint(&lookup, "A").await, None);
    }

    #[tokio::test]
    async fn test_terminal_selection() {
        let lookup = MapLookup::default().with("A", "x", vec![Proxy::terminal("x", "Trojan", 42)]);
        assert_eq!(
            resolve_endpoint(&lookup, "A").await,
            Some(Endpoint {
                name: "x".into(),
                subtitle: "Trojan".into(),
                delay: 42
            })
        );
    }
}
