//! Shared utilities for integration testing.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use proxy_health::config::{self, EngineConfig, ProxySort, SharedConfig};
use proxy_health::runtime::{GroupInfo, ProxyRuntime, RuntimeError, RuntimeResult, TunnelMode};
use proxy_health::topology::model::{sort_proxies, GroupKind, Proxy};
use proxy_health::Engine;

/// Programmable in-memory proxy runtime.
///
/// A trigger copies the group's configured results into its members after
/// `trigger_latency`; probes answer from `probe_results` after
/// `probe_latency`; selections land after `patch_latency`.
#[derive(Default)]
pub struct MockRuntime {
    groups: Mutex<BTreeMap<String, GroupInfo>>,
    order: Mutex<Vec<String>>,
    trigger_results: Mutex<HashMap<String, BTreeMap<String, i32>>>,
    probe_results: Mutex<HashMap<String, i32>>,
    trigger_latency: Mutex<Duration>,
    probe_latency: Mutex<Duration>,
    patch_latency: Mutex<Duration>,
    mode: Mutex<Option<TunnelMode>>,
    pub fail_queries: AtomicBool,
    pub hang_probes: AtomicBool,
    pub trigger_calls: Mutex<Vec<String>>,
    pub probe_calls: AtomicUsize,
    pub query_calls: AtomicUsize,
    pub patch_calls: AtomicUsize,
}

impl MockRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_group(&self, name: &str, kind: GroupKind, now: &str, proxies: Vec<Proxy>) {
        self.groups.lock().unwrap().insert(
            name.to_string(),
            GroupInfo {
                name: name.to_string(),
                kind,
                now: now.to_string(),
                proxies,
            },
        );
        let mut order = self.order.lock().unwrap();
        if !order.iter().any(|n| n == name) {
            order.push(name.to_string());
        }
    }

    pub fn set_order(&self, names: &[&str]) {
        *self.order.lock().unwrap() = names.iter().map(|n| n.to_string()).collect();
    }

    pub fn set_trigger_results(&self, group: &str, results: &[(&str, i32)]) {
        self.trigger_results.lock().unwrap().insert(
            group.to_string(),
            results.iter().map(|(n, d)| (n.to_string(), *d)).collect(),
        );
    }

    pub fn set_probe(&self, proxy: &str, delay: i32) {
        self.probe_results.lock().unwrap().insert(proxy.to_string(), delay);
    }

    pub fn set_trigger_latency(&self, latency: Duration) {
        *self.trigger_latency.lock().unwrap() = latency;
    }

    pub fn set_probe_latency(&self, latency: Duration) {
        *self.probe_latency.lock().unwrap() = latency;
    }

    pub fn set_patch_latency(&self, latency: Duration) {
        *self.patch_latency.lock().unwrap() = latency;
    }

    pub fn now_of(&self, group: &str) -> Option<String> {
        self.groups.lock().unwrap().get(group).map(|g| g.now.clone())
    }

    pub fn triggers_for(&self, group: &str) -> usize {
        self.trigger_calls.lock().unwrap().iter().filter(|g| *g == group).count()
    }

    pub fn mode(&self) -> Option<TunnelMode> {
        *self.mode.lock().unwrap()
    }
}

#[async_trait]
impl ProxyRuntime for MockRuntime {
    async fn query_group_names(&self, exclude_not_selectable: bool) -> RuntimeResult<Vec<String>> {
        if self.fail_queries.load(Ordering::SeqCst) {
            return Err(RuntimeError::Unavailable("mock offline".into()));
        }
        let groups = self.groups.lock().unwrap();
        Ok(self
            .order
            .lock()
            .unwrap()
            .iter()
            .filter(|name| {
                groups
                    .get(*name)
                    .is_some_and(|g| !exclude_not_selectable || g.selectable())
            })
            .cloned()
            .collect())
    }

    async fn query_group(&self, name: &str, sort: ProxySort) -> RuntimeResult<GroupInfo> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_queries.load(Ordering::SeqCst) {
            return Err(RuntimeError::Unavailable("mock offline".into()));
        }
        let mut group = self
            .groups
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownGroup(name.to_string()))?;
        sort_proxies(&mut group.proxies, sort);
        Ok(group)
    }

    async fn trigger_health_check(&self, group: &str) -> RuntimeResult<()> {
        self.trigger_calls.lock().unwrap().push(group.to_string());
        let latency = *self.trigger_latency.lock().unwrap();
        tokio::time::sleep(latency).await;

        let results = self.trigger_results.lock().unwrap().get(group).cloned();
        let mut groups = self.groups.lock().unwrap();
        let info = groups
            .get_mut(group)
            .ok_or_else(|| RuntimeError::UnknownGroup(group.to_string()))?;
        if let Some(results) = results {
            for proxy in &mut info.proxies {
                if let Some(delay) = results.get(&proxy.name) {
                    proxy.delay = *delay;
                }
            }
        }
        Ok(())
    }

    async fn patch_selection(&self, group: &str, proxy: &str) -> RuntimeResult<bool> {
        self.patch_calls.fetch_add(1, Ordering::SeqCst);
        let latency = *self.patch_latency.lock().unwrap();
        tokio::time::sleep(latency).await;
        let mut groups = self.groups.lock().unwrap();
        let info = groups
            .get_mut(group)
            .ok_or_else(|| RuntimeError::UnknownGroup(group.to_string()))?;
        if !info.selectable() || !info.proxies.iter().any(|p| p.name == proxy) {
            return Ok(false);
        }
        info.now = proxy.to_string();
        Ok(true)
    }

    async fn probe_proxy(&self, proxy: &str) -> RuntimeResult<i32> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        if self.hang_probes.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let latency = *self.probe_latency.lock().unwrap();
        tokio::time::sleep(latency).await;
        self.probe_results
            .lock()
            .unwrap()
            .get(proxy)
            .copied()
            .ok_or_else(|| RuntimeError::Unavailable(format!("{proxy} unreachable")))
    }

    async fn query_mode(&self) -> RuntimeResult<Option<TunnelMode>> {
        Ok(self.mode())
    }

    async fn patch_mode(&self, mode: Option<TunnelMode>) -> RuntimeResult<()> {
        *self.mode.lock().unwrap() = mode;
        Ok(())
    }
}

/// The G1 group: `[P1(50), P2(200), P3(unknown)]`, `now = P1`.
pub fn g1_members() -> Vec<Proxy> {
    vec![
        Proxy::terminal("P1", "Shadowsocks", 50),
        Proxy::terminal("P2", "Shadowsocks", 200),
        Proxy::terminal("P3", "Shadowsocks", 0),
    ]
}

/// `count` terminal members named `n0..`.
pub fn members(count: usize) -> Vec<Proxy> {
    (0..count)
        .map(|i| Proxy::terminal(format!("n{i}"), "Vmess", 0))
        .collect()
}

pub fn shared_config(config: EngineConfig) -> SharedConfig {
    config::shared(config)
}

/// Build an engine over `runtime` and load its topology.
pub async fn loaded_engine(runtime: Arc<MockRuntime>, config: EngineConfig) -> Arc<Engine> {
    let engine = Engine::new(runtime, config::shared(config));
    engine.prefetch().await;
    engine
}

/// Let spawned tasks run without moving the paused clock far.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
