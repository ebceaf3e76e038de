//! mihomo / Clash external controller client.
//!
//! # Responsibilities
//! - Read the proxy table and derive group names and members
//! - Trigger group and single-proxy delay tests
//! - Commit selections and mode overrides
//!
//! # Endpoints
//! - `GET /proxies` (whole table; group order follows `GLOBAL.all`)
//! - `GET /group/{name}/delay?url=&timeout=`
//! - `GET /proxies/{name}/delay?url=&timeout=`
//! - `PUT /proxies/{group}` with `{"name": proxy}`
//! - `GET /configs`, `PATCH /configs` with `{"mode": mode}`

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

use crate::config::{ProxySort, RuntimeConfig};
use crate::runtime::{GroupInfo, ProxyRuntime, RuntimeError, RuntimeResult, TunnelMode};
use crate::topology::model::{sort_proxies, GroupKind, Proxy, ProxyKind};

const GLOBAL_GROUP: &str = "GLOBAL";

#[derive(Debug, Deserialize)]
struct ProxiesResponse {
    proxies: HashMap<String, ProxyEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct ProxyEntry {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    now: Option<String>,
    #[serde(default)]
    all: Vec<String>,
    #[serde(default)]
    history: Vec<DelayHistory>,
}

impl ProxyEntry {
    fn last_delay(&self) -> i32 {
        self.history.last().map(|h| h.delay).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct DelayHistory {
    #[serde(default)]
    delay: i32,
}

#[derive(Debug, Deserialize)]
struct DelayResponse {
    delay: i32,
}

#[derive(Debug, Deserialize)]
struct ConfigsResponse {
    #[serde(default)]
    mode: Option<TunnelMode>,
}

/// Proxy runtime backed by the external controller REST API.
#[derive(Clone)]
pub struct ClashApiRuntime {
    client: Client,
    base: Url,
    secret: Option<String>,
    probe_url: String,
    probe_timeout_ms: u64,
}

impl ClashApiRuntime {
    /// Create a client for the configured controller.
    pub fn new(config: &RuntimeConfig) -> RuntimeResult<Self> {
        let base = Url::parse(&config.controller_url)?;
        if base.cannot_be_a_base() {
            return Err(RuntimeError::Unavailable(format!(
                "controller URL '{}' cannot be a base",
                config.controller_url
            )));
        }

        let client = Client::builder()
            .timeout(config.request_timeout())
            .no_proxy()
            .build()?;

        Ok(Self {
            client,
            base,
            secret: config.secret.clone().filter(|s| !s.is_empty()),
            probe_url: config.probe_url.clone(),
            probe_timeout_ms: config.probe_timeout_ms,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> RuntimeResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| RuntimeError::Unavailable("controller URL cannot be a base".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.secret {
            Some(secret) => builder.bearer_auth(secret),
            None => builder,
        }
    }

    /// Delay endpoints may legitimately run for the whole probe timeout.
    fn delay_request(&self, url: Url) -> RequestBuilder {
        let timeout = self.probe_timeout_ms.to_string();
        self.request(Method::GET, url)
            .query(&[("url", self.probe_url.as_str()), ("timeout", timeout.as_str())])
            .timeout(Duration::from_millis(self.probe_timeout_ms.saturating_mul(2)))
    }

    async fn fetch_proxies(&self) -> RuntimeResult<ProxiesResponse> {
        let response = self
            .request(Method::GET, self.endpoint(&["proxies"])?)
            .send()
            .await?;
        let response = check_status(response, "query_proxies")?;
        Ok(response.json().await?)
    }
}

fn check_status(
    response: reqwest::Response,
    operation: &'static str,
) -> RuntimeResult<reqwest::Response> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(RuntimeError::Status {
            operation,
            status: response.status().as_u16(),
        })
    }
}

fn is_group_entry(entry: &ProxyEntry) -> bool {
    GroupKind::from_type_name(&entry.kind).is_some()
}

/// Group names in `GLOBAL.all` order, then any groups GLOBAL does not list.
fn group_names_from(table: &ProxiesResponse, exclude_not_selectable: bool) -> Vec<String> {
    let wanted = |name: &str| {
        name != GLOBAL_GROUP
            && table.proxies.get(name).is_some_and(|entry| {
                GroupKind::from_type_name(&entry.kind)
                    .is_some_and(|kind| !exclude_not_selectable || kind.is_selectable())
            })
    };

    let mut names: Vec<String> = table
        .proxies
        .get(GLOBAL_GROUP)
        .map(|global| global.all.iter().filter(|n| wanted(n)).cloned().collect())
        .unwrap_or_default();

    let mut rest: Vec<String> = table
        .proxies
        .keys()
        .filter(|n| wanted(n) && !names.contains(n))
        .cloned()
        .collect();
    rest.sort();
    names.extend(rest);
    names
}

fn group_from(table: &ProxiesResponse, name: &str, sort: ProxySort) -> RuntimeResult<GroupInfo> {
    let entry = table
        .proxies
        .get(name)
        .ok_or_else(|| RuntimeError::UnknownGroup(name.to_string()))?;
    let kind = GroupKind::from_type_name(&entry.kind)
        .ok_or_else(|| RuntimeError::UnknownGroup(name.to_string()))?;

    let mut proxies: Vec<Proxy> = entry
        .all
        .iter()
        .map(|member| match table.proxies.get(member) {
            Some(e) => Proxy {
                name: member.clone(),
                kind: if is_group_entry(e) { ProxyKind::Group } else { ProxyKind::Terminal },
                subtitle: e.kind.clone(),
                delay: e.last_delay(),
            },
            None => Proxy::terminal(member.clone(), String::new(), 0),
        })
        .collect();
    sort_proxies(&mut proxies, sort);

    Ok(GroupInfo {
        name: name.to_string(),
        kind,
        now: entry.now.clone().unwrap_or_default(),
        proxies,
    })
}

#[async_trait]
impl ProxyRuntime for ClashApiRuntime {
    async fn query_group_names(&self, exclude_not_selectable: bool) -> RuntimeResult<Vec<String>> {
        let table = self.fetch_proxies().await?;
        Ok(group_names_from(&table, exclude_not_selectable))
    }

    async fn query_group(&self, name: &str, sort: ProxySort) -> RuntimeResult<GroupInfo> {
        let table = self.fetch_proxies().await?;
        group_from(&table, name, sort)
    }

    async fn trigger_health_check(&self, group: &str) -> RuntimeResult<()> {
        let url = self.endpoint(&["group", group, "delay"])?;
        let response = self.delay_request(url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(RuntimeError::UnknownGroup(group.to_string()));
        }
        check_status(response, "trigger_health_check")?;
        Ok(())
    }

    async fn patch_selection(&self, group: &str, proxy: &str) -> RuntimeResult<bool> {
        let url = self.endpoint(&["proxies", group])?;
        let response = self
            .request(Method::PUT, url)
            .json(&serde_json::json!({ "name": proxy }))
            .send()
            .await?;
        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::BAD_REQUEST => Ok(false),
            StatusCode::NOT_FOUND => Err(RuntimeError::UnknownGroup(group.to_string())),
            s => Err(RuntimeError::Status {
                operation: "patch_selection",
                status: s.as_u16(),
            }),
        }
    }

    async fn probe_proxy(&self, proxy: &str) -> RuntimeResult<i32> {
        let url = self.endpoint(&["proxies", proxy, "delay"])?;
        let response = self.delay_request(url).send().await?;
        let response = check_status(response, "probe_proxy")?;
        let body: DelayResponse = response.json().await?;
        Ok(body.delay)
    }

    async fn query_mode(&self) -> RuntimeResult<Option<TunnelMode>> {
        let response = self
            .request(Method::GET, self.endpoint(&["configs"])?)
            .send()
            .await?;
        let response = check_status(response, "query_mode")?;
        let body: ConfigsResponse = response.json().await?;
        Ok(body.mode)
    }

    async fn patch_mode(&self, mode: Option<TunnelMode>) -> RuntimeResult<()> {
        let Some(mode) = mode else {
            tracing::debug!("Controller has no session override slot; keeping current mode");
            return Ok(());
        };
        let response = self
            .request(Method::PATCH, self.endpoint(&["configs"])?)
            .json(&serde_json::json!({ "mode": mode }))
            .send()
            .await?;
        check_status(response, "patch_mode")?;
        Ok(())
    }
}
