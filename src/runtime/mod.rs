//! Proxy runtime collaborator.
//!
//! # Data Flow
//! ```text
//! Engine / scheduler / resolver
//!     → ProxyRuntime trait (query, trigger, patch)
//!         → clash_api.rs (mihomo external controller over HTTP)
//!         → any other implementation (tests use an in-memory runtime)
//! ```
//!
//! # Design Decisions
//! - The runtime performs the actual network probes; the engine only asks
//! - Every call is fallible; callers degrade to "unknown" on error
//! - Optional capabilities have default bodies returning `Unsupported`

pub mod clash_api;
pub mod error;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::ProxySort;
use crate::topology::model::{GroupKind, Proxy};

pub use clash_api::ClashApiRuntime;
pub use error::{RuntimeError, RuntimeResult};

/// One group as reported by the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfo {
    pub name: String,
    pub kind: GroupKind,
    /// Currently active member; empty when the runtime reports none.
    pub now: String,
    pub proxies: Vec<Proxy>,
}

impl GroupInfo {
    pub fn selectable(&self) -> bool {
        self.kind.is_selectable()
    }

    /// `now` as an option, treating the empty string as unset.
    pub fn now(&self) -> Option<&str> {
        Some(self.now.as_str()).filter(|n| !n.is_empty())
    }
}

/// Traffic routing mode of the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelMode {
    Direct,
    Global,
    Rule,
}

/// Operations the engine consumes from the proxy runtime.
#[async_trait]
pub trait ProxyRuntime: Send + Sync {
    /// Group names in runtime order.
    async fn query_group_names(&self, exclude_not_selectable: bool) -> RuntimeResult<Vec<String>>;

    /// One group with its members ordered by `sort`.
    async fn query_group(&self, name: &str, sort: ProxySort) -> RuntimeResult<GroupInfo>;

    /// Ask the runtime to probe every member of a group.
    /// Results surface through later `query_group` calls.
    async fn trigger_health_check(&self, group: &str) -> RuntimeResult<()>;

    /// Commit a manual selection. Returns whether the runtime accepted it.
    async fn patch_selection(&self, group: &str, proxy: &str) -> RuntimeResult<bool>;

    /// Probe a single proxy and return its delay.
    async fn probe_proxy(&self, proxy: &str) -> RuntimeResult<i32> {
        let _ = proxy;
        Err(RuntimeError::Unsupported("probe_proxy"))
    }

    /// Current session mode override, if any.
    async fn query_mode(&self) -> RuntimeResult<Option<TunnelMode>> {
        Err(RuntimeError::Unsupported("query_mode"))
    }

    /// Override the session mode; `None` restores the profile default.
    async fn patch_mode(&self, mode: Option<TunnelMode>) -> RuntimeResult<()> {
        let _ = mode;
        Err(RuntimeError::Unsupported("patch_mode"))
    }
}
