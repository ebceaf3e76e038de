//! Proxy and group data model.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::ProxySort;

/// Whether a group member is a concrete endpoint or a reference to another group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyKind {
    Terminal,
    Group,
}

/// A member of a proxy group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proxy {
    /// Name, unique within the owning group.
    pub name: String,
    pub kind: ProxyKind,
    /// Display hint (the runtime's proxy type, e.g. "Shadowsocks").
    pub subtitle: String,
    /// Last known latency in milliseconds; `<= 0` means unknown.
    pub delay: i32,
}

impl Proxy {
    pub fn terminal(name: impl Into<String>, subtitle: impl Into<String>, delay: i32) -> Self {
        Self {
            name: name.into(),
            kind: ProxyKind::Terminal,
            subtitle: subtitle.into(),
            delay,
        }
    }

    pub fn group(name: impl Into<String>, subtitle: impl Into<String>, delay: i32) -> Self {
        Self {
            name: name.into(),
            kind: ProxyKind::Group,
            subtitle: subtitle.into(),
            delay,
        }
    }

    pub fn is_group(&self) -> bool {
        self.kind == ProxyKind::Group
    }

    pub fn has_known_delay(&self) -> bool {
        is_known_delay(self.delay)
    }
}

/// A delay value counts as a measurement only when positive.
pub fn is_known_delay(delay: i32) -> bool {
    delay > 0
}

/// Group behavior as reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupKind {
    Selector,
    UrlTest,
    Fallback,
    LoadBalance,
    Relay,
}

impl GroupKind {
    /// Parse the runtime's type name; `None` for terminal proxy types.
    pub fn from_type_name(name: &str) -> Option<Self> {
        match name {
            "Selector" => Some(GroupKind::Selector),
            "URLTest" => Some(GroupKind::UrlTest),
            "Fallback" => Some(GroupKind::Fallback),
            "LoadBalance" => Some(GroupKind::LoadBalance),
            "Relay" => Some(GroupKind::Relay),
            _ => None,
        }
    }

    /// Only selector groups accept manual selection.
    pub fn is_selectable(&self) -> bool {
        matches!(self, GroupKind::Selector)
    }
}

/// Lightweight per-member record used for realtime delay updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkState {
    pub name: String,
    pub delay: i32,
}

/// Build the link table for a proxy list.
pub fn links_for(proxies: &[Proxy]) -> BTreeMap<String, LinkState> {
    proxies
        .iter()
        .map(|p| {
            (
                p.name.clone(),
                LinkState {
                    name: p.name.clone(),
                    delay: p.delay,
                },
            )
        })
        .collect()
}

/// A group as held by the topology store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyGroup {
    pub name: String,
    pub proxies: Vec<Proxy>,
    pub selectable: bool,
    pub now: Option<String>,
}

impl ProxyGroup {
    /// A freshly announced group awaiting its first reload.
    pub fn empty(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            proxies: Vec::new(),
            selectable: false,
            now: None,
        }
    }

    pub fn member(&self, name: &str) -> Option<&Proxy> {
        self.proxies.iter().find(|p| p.name == name)
    }

    /// The member `now` points at, if it is present in the list.
    pub fn selected(&self) -> Option<&Proxy> {
        self.now.as_deref().and_then(|now| self.member(now))
    }
}

/// Order proxies in place for the given sort mode.
///
/// Delay order puts known delays first (ascending) and unknown last;
/// the sort is stable so ties keep their previous order.
pub fn sort_proxies(proxies: &mut [Proxy], sort: ProxySort) {
    match sort {
        ProxySort::Default => {}
        ProxySort::Title => proxies.sort_by(|a, b| a.name.cmp(&b.name)),
        ProxySort::Delay => proxies.sort_by_key(|p| delay_sort_key(p.delay)),
    }
}

fn delay_sort_key(delay: i32) -> (bool, i32) {
    if is_known_delay(delay) {
        (false, delay)
    } else {
        (true, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_sort_puts_unknown_last() {
        let mut proxies = vec![
            Proxy::terminal("a", "Http", 0),
            Proxy::terminal("b", "Http", 300),
            Proxy::terminal("c", "Http", -1),
            Proxy::terminal("d", "Http", 40),
        ];
        sort_proxies(&mut proxies, ProxySort::Delay);

        let names: Vec<_> = proxies.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["d", "b", "a", "c"]);
    }

    #[test]
    fn test_selected_requires_member() {
        let mut group = ProxyGroup::empty("G");
        group.proxies.push(Proxy::terminal("P1", "Vmess", 10));
        group.now = Some("gone".into());
        assert!(group.selected().is_none());

        group.now = Some("P1".into());
        assert_eq!(group.selected().map(|p| p.delay), Some(10));
    }

    #[test]
    fn test_group_kind_names() {
        assert_eq!(GroupKind::from_type_name("URLTest"), Some(GroupKind::UrlTest));
        assert_eq!(GroupKind::from_type_name("Shadowsocks"), None);
        assert!(GroupKind::Selector.is_selectable());
        assert!(!GroupKind::Fallback.is_selectable());
    }
}
