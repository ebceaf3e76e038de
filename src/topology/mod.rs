//! Group topology.
//!
//! `model` holds the data types; `store` owns the ordered set of group names
//! and gates every write to published group state on that set.

pub mod model;
pub mod store;

pub use model::{GroupKind, LinkState, Proxy, ProxyGroup, ProxyKind};
pub use store::{TopologyChange, TopologyStore};
