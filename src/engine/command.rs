//! Intents accepted by the engine coordinator.

use thiserror::Error;
use tokio::sync::mpsc;

use crate::runtime::{RuntimeError, TunnelMode};

/// A request from the control layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    /// Reload every group from the runtime.
    ReloadAll,
    /// Reload one group.
    Reload(usize),
    /// Commit a manual selection.
    Select { index: usize, name: String },
    /// Run a test session for one group.
    UrlTest(usize),
    /// Override the runtime mode; `None` restores the profile default.
    PatchMode(Option<TunnelMode>),
    StopTest(usize),
    StopAll,
    /// Re-read group names and cascade when they changed.
    RefreshTopology,
    SetSortByDelay(bool),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine coordinator has stopped")]
    Closed,

    #[error("no group at index {0}")]
    UnknownIndex(usize),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Cloneable sender side of the coordinator's intent queue.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<Intent>,
}

impl EngineHandle {
    pub(crate) fn new(tx: mpsc::Sender<Intent>) -> Self {
        Self { tx }
    }

    pub async fn send(&self, intent: Intent) -> EngineResult<()> {
        self.tx.send(intent).await.map_err(|_| EngineError::Closed)
    }

    pub async fn reload_all(&self) -> EngineResult<()> {
        self.send(Intent::ReloadAll).await
    }

    pub async fn reload(&self, index: usize) -> EngineResult<()> {
        self.send(Intent::Reload(index)).await
    }

    pub async fn select(&self, index: usize, name: impl Into<String>) -> EngineResult<()> {
        self.send(Intent::Select {
            index,
            name: name.into(),
        })
        .await
    }

    pub async fn url_test(&self, index: usize) -> EngineResult<()> {
        self.send(Intent::UrlTest(index)).await
    }

    pub async fn patch_mode(&self, mode: Option<TunnelMode>) -> EngineResult<()> {
        self.send(Intent::PatchMode(mode)).await
    }

    pub async fn stop_test(&self, index: usize) -> EngineResult<()> {
        self.send(Intent::StopTest(index)).await
    }

    pub async fn stop_all(&self) -> EngineResult<()> {
        self.send(Intent::StopAll).await
    }

    pub async fn refresh_topology(&self) -> EngineResult<()> {
        self.send(Intent::RefreshTopology).await
    }

    pub async fn set_sort_by_delay(&self, enabled: bool) -> EngineResult<()> {
        self.send(Intent::SetSortByDelay(enabled)).await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
