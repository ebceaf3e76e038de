//! Settings that outrank the configuration file.
//!
//! Command-line flags and runtime toggles are layered on top of every
//! configuration the engine accepts, including each hot reload, so a file
//! change never silently reverts them.

use crate::config::schema::EngineConfig;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    /// `--controller`
    pub controller_url: Option<String>,
    /// `--secret`
    pub secret: Option<String>,
    /// Last sort-by-delay toggle received while running.
    pub sort_by_delay: Option<bool>,
}

impl ConfigOverrides {
    /// Write every set override into `config`.
    pub fn apply(&self, config: &mut EngineConfig) {
        if let Some(url) = &self.controller_url {
            config.runtime.controller_url = url.clone();
        }
        if let Some(secret) = &self.secret {
            config.runtime.secret = Some(secret.clone());
        }
        if let Some(enabled) = self.sort_by_delay {
            config.view.sort_by_delay = enabled;
        }
    }

    /// `config` with every set override written into it.
    pub fn applied_to(&self, config: &EngineConfig) -> EngineConfig {
        let mut next = config.clone();
        self.apply(&mut next);
        next
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}
