//! Service configuration.
//!
//! Two knobs are runtime-configurable; everything else is a compile-time
//! constant. A missing config file means defaults.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use flowgate_common::consts;
use flowgate_common::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    /// Load and apply the LKG policy on service start; failure is non-fatal.
    #[serde(default)]
    pub auto_apply_lkg_on_startup: bool,

    #[serde(default)]
    pub file_watch: FileWatchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileWatchConfig {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

fn default_debounce_ms() -> u64 {
    consts::DEBOUNCE_DEFAULT_MS
}

impl Default for FileWatchConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            auto_apply_lkg_on_startup: false,
            file_watch: FileWatchConfig::default(),
        }
    }
}

impl ServiceConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            None => Self::default(),
            Some(path) if !path.exists() => {
                info!(path = %path.display(), "no config file; using defaults");
                Self::default()
            }
            Some(path) => {
                let bytes = std::fs::read(path)
                    .map_err(|e| Error::Service(format!("config read failed: {e}")))?;
                serde_json::from_slice(&bytes)
                    .map_err(|e| Error::Service(format!("config parse failed: {e}")))?
            }
        };
        config.file_watch.debounce_ms = config
            .file_watch
            .debounce_ms
            .clamp(consts::DEBOUNCE_MIN_MS, consts::DEBOUNCE_MAX_MS);
        Ok(config)
    }
}
