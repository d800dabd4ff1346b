//! Engine configuration management.
//!
//! Holds the API base URL, the active scope and the TTL defaults, plus
//! per-resource overrides. Stored at `~/.config/viewcache/config.json`.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::resource::{ResourceConfig, DEFAULT_FRESH_TTL, DEFAULT_STALE_TTL};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "viewcache";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Scope used when none is configured
pub const DEFAULT_SCOPE: &str = "default";

/// TTL and polling overrides for one resource. Unset fields fall back to
/// the engine defaults.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ResourcePolicy {
    pub fresh_ttl_secs: Option<u64>,
    pub stale_ttl_secs: Option<u64>,
    pub poll_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    pub api_base_url: Option<String>,
    pub scope: Option<String>,
    pub default_fresh_ttl_secs: u64,
    pub default_stale_ttl_secs: u64,
    pub resources: BTreeMap<String, ResourcePolicy>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_base_url: None,
            scope: None,
            default_fresh_ttl_secs: DEFAULT_FRESH_TTL.as_secs(),
            default_stale_ttl_secs: DEFAULT_STALE_TTL.as_secs(),
            resources: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    pub fn load() -> Result<Self> {
        Self::load_from(Self::config_path()?)
    }

    pub fn load_from(path: PathBuf) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            Ok(serde_json::from_str(&contents)?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(Self::config_path()?)
    }

    pub fn save_to(&self, path: PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Persistent tier location, one directory per scope.
    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME).join(self.scope()))
    }

    pub fn scope(&self) -> &str {
        self.scope.as_deref().unwrap_or(DEFAULT_SCOPE)
    }

    /// Apply the configured TTLs and poll interval for `config.name`.
    pub fn apply_policy(&self, config: ResourceConfig) -> ResourceConfig {
        let policy = self.resources.get(&config.name).cloned().unwrap_or_default();
        let fresh = policy.fresh_ttl_secs.unwrap_or(self.default_fresh_ttl_secs);
        let stale = policy.stale_ttl_secs.unwrap_or(self.default_stale_ttl_secs);
        let config = config.ttl(Duration::from_secs(fresh), Duration::from_secs(stale));
        match policy.poll_secs {
            Some(secs) => config.poll_every(Duration::from_secs(secs)),
            None => config,
        }
    }
}
