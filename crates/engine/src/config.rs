//! Engine configuration file.
//!
//! Settings live in `config.json` under the user config directory
//! (`STRATA_CONFIG_PATH` overrides the location). A missing file means
//! defaults; `STRATA_REGION` and `STRATA_ACCOUNT_ID` override the file.

use std::env;
use std::fs::{self, create_dir_all};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use dirs_next::config_dir;
use serde::{Deserialize, Serialize};

use crate::executor::{ApplyOptions, RetryPolicy};
use crate::resolve::{DEFAULT_ACCOUNT_ID, DEFAULT_REGION};
use crate::state::{JsonStateStore, StateStore, expand_tilde_path};

pub const CONFIG_PATH_ENV: &str = "STRATA_CONFIG_PATH";
pub const REGION_ENV: &str = "STRATA_REGION";
pub const ACCOUNT_ID_ENV: &str = "STRATA_ACCOUNT_ID";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub region: String,
    pub account_id: String,
    pub max_concurrency: usize,
    pub retry: RetryPolicy,
    pub rollback_on_failure: bool,
    pub delete_orphans: bool,
    /// State directory; `STRATA_STATE_PATH` or the platform default when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let options = ApplyOptions::default();
        Self {
            region: DEFAULT_REGION.to_string(),
            account_id: DEFAULT_ACCOUNT_ID.to_string(),
            max_concurrency: options.max_concurrency,
            retry: options.retry,
            rollback_on_failure: options.rollback_on_failure,
            delete_orphans: options.delete_orphans,
            state_path: None,
        }
    }
}

impl EngineConfig {
    pub fn apply_options(&self) -> ApplyOptions {
        ApplyOptions {
            max_concurrency: self.max_concurrency,
            retry: self.retry.clone(),
            rollback_on_failure: self.rollback_on_failure,
            delete_orphans: self.delete_orphans,
        }
    }

    pub fn state_store(&self) -> Arc<dyn StateStore> {
        Arc::new(JsonStateStore::new(self.state_path.clone().map(expand_tilde_path)))
    }
}

/// Returns the default path for the engine configuration file.
pub fn default_config_path() -> PathBuf {
    if let Ok(path) = env::var(CONFIG_PATH_ENV)
        && !path.trim().is_empty()
    {
        return expand_tilde_path(PathBuf::from(path));
    }

    config_dir().unwrap_or_else(|| PathBuf::from(".")).join("strata").join("config.json")
}

/// Loads configuration from the default path.
pub fn load_config() -> anyhow::Result<EngineConfig> {
    load_config_from_path(&default_config_path())
}

/// Loads configuration from a specific path, then applies environment overrides.
pub fn load_config_from_path(path: &Path) -> anyhow::Result<EngineConfig> {
    let mut config = if path.exists() {
        let content = fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("invalid configuration in {}", path.display()))?
    } else {
        EngineConfig::default()
    };

    if let Ok(region) = env::var(REGION_ENV)
        && !region.trim().is_empty()
    {
        config.region = region.trim().to_string();
    }
    if let Ok(account_id) = env::var(ACCOUNT_ID_ENV)
        && !account_id.trim().is_empty()
    {
        config.account_id = account_id.trim().to_string();
    }

    validate_config(&config)?;
    Ok(config)
}

pub fn save_config_to_path(config: &EngineConfig, path: &Path) -> anyhow::Result<()> {
    if let Some(parent_directory) = path.parent() {
        create_dir_all(parent_directory)?;
    }
    fs::write(path, serde_json::to_string_pretty(config)?)?;
    Ok(())
}

pub fn validate_config(config: &EngineConfig) -> anyhow::Result<()> {
    if config.max_concurrency == 0 {
        bail!("max_concurrency must be at least 1");
    }
    if config.retry.max_attempts == 0 {
        bail!("retry.max_attempts must be at least 1");
    }
    if config.retry.multiplier < 1.0 {
        bail!("retry.multiplier must be at least 1.0");
    }
    if config.retry.base_delay_ms > config.retry.max_delay_ms {
        bail!("retry.base_delay_ms must not exceed retry.max_delay_ms");
    }
    if config.account_id.len() != 12 || !config.account_id.chars().all(|c| c.is_ascii_digit()) {
        bail!("account_id must be a 12-digit number");
    }
    if config.region.trim().is_empty() {
        bail!("region must not be empty");
    }
    Ok(())
}
