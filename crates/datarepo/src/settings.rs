//! Layered settings: an optional TOML file, then `DATAREPO__*` environment
//! variables.
//!
//! ```toml
//! [pool]
//! max_connections = 4
//! acquire_timeout_ms = 2000
//!
//! [session]
//! auto_flush = true
//! n1_threshold = 5
//!
//! [store]
//! lock_timeout_ms = 1000
//! ```
//!
//! `DATAREPO__POOL__MAX_CONNECTIONS=8` overrides the file.

use std::path::Path;

use config::{Config, Environment, File};
use datarepo_core::{Error, Result};
use datarepo_memory::MemoryStoreConfig;
use datarepo_pool::PoolConfig;
use datarepo_session::SessionConfig;
use serde::{Deserialize, Serialize};

/// Default location of the settings file.
pub const DEFAULT_SETTINGS_PATH: &str = "config/datarepo.toml";

const ENV_PREFIX: &str = "DATAREPO";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub store: MemoryStoreConfig,
}

impl Settings {
    /// Load from [`DEFAULT_SETTINGS_PATH`] (if present) and the environment.
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_SETTINGS_PATH)
    }

    /// Load from `path` (if present) and the environment.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let settings = Config::builder()
            .add_source(File::from(path).required(false))
            .add_source(environment())
            .build()
            .map_err(|e| {
                Error::Config(format!("cannot read settings from {}: {e}", path.display()))
            })?;
        let settings: Settings = settings
            .try_deserialize()
            .map_err(|e| Error::Config(format!("invalid settings: {e}")))?;
        tracing::debug!(
            path = %path.display(),
            max_connections = settings.pool.max_connections,
            auto_flush = settings.session.auto_flush,
            "Settings loaded"
        );
        Ok(settings)
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}
