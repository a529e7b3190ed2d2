//! Configuration file management for sluice.
//!
//! Provides a TOML-based config file at `~/.config/sluice/config.toml` and
//! a resolution chain: CLI flag > env var > config file > default.
//!
//! The config file also carries the administrator-controlled target
//! allowlist; entries are validated as they are loaded into the catalog.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use sluice_core::runner::RunnerConfig;
use sluice_core::targets::{IndexTarget, RelationalTarget, TargetCatalog};
use sluice_core::write::EsConfig;

/// Connection URL used when neither flag, env, nor config file names one.
pub const DEFAULT_DB_URL: &str = "postgresql://localhost:5432/sluice";

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elasticsearch: Option<EsConfig>,
    #[serde(default)]
    pub runner: RunnerSection,
    #[serde(default)]
    pub targets: TargetsSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            url: DEFAULT_DB_URL.to_owned(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RunnerSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

/// Raw allowlist as written in the config file.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TargetsSection {
    #[serde(default)]
    pub relational: BTreeMap<String, RelationalTarget>,
    #[serde(default)]
    pub indices: BTreeMap<String, IndexTarget>,
}

impl TargetsSection {
    /// Validate every entry and build the runtime catalog.
    pub fn into_catalog(self) -> Result<TargetCatalog> {
        let mut catalog = TargetCatalog::new();
        for (table, target) in self.relational {
            catalog
                .add_relational(&table, target)
                .with_context(|| format!("invalid relational target {table:?} in config"))?;
        }
        for (index, target) in self.indices {
            catalog
                .add_index(&index, target)
                .with_context(|| format!("invalid index target {index:?} in config"))?;
        }
        Ok(catalog)
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the sluice config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/sluice` or `~/.config/sluice`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("sluice");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("sluice")
}

/// Return the path to the sluice config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct SluiceConfig {
    pub db_url: String,
    pub es_config: EsConfig,
    pub runner_config: RunnerConfig,
    pub catalog: TargetCatalog,
}

impl SluiceConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config
    /// file > default.
    pub fn resolve(cli_db_url: Option<&str>) -> Result<Self> {
        let file_config = load_config().ok();

        // DB URL resolution.
        let db_url = if let Some(url) = cli_db_url {
            url.to_string()
        } else if let Ok(url) = std::env::var("SLUICE_DATABASE_URL") {
            url
        } else if let Some(ref cfg) = file_config {
            cfg.database.url.clone()
        } else {
            DEFAULT_DB_URL.to_string()
        };

        // Document-index settings: env wins over the config file.
        let es_config = if std::env::var("SLUICE_ES_URL").is_ok() {
            EsConfig::from_env()
        } else {
            file_config
                .as_ref()
                .and_then(|cfg| cfg.elasticsearch.clone())
                .unwrap_or_default()
        };

        let mut runner_config = RunnerConfig::default();
        if let Some(ref cfg) = file_config {
            if let Some(secs) = cfg.runner.poll_interval_secs {
                runner_config.poll_interval = Duration::from_secs(secs);
            }
            if let Some(attempts) = cfg.runner.max_attempts {
                runner_config.max_attempts = attempts;
            }
        }

        let catalog = match file_config {
            Some(cfg) => cfg.targets.into_catalog()?,
            None => TargetCatalog::new(),
        };

        Ok(Self {
            db_url,
            es_config,
            runner_config,
            catalog,
        })
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
