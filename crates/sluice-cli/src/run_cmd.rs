//! Runner and database lifecycle commands: `init`, `db init`, `run`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use sluice_core::record::{Record, Value};
use sluice_core::runner;
use sluice_core::transform::{FnTransform, TransformRegistry};
use sluice_db::pool;

use crate::config::{self, ConfigFile, DatabaseSection, SluiceConfig};

/// Write a fresh config file.
pub fn init(db_url: &str, force: bool) -> Result<()> {
    let path = config::config_path();
    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {} (use --force to overwrite)",
            path.display()
        );
    }

    let file = ConfigFile {
        database: DatabaseSection {
            url: db_url.to_owned(),
        },
        ..Default::default()
    };
    config::save_config(&file)?;
    println!("wrote config to {}", path.display());
    println!("add [targets.relational.\"schema.table\"] entries to allowlist sinks");
    Ok(())
}

/// Ensure the database exists and apply migrations.
pub async fn db_init(config: &SluiceConfig) -> Result<()> {
    pool::create_database_if_missing(&config.db_url).await?;
    let db_pool = pool::create_pool(&config.db_url).await?;
    pool::apply_migrations(&db_pool).await?;
    db_pool.close().await;
    println!("database initialized");
    Ok(())
}

/// Run the pipeline runner until interrupted.
pub async fn run(
    config: SluiceConfig,
    poll_interval_secs: Option<u64>,
    max_attempts: Option<u32>,
) -> Result<()> {
    let mut runner_config = config.runner_config;
    if let Some(secs) = poll_interval_secs {
        runner_config.poll_interval = Duration::from_secs(secs);
    }
    if let Some(attempts) = max_attempts {
        runner_config.max_attempts = attempts;
    }

    let registry = Arc::new(builtin_registry());
    let catalog = Arc::new(config.catalog);

    runner::run(
        &config.db_url,
        runner_config,
        registry,
        catalog,
        config.es_config,
    )
    .await
}

/// The transforms compiled into this binary.
///
/// Deployments with custom transforms link against `sluice-core` and
/// register their own implementations here.
pub fn builtin_registry() -> TransformRegistry {
    let mut registry = TransformRegistry::new();

    // Trims and de-duplicates whitespace in the `title` column.
    registry
        .register(Arc::new(FnTransform::new(
            "transforms.normalize_titles",
            |rows: Vec<Record>| {
                Ok(rows
                    .into_iter()
                    .map(|mut row| {
                        if let Some(Value::Text(title)) = row.get("title").cloned() {
                            let normalized =
                                title.split_whitespace().collect::<Vec<_>>().join(" ");
                            row.insert("title".to_owned(), Value::Text(normalized));
                        }
                        row
                    })
                    .collect())
            },
        )))
        .expect("builtin transform names are namespaced");

    registry
}
