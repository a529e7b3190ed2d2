//! The long-running runner: wait for the database, recover crashed
//! pipelines, then tick forever.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info, warn};

use sluice_db::pool;

use crate::dispatch::{DEFAULT_MAX_ATTEMPTS, Dispatcher};
use crate::exec::PipelineExecutor;
use crate::manager::Manager;
use crate::recovery;
use crate::targets::TargetCatalog;
use crate::transform::TransformRegistry;
use crate::write::EsConfig;

/// Runner loop settings.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Delay between ticks.
    pub poll_interval: Duration,
    /// Execution attempts per claimed pipeline.
    pub max_attempts: u32,
    /// Backoff before each retry; the last entry repeats.
    pub backoff: Vec<Duration>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
            ],
        }
    }
}

/// Run the runner until a shutdown signal arrives.
///
/// Startup: wait for the database (bounded retries), then crash recovery,
/// then the tick loop. Tick failures are logged and the loop keeps going;
/// the next tick gets a fresh connection from the pre-pinged pool.
pub async fn run(
    database_url: &str,
    config: RunnerConfig,
    registry: Arc<TransformRegistry>,
    catalog: Arc<TargetCatalog>,
    es_config: EsConfig,
) -> Result<()> {
    info!("runner starting up");

    let db_pool = pool::wait_for_db(database_url).await?;

    let report = recovery::recover_on_startup(&db_pool).await?;
    if report.pipelines_requeued > 0 {
        info!(
            pipelines = report.pipelines_requeued,
            runs = report.runs_failed,
            "startup recovery complete"
        );
    }

    let executor = Arc::new(PipelineExecutor::new(registry, catalog, es_config));
    let dispatcher =
        Dispatcher::with_retry_policy(executor, config.max_attempts, config.backoff.clone());
    let manager = Manager::new(dispatcher);

    info!(
        poll_interval_secs = config.poll_interval.as_secs(),
        "entering main loop"
    );

    loop {
        match manager.tick(&db_pool).await {
            Ok(result) => {
                debug!(
                    found = result.pipelines_found,
                    processed = result.pipelines_processed,
                    "tick complete"
                );
            }
            Err(err) => {
                // Typically connectivity: the pool recycles bad connections
                // and the next tick retries.
                warn!(error = %err, "tick failed");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(config.poll_interval) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                return Ok(());
            }
        }
    }
}
