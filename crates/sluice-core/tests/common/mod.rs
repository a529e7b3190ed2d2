//! Shared fixtures for the runner integration tests: the allowlist and
//! executor wired for the film schema that `sluice-test-utils` seeds,
//! plus fast retry policies.

#![allow(dead_code)]

use std::sync::Arc;

use sqlx::PgPool;
use uuid::Uuid;

use sluice_core::dispatch::Dispatcher;
use sluice_core::exec::{Execute, PipelineExecutor};
use sluice_core::targets::{RelationalTarget, TargetCatalog};
use sluice_core::transform::TransformRegistry;
use sluice_core::write::EsConfig;
use sluice_db::models::{Pipeline, PipelineKind, PipelineMode};
use sluice_db::queries::pipelines::{self, NewPipeline};

pub use sluice_test_utils::{film_dim_rows, insert_films, seed_film_schema};

/// The test allowlist: `analytics.film_dim` keyed by `film_id`.
pub fn film_catalog() -> TargetCatalog {
    let mut catalog = TargetCatalog::new();
    catalog
        .add_relational(
            "analytics.film_dim",
            RelationalTarget {
                key_columns: vec!["film_id".into()],
                columns: vec!["film_id".into(), "title".into()],
            },
        )
        .expect("valid test target");
    catalog
}

/// Production executor with the test catalog and an empty registry.
pub fn film_executor() -> Arc<PipelineExecutor> {
    film_executor_with_registry(TransformRegistry::new())
}

pub fn film_executor_with_registry(registry: TransformRegistry) -> Arc<PipelineExecutor> {
    Arc::new(PipelineExecutor::new(
        Arc::new(registry),
        Arc::new(film_catalog()),
        EsConfig::default(),
    ))
}

/// A dispatcher with zero backoff so retry tests run instantly.
pub fn fast_dispatcher(executor: Arc<dyn Execute>) -> Dispatcher {
    Dispatcher::with_retry_policy(executor, 3, vec![std::time::Duration::ZERO])
}

/// Insert a SQL pipeline writing to `analytics.film_dim`.
pub async fn create_film_pipeline(
    pool: &PgPool,
    name: &str,
    mode: PipelineMode,
    source_query: &str,
    batch_size: i32,
) -> Pipeline {
    let cursor_keys = match mode {
        PipelineMode::Incremental => (Some("updated_at"), Some("film_id")),
        PipelineMode::Full => (None, None),
    };

    pipelines::insert_pipeline(
        pool,
        &NewPipeline {
            name,
            description: None,
            kind: PipelineKind::Sql,
            mode,
            enabled: true,
            source_query: Some(source_query),
            transform_name: None,
            target_table: "analytics.film_dim",
            batch_size,
            incremental_key: cursor_keys.0,
            incremental_id_key: cursor_keys.1,
        },
    )
    .await
    .expect("insert pipeline")
}

/// Force a status directly (test seeding only; production code always goes
/// through the CAS transitions).
pub async fn force_status(pool: &PgPool, id: Uuid, status: &str) {
    sqlx::query("UPDATE pipelines SET status = $1 WHERE id = $2")
        .bind(status)
        .bind(id)
        .execute(pool)
        .await
        .expect("force status");
}
