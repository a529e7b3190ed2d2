//! Dispatcher behaviour: retry with backoff, terminal failure, pause
//! application, connectivity handling, and the claim race.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use sqlx::PgPool;

use sluice_core::exec::{Execute, ExecutionOutcome};
use sluice_core::manager::Manager;
use sluice_core::snapshot::PipelineSnapshot;
use sluice_core::state::PipelineStateMachine;
use sluice_db::models::{PipelineMode, PipelineStatus, RunStatus};
use sluice_db::queries::pipelines as pipelines_db;
use sluice_db::queries::runs as runs_db;
use sluice_test_utils::TestDb;

use common::*;

/// Records a run per attempt, failing the first `failures` attempts.
struct FlakyExecutor {
    failures: u32,
    attempts: AtomicU32,
}

impl FlakyExecutor {
    fn new(failures: u32) -> Self {
        Self {
            failures,
            attempts: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Execute for FlakyExecutor {
    async fn execute(
        &self,
        pool: &PgPool,
        snapshot: &PipelineSnapshot,
    ) -> Result<ExecutionOutcome> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let run = runs_db::start_run(pool, snapshot.id).await?;

        if attempt <= self.failures {
            runs_db::finish_run_failed(pool, run.id, "simulated writer failure").await?;
            return Err(anyhow!("simulated writer failure on attempt {attempt}"));
        }

        runs_db::finish_run_success(pool, run.id, 3, 3).await?;
        Ok(ExecutionOutcome {
            rows_read: 3,
            rows_written: 3,
        })
    }
}

/// Fails with an error the classifier recognizes as connectivity.
struct DisconnectedExecutor;

#[async_trait]
impl Execute for DisconnectedExecutor {
    async fn execute(&self, _pool: &PgPool, _snapshot: &PipelineSnapshot) -> Result<ExecutionOutcome> {
        Err(anyhow::Error::new(sqlx::Error::PoolTimedOut).context("fetching batch"))
    }
}

#[tokio::test]
async fn retry_twice_then_succeed_records_three_runs() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    seed_film_schema(&pool).await;

    let pipeline = create_film_pipeline(
        &pool,
        "flaky",
        PipelineMode::Full,
        "SELECT film_id, title FROM src.films ORDER BY film_id",
        10,
    )
    .await;
    force_status(&pool, pipeline.id, "RUN_REQUESTED").await;
    let pipeline = pipelines_db::get_pipeline(&pool, pipeline.id)
        .await
        .unwrap()
        .unwrap();

    let executor = Arc::new(FlakyExecutor::new(2));
    let dispatcher = fast_dispatcher(executor.clone());

    dispatcher.dispatch(&pool, &pipeline).await.unwrap();

    assert_eq!(executor.attempts.load(Ordering::SeqCst), 3);

    let runs = runs_db::list_runs_for_pipeline(&pool, pipeline.id, 10)
        .await
        .unwrap();
    assert_eq!(runs.len(), 3);
    let failed = runs.iter().filter(|r| r.status == RunStatus::Failed).count();
    let succeeded = runs.iter().filter(|r| r.status == RunStatus::Success).count();
    assert_eq!((failed, succeeded), (2, 1));

    assert_eq!(
        pipelines_db::get_status(&pool, pipeline.id).await.unwrap(),
        PipelineStatus::Idle
    );

    db.teardown().await;
}

#[tokio::test]
async fn exhausted_retries_fail_the_pipeline() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    seed_film_schema(&pool).await;

    let pipeline = create_film_pipeline(
        &pool,
        "always_failing",
        PipelineMode::Full,
        "SELECT film_id, title FROM src.films ORDER BY film_id",
        10,
    )
    .await;
    force_status(&pool, pipeline.id, "RUN_REQUESTED").await;
    let pipeline = pipelines_db::get_pipeline(&pool, pipeline.id)
        .await
        .unwrap()
        .unwrap();

    let dispatcher = fast_dispatcher(Arc::new(FlakyExecutor::new(u32::MAX)));
    let result = dispatcher.dispatch(&pool, &pipeline).await;
    assert!(result.is_err(), "terminal failure surfaces to the tick");

    let runs = runs_db::list_runs_for_pipeline(&pool, pipeline.id, 10)
        .await
        .unwrap();
    assert_eq!(runs.len(), 3);
    assert!(runs.iter().all(|r| r.status == RunStatus::Failed));

    assert_eq!(
        pipelines_db::get_status(&pool, pipeline.id).await.unwrap(),
        PipelineStatus::Failed
    );

    db.teardown().await;
}

#[tokio::test]
async fn connectivity_failure_leaves_pipeline_running() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    seed_film_schema(&pool).await;

    let pipeline = create_film_pipeline(
        &pool,
        "disconnected",
        PipelineMode::Full,
        "SELECT film_id, title FROM src.films ORDER BY film_id",
        10,
    )
    .await;
    force_status(&pool, pipeline.id, "RUN_REQUESTED").await;
    let pipeline = pipelines_db::get_pipeline(&pool, pipeline.id)
        .await
        .unwrap()
        .unwrap();

    let dispatcher = fast_dispatcher(Arc::new(DisconnectedExecutor));
    dispatcher
        .dispatch(&pool, &pipeline)
        .await
        .expect("connectivity is not a dispatch error");

    // The pipeline stays RUNNING for startup recovery to re-queue.
    assert_eq!(
        pipelines_db::get_status(&pool, pipeline.id).await.unwrap(),
        PipelineStatus::Running
    );

    db.teardown().await;
}

#[tokio::test]
async fn pause_requested_is_applied_without_executing() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    seed_film_schema(&pool).await;

    let pipeline = create_film_pipeline(
        &pool,
        "pause_me",
        PipelineMode::Full,
        "SELECT film_id, title FROM src.films ORDER BY film_id",
        10,
    )
    .await;
    force_status(&pool, pipeline.id, "PAUSE_REQUESTED").await;
    let pipeline = pipelines_db::get_pipeline(&pool, pipeline.id)
        .await
        .unwrap()
        .unwrap();

    let executor = Arc::new(FlakyExecutor::new(0));
    let dispatcher = fast_dispatcher(executor.clone());
    dispatcher.dispatch(&pool, &pipeline).await.unwrap();

    assert_eq!(executor.attempts.load(Ordering::SeqCst), 0, "nothing ran");
    assert_eq!(
        pipelines_db::get_status(&pool, pipeline.id).await.unwrap(),
        PipelineStatus::Paused
    );

    db.teardown().await;
}

#[tokio::test]
async fn concurrent_claims_elect_exactly_one_winner() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    seed_film_schema(&pool).await;

    let pipeline = create_film_pipeline(
        &pool,
        "contested",
        PipelineMode::Full,
        "SELECT film_id, title FROM src.films ORDER BY film_id",
        10,
    )
    .await;
    force_status(&pool, pipeline.id, "RUN_REQUESTED").await;

    let (a, b) = tokio::join!(
        PipelineStateMachine::claim(&pool, pipeline.id),
        PipelineStateMachine::claim(&pool, pipeline.id),
    );
    let a = a.unwrap();
    let b = b.unwrap();

    assert!(
        a.is_some() ^ b.is_some(),
        "exactly one replica must win the claim"
    );
    assert_eq!(
        pipelines_db::get_status(&pool, pipeline.id).await.unwrap(),
        PipelineStatus::Running
    );

    db.teardown().await;
}

#[tokio::test]
async fn pause_then_run_preserves_the_run_intent() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    seed_film_schema(&pool).await;

    let pipeline = create_film_pipeline(
        &pool,
        "intent",
        PipelineMode::Full,
        "SELECT film_id, title FROM src.films ORDER BY film_id",
        10,
    )
    .await;
    force_status(&pool, pipeline.id, "RUN_REQUESTED").await;

    // pause on a RUN_REQUESTED pipeline, then run again.
    assert!(PipelineStateMachine::request_pause(&pool, pipeline.id).await.unwrap());
    assert_eq!(
        pipelines_db::get_status(&pool, pipeline.id).await.unwrap(),
        PipelineStatus::PauseRequested
    );

    assert!(PipelineStateMachine::request_run(&pool, pipeline.id).await.unwrap());
    let status = pipelines_db::get_status(&pool, pipeline.id).await.unwrap();
    assert!(
        matches!(status, PipelineStatus::RunRequested | PipelineStatus::Running),
        "the user's run intent survives, got {status}"
    );

    db.teardown().await;
}

#[tokio::test]
async fn one_failing_pipeline_does_not_block_the_tick() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    seed_film_schema(&pool).await;
    insert_films(&pool, &[(1, "A", "2024-01-01 00:00:00")]).await;

    // "a_broken" sorts first, so the tick hits the failure before the
    // healthy pipeline.
    let broken = create_film_pipeline(
        &pool,
        "a_broken",
        PipelineMode::Full,
        "SELECT film_id, title FROM src.films", // no ORDER BY: rejected
        10,
    )
    .await;
    let healthy = create_film_pipeline(
        &pool,
        "b_healthy",
        PipelineMode::Full,
        "SELECT film_id, title FROM src.films ORDER BY film_id",
        10,
    )
    .await;
    force_status(&pool, broken.id, "RUN_REQUESTED").await;
    force_status(&pool, healthy.id, "RUN_REQUESTED").await;

    let manager = Manager::new(fast_dispatcher(film_executor()));
    let result = manager.tick(&pool).await.unwrap();

    assert_eq!(result.pipelines_found, 2);
    assert_eq!(result.pipelines_processed, 1);

    assert_eq!(
        pipelines_db::get_status(&pool, broken.id).await.unwrap(),
        PipelineStatus::Failed
    );
    assert_eq!(
        pipelines_db::get_status(&pool, healthy.id).await.unwrap(),
        PipelineStatus::Idle
    );
    assert_eq!(film_dim_rows(&pool).await.len(), 1);

    db.teardown().await;
}
