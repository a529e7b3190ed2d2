//! Integration tests for run history and checkpoint queries.

use sluice_db::models::{PipelineKind, PipelineMode, RunStatus};
use sluice_db::queries::checkpoints;
use sluice_db::queries::pipelines::{self, NewPipeline};
use sluice_db::queries::runs::{self, ERROR_MESSAGE_CAP};
use sluice_test_utils::TestDb;

async fn seed_pipeline(pool: &sqlx::PgPool, name: &str) -> uuid::Uuid {
    pipelines::insert_pipeline(
        pool,
        &NewPipeline {
            name,
            description: None,
            kind: PipelineKind::Sql,
            mode: PipelineMode::Full,
            enabled: true,
            source_query: Some("SELECT 1 AS x ORDER BY x"),
            transform_name: None,
            target_table: "analytics.film_dim",
            batch_size: 1000,
            incremental_key: None,
            incremental_id_key: None,
        },
    )
    .await
    .expect("insert pipeline")
    .id
}

#[tokio::test]
async fn run_lifecycle_success() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    let pipeline_id = seed_pipeline(&pool, "run_success").await;

    let run = runs::start_run(&pool, pipeline_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Running);
    assert_eq!(run.rows_read, 0);
    assert!(run.finished_at.is_none());

    runs::finish_run_success(&pool, run.id, 10, 8).await.unwrap();

    let closed = runs::get_run(&pool, run.id).await.unwrap().unwrap();
    assert_eq!(closed.status, RunStatus::Success);
    assert_eq!(closed.rows_read, 10);
    assert_eq!(closed.rows_written, 8);
    let finished = closed.finished_at.expect("finished");
    assert!(finished >= closed.started_at);

    db.teardown().await;
}

#[tokio::test]
async fn run_failure_caps_the_error_message() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    let pipeline_id = seed_pipeline(&pool, "run_failed").await;

    let run = runs::start_run(&pool, pipeline_id).await.unwrap();
    let huge = "x".repeat(ERROR_MESSAGE_CAP * 2);
    runs::finish_run_failed(&pool, run.id, &huge).await.unwrap();

    let closed = runs::get_run(&pool, run.id).await.unwrap().unwrap();
    assert_eq!(closed.status, RunStatus::Failed);
    let message = closed.error_message.expect("message persisted");
    assert!(message.ends_with("...(truncated)"));
    assert!(message.chars().count() <= ERROR_MESSAGE_CAP + 20);

    db.teardown().await;
}

#[tokio::test]
async fn runs_list_newest_first() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    let pipeline_id = seed_pipeline(&pool, "run_order").await;

    let first = runs::start_run(&pool, pipeline_id).await.unwrap();
    runs::finish_run_success(&pool, first.id, 1, 1).await.unwrap();
    let second = runs::start_run(&pool, pipeline_id).await.unwrap();

    let listed = runs::list_runs_for_pipeline(&pool, pipeline_id, 10)
        .await
        .unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].id, second.id);
    assert_eq!(listed[1].id, first.id);

    let limited = runs::list_runs_for_pipeline(&pool, pipeline_id, 1)
        .await
        .unwrap();
    assert_eq!(limited.len(), 1);

    db.teardown().await;
}

#[tokio::test]
async fn orphaned_runs_are_failed_with_the_recovery_marker() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    let crashed = seed_pipeline(&pool, "orphaned").await;
    let other = seed_pipeline(&pool, "unrelated").await;

    let orphan = runs::start_run(&pool, crashed).await.unwrap();
    let healthy = runs::start_run(&pool, other).await.unwrap();
    runs::finish_run_success(&pool, healthy.id, 1, 1).await.unwrap();

    let rewritten = runs::fail_orphaned_runs(&pool, &[crashed]).await.unwrap();
    assert_eq!(rewritten, 1);

    let failed = runs::get_run(&pool, orphan.id).await.unwrap().unwrap();
    assert_eq!(failed.status, RunStatus::Failed);
    assert_eq!(
        failed.error_message.as_deref(),
        Some("recovered after runner crash")
    );

    let untouched = runs::get_run(&pool, healthy.id).await.unwrap().unwrap();
    assert_eq!(untouched.status, RunStatus::Success);

    // Empty id list is a no-op.
    assert_eq!(runs::fail_orphaned_runs(&pool, &[]).await.unwrap(), 0);

    db.teardown().await;
}

#[tokio::test]
async fn checkpoint_upsert_and_get() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    let pipeline_id = seed_pipeline(&pool, "checkpointed").await;

    assert!(
        checkpoints::get_checkpoint(&pool, pipeline_id)
            .await
            .unwrap()
            .is_none()
    );

    let mut conn = pool.acquire().await.unwrap();
    checkpoints::upsert_checkpoint(&mut conn, pipeline_id, "2024-01-01T00:00:00", "5")
        .await
        .unwrap();
    let first = checkpoints::get_checkpoint(&pool, pipeline_id)
        .await
        .unwrap()
        .expect("checkpoint exists");
    assert_eq!(first.last_processed_value.as_deref(), Some("2024-01-01T00:00:00"));
    assert_eq!(first.last_processed_id.as_deref(), Some("5"));

    // Upsert advances both halves together.
    checkpoints::upsert_checkpoint(&mut conn, pipeline_id, "2024-01-01T00:01:00", "1")
        .await
        .unwrap();
    let second = checkpoints::get_checkpoint(&pool, pipeline_id)
        .await
        .unwrap()
        .expect("checkpoint exists");
    assert_eq!(second.last_processed_value.as_deref(), Some("2024-01-01T00:01:00"));
    assert_eq!(second.last_processed_id.as_deref(), Some("1"));
    assert!(second.updated_at >= first.updated_at);
    drop(conn);

    db.teardown().await;
}

#[tokio::test]
async fn checkpoint_rolls_back_with_its_transaction() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    let pipeline_id = seed_pipeline(&pool, "rolled_back").await;

    // A writer failure aborts the batch transaction; the checkpoint
    // written inside it must vanish with the rollback.
    let mut tx = pool.begin().await.unwrap();
    checkpoints::upsert_checkpoint(&mut tx, pipeline_id, "2024-01-01T00:00:00", "5")
        .await
        .unwrap();
    tx.rollback().await.unwrap();

    assert!(
        checkpoints::get_checkpoint(&pool, pipeline_id)
            .await
            .unwrap()
            .is_none()
    );

    db.teardown().await;
}

#[tokio::test]
async fn checkpoint_delete_resets_the_cursor() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    let pipeline_id = seed_pipeline(&pool, "reset").await;

    let mut conn = pool.acquire().await.unwrap();
    checkpoints::upsert_checkpoint(&mut conn, pipeline_id, "2024-01-01T00:00:00", "5")
        .await
        .unwrap();
    drop(conn);

    assert_eq!(
        checkpoints::delete_checkpoint(&pool, pipeline_id).await.unwrap(),
        1
    );
    assert!(
        checkpoints::get_checkpoint(&pool, pipeline_id)
            .await
            .unwrap()
            .is_none()
    );
    assert_eq!(
        checkpoints::delete_checkpoint(&pool, pipeline_id).await.unwrap(),
        0
    );

    db.teardown().await;
}
