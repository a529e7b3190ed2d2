//! Integration tests for pipeline queries: CRUD, the candidate listing,
//! and the conditional status transitions.

use sluice_db::models::{PipelineKind, PipelineMode, PipelineStatus};
use sluice_db::queries::pipelines::{self, NewPipeline, PipelinePatch};
use sluice_db::queries::steps::{self, NewStep};
use sluice_test_utils::TestDb;

fn new_pipeline(name: &str) -> NewPipeline<'_> {
    NewPipeline {
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
    }
}

#[tokio::test]
async fn insert_and_get_pipeline() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();

    let inserted = pipelines::insert_pipeline(&pool, &new_pipeline("films"))
        .await
        .expect("insert should succeed");
    assert_eq!(inserted.name, "films");
    assert_eq!(inserted.status, PipelineStatus::Idle);
    assert_eq!(inserted.kind, PipelineKind::Sql);
    assert!(inserted.enabled);

    let fetched = pipelines::get_pipeline(&pool, inserted.id)
        .await
        .expect("get should succeed")
        .expect("pipeline should exist");
    assert_eq!(fetched.id, inserted.id);

    let by_name = pipelines::get_pipeline_by_name(&pool, "films")
        .await
        .expect("get_by_name should succeed")
        .expect("pipeline should exist");
    assert_eq!(by_name.id, inserted.id);

    db.teardown().await;
}

#[tokio::test]
async fn unique_name_constraint() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();

    pipelines::insert_pipeline(&pool, &new_pipeline("dup"))
        .await
        .expect("first insert");
    let second = pipelines::insert_pipeline(&pool, &new_pipeline("dup")).await;
    assert!(second.is_err(), "duplicate name must be rejected");

    db.teardown().await;
}

#[tokio::test]
async fn candidates_are_requested_enabled_and_name_ordered() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();

    let b = pipelines::insert_pipeline(&pool, &new_pipeline("b_run"))
        .await
        .unwrap();
    let a = pipelines::insert_pipeline(&pool, &new_pipeline("a_pause"))
        .await
        .unwrap();
    let idle = pipelines::insert_pipeline(&pool, &new_pipeline("c_idle"))
        .await
        .unwrap();
    let disabled = pipelines::insert_pipeline(&pool, &new_pipeline("d_disabled"))
        .await
        .unwrap();

    pipelines::transition_status(&pool, b.id, &[PipelineStatus::Idle], PipelineStatus::RunRequested)
        .await
        .unwrap();
    pipelines::transition_status(
        &pool,
        a.id,
        &[PipelineStatus::Idle],
        PipelineStatus::PauseRequested,
    )
    .await
    .unwrap();
    pipelines::transition_status(
        &pool,
        disabled.id,
        &[PipelineStatus::Idle],
        PipelineStatus::RunRequested,
    )
    .await
    .unwrap();
    pipelines::update_pipeline(
        &pool,
        disabled.id,
        &PipelinePatch {
            enabled: Some(false),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let candidates = pipelines::list_candidates(&pool).await.unwrap();
    let names: Vec<&str> = candidates.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["a_pause", "b_run"]);
    assert!(candidates.iter().all(|p| p.id != idle.id));

    db.teardown().await;
}

#[tokio::test]
async fn transition_is_a_compare_and_swap() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();

    let p = pipelines::insert_pipeline(&pool, &new_pipeline("cas"))
        .await
        .unwrap();

    // Matching from-state: 1 row.
    let rows = pipelines::transition_status(
        &pool,
        p.id,
        &[PipelineStatus::Idle],
        PipelineStatus::RunRequested,
    )
    .await
    .unwrap();
    assert_eq!(rows, 1);

    // Stale from-state: 0 rows, status unchanged.
    let rows = pipelines::transition_status(
        &pool,
        p.id,
        &[PipelineStatus::Idle],
        PipelineStatus::PauseRequested,
    )
    .await
    .unwrap();
    assert_eq!(rows, 0);
    assert_eq!(
        pipelines::get_status(&pool, p.id).await.unwrap(),
        PipelineStatus::RunRequested
    );

    // Multi-state from-set.
    let rows = pipelines::transition_status(
        &pool,
        p.id,
        &[PipelineStatus::Running, PipelineStatus::RunRequested],
        PipelineStatus::PauseRequested,
    )
    .await
    .unwrap();
    assert_eq!(rows, 1);

    db.teardown().await;
}

#[tokio::test]
async fn claim_returns_the_row_once() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();

    let p = pipelines::insert_pipeline(&pool, &new_pipeline("claimable"))
        .await
        .unwrap();
    pipelines::transition_status(&pool, p.id, &[PipelineStatus::Idle], PipelineStatus::RunRequested)
        .await
        .unwrap();

    let first = pipelines::claim_run_requested(&pool, p.id).await.unwrap();
    let claimed = first.expect("first claim wins");
    assert_eq!(claimed.status, PipelineStatus::Running);

    let second = pipelines::claim_run_requested(&pool, p.id).await.unwrap();
    assert!(second.is_none(), "second claim loses the race");

    db.teardown().await;
}

#[tokio::test]
async fn requeue_running_only_touches_running_rows() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();

    let running = pipelines::insert_pipeline(&pool, &new_pipeline("was_running"))
        .await
        .unwrap();
    let idle = pipelines::insert_pipeline(&pool, &new_pipeline("still_idle"))
        .await
        .unwrap();

    sqlx::query("UPDATE pipelines SET status = 'RUNNING' WHERE id = $1")
        .bind(running.id)
        .execute(&pool)
        .await
        .unwrap();

    let ids = pipelines::list_running_ids(&pool).await.unwrap();
    assert_eq!(ids, vec![running.id]);

    let requeued = pipelines::requeue_running(&pool, &[running.id, idle.id])
        .await
        .unwrap();
    assert_eq!(requeued, 1);
    assert_eq!(
        pipelines::get_status(&pool, running.id).await.unwrap(),
        PipelineStatus::RunRequested
    );
    assert_eq!(
        pipelines::get_status(&pool, idle.id).await.unwrap(),
        PipelineStatus::Idle
    );

    db.teardown().await;
}

#[tokio::test]
async fn patch_updates_only_provided_fields() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();

    let p = pipelines::insert_pipeline(&pool, &new_pipeline("patchable"))
        .await
        .unwrap();

    let updated = pipelines::update_pipeline(
        &pool,
        p.id,
        &PipelinePatch {
            batch_size: Some(42),
            description: Some("patched".into()),
            ..Default::default()
        },
    )
    .await
    .unwrap()
    .expect("pipeline exists");

    assert_eq!(updated.batch_size, 42);
    assert_eq!(updated.description.as_deref(), Some("patched"));
    // Untouched fields survive.
    assert_eq!(updated.source_query, p.source_query);
    assert_eq!(updated.target_table, p.target_table);
    assert!(updated.updated_at >= p.updated_at);

    db.teardown().await;
}

#[tokio::test]
async fn steps_are_listed_in_order_and_position_is_unique() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();

    let p = pipelines::insert_pipeline(&pool, &new_pipeline("stepped"))
        .await
        .unwrap();

    steps::insert_step(
        &pool,
        &NewStep {
            pipeline_id: p.id,
            order_index: 2,
            step_kind: sluice_db::models::StepKind::Transform,
            body: "transforms.normalize_titles",
            target_table: None,
        },
    )
    .await
    .unwrap();
    steps::insert_step(
        &pool,
        &NewStep {
            pipeline_id: p.id,
            order_index: 1,
            step_kind: sluice_db::models::StepKind::Sql,
            body: "SELECT 1 AS x ORDER BY x",
            target_table: None,
        },
    )
    .await
    .unwrap();

    let listed = steps::list_steps_for_pipeline(&pool, p.id).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].order_index, 1);
    assert_eq!(listed[1].order_index, 2);

    let duplicate = steps::insert_step(
        &pool,
        &NewStep {
            pipeline_id: p.id,
            order_index: 1,
            step_kind: sluice_db::models::StepKind::Transform,
            body: "transforms.other",
            target_table: None,
        },
    )
    .await;
    assert!(duplicate.is_err(), "duplicate order_index must be rejected");

    db.teardown().await;
}
