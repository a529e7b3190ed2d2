//! The incremental strategy: resume from the checkpoint cursor and
//! advance it with every committed batch.
//!
//! The cursor is taken from the tail of the *source* batch (transforms
//! may reshape or drop rows, the reader's ordering is what the cursor
//! tracks). The checkpoint upsert rides in the same transaction as the
//! batch write, so the cursor can never point past uncommitted data.

use anyhow::{Context, Result, bail};
use tracing::{debug, info};

use sluice_db::queries::checkpoints as checkpoints_db;

use crate::error::ContractError;
use crate::exec::{ExecutionContext, pause_if_requested};
use crate::record::{Record, Value, record_from_row};
use crate::snapshot::{ExecutionPlan, PipelineSnapshot};
use crate::sql::{self, Cursor, CursorId};
use crate::transform::apply_chain;
use crate::write::resolve_writer;

pub(crate) async fn run_incremental(
    ctx: &ExecutionContext,
    snapshot: &PipelineSnapshot,
    plan: &ExecutionPlan,
) -> Result<(i64, i64)> {
    let Some(inc_key_raw) = snapshot.incremental_key.as_deref() else {
        bail!("incremental pipeline {} requires incremental_key", snapshot.name);
    };
    let Some(id_key_raw) = snapshot.incremental_id_key.as_deref() else {
        bail!(
            "incremental pipeline {} requires an explicit incremental_id_key",
            snapshot.name
        );
    };

    // Defence in depth: these names are interpolated into ORDER BY and the
    // cursor predicate, so they are re-validated at this boundary.
    let inc_key = sql::validate_identifier(inc_key_raw, "incremental_key")?;
    let id_key = sql::validate_identifier(id_key_raw, "incremental_id_key")?;

    let transforms: Vec<_> = plan
        .transform_names
        .iter()
        .map(|name| ctx.registry.resolve(name))
        .collect::<Result<_>>()?;

    let writer = resolve_writer(ctx.catalog.clone(), &ctx.es_config, &plan.target_table);

    let checkpoint = checkpoints_db::get_checkpoint(&ctx.pool, snapshot.id).await?;
    let mut cursor = Cursor::from_checkpoint(checkpoint.as_ref())?;

    let batch_size = i64::from(snapshot.batch_size.max(1));
    let mut total_read: i64 = 0;
    let mut total_written: i64 = 0;
    let mut batch_no: u64 = 0;

    info!(
        pipeline_id = %snapshot.id,
        name = %snapshot.name,
        run_id = %ctx.run_id,
        target = %plan.target_table,
        batch_size,
        inc_key,
        id_key,
        resuming = cursor.is_some(),
        "incremental run started"
    );

    let result = async {
        loop {
            batch_no += 1;

            let rows = fetch_batch(ctx, &plan.reader_sql, inc_key, id_key, cursor.as_ref(), batch_size)
                .await?;

            let Some(tail) = rows.last() else {
                info!(
                    pipeline_id = %snapshot.id,
                    run_id = %ctx.run_id,
                    batches = batch_no - 1,
                    total_read,
                    total_written,
                    "incremental run drained the source"
                );
                break;
            };

            let fetched = rows.len() as i64;
            total_read += fetched;

            debug!(
                pipeline_id = %snapshot.id,
                run_id = %ctx.run_id,
                batch = batch_no,
                fetched,
                "fetched batch"
            );

            // The new cursor comes from the source tail, before transforms.
            let next_cursor = cursor_from_tail(tail, inc_key, id_key)?;

            let transformed = apply_chain(&transforms, rows.clone()).await?;

            let mut tx = ctx.pool.begin().await?;
            let written = if transformed.is_empty() {
                0
            } else {
                writer
                    .write(&mut tx, &plan.target_table, &transformed)
                    .await?
            };
            checkpoints_db::upsert_checkpoint(
                &mut tx,
                snapshot.id,
                &Cursor::encode_value(&next_cursor.value),
                &cursor_id_text(&next_cursor.id),
            )
            .await?;
            tx.commit()
                .await
                .context("failed to commit batch and checkpoint")?;

            total_written += written as i64;
            cursor = Some(next_cursor);

            debug!(
                pipeline_id = %snapshot.id,
                run_id = %ctx.run_id,
                batch = batch_no,
                total_read,
                total_written,
                "batch and checkpoint committed"
            );

            if pause_if_requested(&ctx.pool, snapshot.id).await? {
                break;
            }
        }

        Ok((total_read, total_written))
    }
    .await;

    if let Err(close_err) = writer.close().await {
        tracing::warn!(
            pipeline_id = %snapshot.id,
            error = %close_err,
            "writer close failed"
        );
    }

    result
}

async fn fetch_batch(
    ctx: &ExecutionContext,
    reader_sql: &str,
    inc_key: &str,
    id_key: &str,
    cursor: Option<&Cursor>,
    limit: i64,
) -> Result<Vec<Record>> {
    let rows = match cursor {
        None => {
            let batch_sql = sql::incremental_first_batch(reader_sql, inc_key, id_key)?;
            sqlx::query(&batch_sql)
                .bind(limit)
                .fetch_all(&ctx.pool)
                .await
                .context("failed to fetch first incremental batch")?
        }
        Some(cursor) => {
            let batch_sql = sql::incremental_resume_batch(reader_sql, inc_key, id_key)?;
            let query = sqlx::query(&batch_sql).bind(cursor.value);
            let query = match &cursor.id {
                CursorId::Int(i) => query.bind(*i),
                CursorId::Text(t) => query.bind(t.as_str()),
            };
            query
                .bind(limit)
                .fetch_all(&ctx.pool)
                .await
                .context("failed to fetch incremental batch")?
        }
    };

    rows.iter().map(record_from_row).collect()
}

/// Derive the next cursor from the tail row of a batch.
///
/// A missing or non-timestamp cursor value means the pipeline definition
/// and the source query disagree; that is fatal, not retryable into
/// success.
fn cursor_from_tail(tail: &Record, inc_key: &str, id_key: &str) -> Result<Cursor> {
    let raw_value = tail
        .get(inc_key)
        .ok_or_else(|| ContractError::MissingColumn(inc_key.to_owned()))?;

    let Some(value) = raw_value.as_timestamp() else {
        bail!(ContractError::BadCursorValue {
            column: inc_key.to_owned(),
            actual: raw_value.type_label().to_owned(),
        });
    };

    let raw_id = tail
        .get(id_key)
        .ok_or_else(|| ContractError::MissingColumn(id_key.to_owned()))?;
    if matches!(raw_id, Value::Null) {
        bail!(ContractError::BadCursorValue {
            column: id_key.to_owned(),
            actual: "null".to_owned(),
        });
    }

    Ok(Cursor {
        value,
        id: CursorId::parse(&raw_id.to_cursor_id()),
    })
}

fn cursor_id_text(id: &CursorId) -> String {
    match id {
        CursorId::Int(i) => i.to_string(),
        CursorId::Text(t) => t.clone(),
    }
}
