//! The full strategy: re-read the whole source with offset pagination.
//!
//! The offset advances by the number of rows actually fetched, not by the
//! configured batch size, so a short page never skips source rows.

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::exec::{ExecutionContext, pause_if_requested};
use crate::record::{Record, record_from_row};
use crate::snapshot::{ExecutionPlan, PipelineSnapshot};
use crate::sql;
use crate::transform::apply_chain;
use crate::write::resolve_writer;

pub(crate) async fn run_full(
    ctx: &ExecutionContext,
    snapshot: &PipelineSnapshot,
    plan: &ExecutionPlan,
) -> Result<(i64, i64)> {
    let transforms: Vec<_> = plan
        .transform_names
        .iter()
        .map(|name| ctx.registry.resolve(name))
        .collect::<Result<_>>()?;

    let writer = resolve_writer(ctx.catalog.clone(), &ctx.es_config, &plan.target_table);

    let batch_size = i64::from(snapshot.batch_size.max(1));
    let mut offset: i64 = 0;
    let mut total_read: i64 = 0;
    let mut total_written: i64 = 0;
    let mut batch_no: u64 = 0;

    info!(
        pipeline_id = %snapshot.id,
        name = %snapshot.name,
        run_id = %ctx.run_id,
        target = %plan.target_table,
        batch_size,
        "full run started"
    );

    let result = async {
        loop {
            batch_no += 1;

            let batch_sql = sql::paginate(&plan.reader_sql, batch_size, offset)?;
            let rows = sqlx::query(&batch_sql)
                .fetch_all(&ctx.pool)
                .await
                .context("failed to fetch source batch")?;

            let fetched = rows.len() as i64;
            debug!(
                pipeline_id = %snapshot.id,
                run_id = %ctx.run_id,
                batch = batch_no,
                offset,
                fetched,
                "fetched batch"
            );

            if fetched == 0 {
                info!(
                    pipeline_id = %snapshot.id,
                    run_id = %ctx.run_id,
                    batches = batch_no - 1,
                    total_read,
                    total_written,
                    "full run drained the source"
                );
                break;
            }

            total_read += fetched;

            let records: Vec<Record> = rows
                .iter()
                .map(record_from_row)
                .collect::<Result<_>>()?;

            let transformed = apply_chain(&transforms, records).await?;

            if !transformed.is_empty() {
                let mut tx = ctx.pool.begin().await?;
                let written = writer
                    .write(&mut tx, &plan.target_table, &transformed)
                    .await?;
                tx.commit().await.context("failed to commit batch")?;
                total_written += written as i64;
            }

            debug!(
                pipeline_id = %snapshot.id,
                run_id = %ctx.run_id,
                batch = batch_no,
                total_read,
                total_written,
                "batch committed"
            );

            if pause_if_requested(&ctx.pool, snapshot.id).await? {
                break;
            }

            // Advance by what was actually fetched, not by batch_size.
            offset += fetched;
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
