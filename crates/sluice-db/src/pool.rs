//! Connection handling: pool construction, the startup wait loop,
//! database bootstrap, and schema migrations.
//!
//! The runner takes its DSN as a plain URL string; resolution of that
//! string (flags, env, config file) belongs to the caller. Migrations are
//! embedded into the binary at compile time from this crate's
//! `migrations/` directory, so a deployed runner needs no source tree.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Connection, PgConnection, PgPool};
use tracing::{info, warn};

/// Connections held by the runner. One tick touches a handful of rows at
/// a time, so a small pool is plenty.
const POOL_SIZE: u32 = 5;

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum number of connection attempts during startup.
pub const DB_WAIT_ATTEMPTS: u32 = 10;

/// Startup ping delays in seconds. Once the table runs out the last delay
/// repeats until [`DB_WAIT_ATTEMPTS`] is exhausted.
const DB_WAIT_DELAYS: [u64; 4] = [1, 2, 4, 8];

/// Open a pool against `database_url`.
///
/// `test_before_acquire` pings each connection before handing it out so a
/// connection poisoned by a dropped network does not resurface on the
/// next tick.
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(POOL_SIZE)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .test_before_acquire(true)
        .connect(database_url)
        .await
        .with_context(|| format!("failed to connect to database at {database_url}"))?;
    Ok(pool)
}

/// Wait until the database answers a `SELECT 1`, then return a pool.
///
/// Retries up to [`DB_WAIT_ATTEMPTS`] times with delays 1, 2, 4, 8, 8, ...
/// seconds; the database is typically still starting up when the runner
/// boots alongside it.
pub async fn wait_for_db(database_url: &str) -> Result<PgPool> {
    let mut last_err = None;

    for attempt in 1..=DB_WAIT_ATTEMPTS {
        match ping(database_url).await {
            Ok(pool) => {
                info!(attempt, "database connection OK");
                return Ok(pool);
            }
            Err(e) => {
                let delay =
                    DB_WAIT_DELAYS[(attempt as usize - 1).min(DB_WAIT_DELAYS.len() - 1)];
                warn!(
                    attempt,
                    max_attempts = DB_WAIT_ATTEMPTS,
                    delay_secs = delay,
                    error = %e,
                    "database not ready"
                );
                last_err = Some(e);
                if attempt < DB_WAIT_ATTEMPTS {
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                }
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("database wait loop made no attempts")))
        .context("database did not become ready")
}

async fn ping(database_url: &str) -> Result<PgPool> {
    let pool = create_pool(database_url).await?;
    sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(&pool)
        .await
        .context("startup ping failed")?;
    Ok(pool)
}

/// Apply the migrations embedded from this crate's `migrations/`
/// directory.
pub async fn apply_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!()
        .run(pool)
        .await
        .context("failed to apply database migrations")?;

    info!("database migrations are up to date");
    Ok(())
}

/// Create the database named by `database_url` if it is absent.
///
/// Opens a single connection to the server's `postgres` database, checks
/// `pg_database`, and issues `CREATE DATABASE` over the simple protocol
/// (the statement cannot run inside a transaction or take parameters).
pub async fn create_database_if_missing(database_url: &str) -> Result<()> {
    let Some((server_url, db_name)) = split_dsn(database_url) else {
        bail!("database URL {database_url:?} has no database name");
    };

    let admin_url = format!("{server_url}/postgres");
    let mut admin = PgConnection::connect(&admin_url)
        .await
        .with_context(|| format!("failed to connect to {admin_url} to bootstrap the database"))?;

    let present = sqlx::query_scalar::<_, i32>("SELECT 1 FROM pg_database WHERE datname = $1")
        .bind(db_name)
        .fetch_optional(&mut admin)
        .await
        .context("failed to look up pg_database")?;

    if present.is_some() {
        info!(db = db_name, "database already exists");
    } else {
        let ddl = format!("CREATE DATABASE {}", quote_ident(db_name));
        sqlx::raw_sql(&ddl)
            .execute(&mut admin)
            .await
            .with_context(|| format!("failed to create database {db_name}"))?;
        info!(db = db_name, "database created");
    }

    let _ = admin.close().await;
    Ok(())
}

/// Split a DSN into its server half and database name, dropping any query
/// string. Returns `None` when the URL carries no database path.
fn split_dsn(url: &str) -> Option<(&str, &str)> {
    let (server, path) = url.rsplit_once('/')?;
    if !server.contains("://") {
        // The only '/' was part of the scheme separator.
        return None;
    }
    let name = path.split('?').next().unwrap_or("");
    if name.is_empty() {
        return None;
    }
    Some((server, name))
}

/// Double-quote an identifier for DDL, escaping embedded quotes.
/// `CREATE DATABASE` cannot bind its name as a parameter.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
