//! PostgreSQL fixtures for the sluice integration suites.
//!
//! A single server backs the whole test binary: either the one named by
//! `SLUICE_TEST_PG_URL` (pre-started by CI) or a container booted on
//! first use. Each test then gets a [`TestDb`] of its own, created and
//! migrated through the same `sluice_db::pool` bootstrap path the runner
//! uses in production.
//!
//! The film source/sink schema the runner suites read and write lives
//! here too, so every suite exercises the same tables.

use sqlx::{Connection, PgConnection, PgPool};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

use sluice_db::pool;

struct PgServer {
    base_url: String,
    // Dropping the container kills it; park the handle for the whole
    // test binary. `None` when an external server is used.
    _keepalive: Option<ContainerAsync<Postgres>>,
}

static SERVER: OnceCell<PgServer> = OnceCell::const_new();

async fn server() -> &'static PgServer {
    SERVER
        .get_or_init(|| async {
            if let Ok(base_url) = std::env::var("SLUICE_TEST_PG_URL") {
                return PgServer {
                    base_url,
                    _keepalive: None,
                };
            }

            let container = Postgres::default()
                .with_tag("16")
                .start()
                .await
                .expect("failed to start the PostgreSQL test container");
            let host = container.get_host().await.expect("container host");
            let port = container
                .get_host_port_ipv4(5432)
                .await
                .expect("container port");

            PgServer {
                base_url: format!("postgresql://postgres:postgres@{host}:{port}"),
                _keepalive: Some(container),
            }
        })
        .await
}

/// One isolated, fully migrated database inside the shared server.
///
/// Call [`TestDb::teardown`] at the end of the test; it closes the pool
/// and drops the database so reruns start clean.
pub struct TestDb {
    pub pool: PgPool,
    name: String,
}

impl TestDb {
    /// Carve out a uniquely named database and run the sluice migrations.
    pub async fn new() -> Self {
        let server = server().await;

        let name = format!("sluice_test_{}", Uuid::new_v4().simple());
        let url = format!("{}/{}", server.base_url, name);

        pool::create_database_if_missing(&url)
            .await
            .expect("failed to create the test database");
        let db_pool = pool::create_pool(&url)
            .await
            .expect("failed to connect to the test database");
        pool::apply_migrations(&db_pool)
            .await
            .expect("migrations should apply cleanly");

        Self {
            pool: db_pool,
            name,
        }
    }

    /// Close the pool and drop the database. Leftover sessions are
    /// terminated first so the drop cannot block.
    pub async fn teardown(self) {
        self.pool.close().await;

        let server = server().await;
        let admin_url = format!("{}/postgres", server.base_url);
        let Ok(mut admin) = PgConnection::connect(&admin_url).await else {
            return;
        };

        let evict = format!(
            "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
             WHERE datname = '{}' AND pid <> pg_backend_pid()",
            self.name
        );
        let _ = sqlx::raw_sql(&evict).execute(&mut admin).await;

        let drop_db = format!("DROP DATABASE IF EXISTS \"{}\"", self.name);
        let _ = sqlx::raw_sql(&drop_db).execute(&mut admin).await;
        let _ = admin.close().await;
    }
}

/// Create the film source table and the allowlisted relational sink used
/// across the runner suites.
pub async fn seed_film_schema(db_pool: &PgPool) {
    sqlx::raw_sql(
        "CREATE SCHEMA src; \
         CREATE TABLE src.films (\
             film_id INTEGER PRIMARY KEY, \
             title TEXT NOT NULL, \
             updated_at TIMESTAMP NOT NULL DEFAULT NOW()); \
         CREATE SCHEMA analytics; \
         CREATE TABLE analytics.film_dim (\
             film_id INTEGER PRIMARY KEY, \
             title TEXT NOT NULL)",
    )
    .execute(db_pool)
    .await
    .expect("failed to seed the film schema");
}

/// Insert film source rows given as `(film_id, title, updated_at)`.
pub async fn insert_films(db_pool: &PgPool, rows: &[(i32, &str, &str)]) {
    for (film_id, title, updated_at) in rows {
        sqlx::query(
            "INSERT INTO src.films (film_id, title, updated_at) \
             VALUES ($1, $2, $3::timestamp)",
        )
        .bind(film_id)
        .bind(title)
        .bind(updated_at)
        .execute(db_pool)
        .await
        .expect("failed to insert a film row");
    }
}

/// Read back the sink, ordered by film id.
pub async fn film_dim_rows(db_pool: &PgPool) -> Vec<(i32, String)> {
    sqlx::query_as("SELECT film_id, title FROM analytics.film_dim ORDER BY film_id")
        .fetch_all(db_pool)
        .await
        .expect("failed to read the film sink")
}
