use anyhow::{Context, Result};
use sqlx::FromRow;
use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::ports::directory::{
    BackendDirectory, BackendRecord, DirectoryError, HostnamesFuture, LookupFuture, strip_port,
};

/// Row shape of the hostname directory table.
#[derive(Debug, FromRow)]
struct StatusPageRow {
    id: i32,
    hostname: String,
    page_data_url: String,
}

impl From<StatusPageRow> for BackendRecord {
    fn from(row: StatusPageRow) -> Self {
        BackendRecord {
            id: row.id,
            hostname: row.hostname,
            backend_url: row.page_data_url,
        }
    }
}

/// Postgres-backed hostname directory.
///
/// Lookups are exact matches against the stored hostname after port
/// stripping; there is no wildcard or suffix matching and no caching at
/// this layer (the pool may keep connections warm, nothing more).
pub struct PostgresDirectory {
    pool: PgPool,
}

impl PostgresDirectory {
    /// Connect and verify connectivity, so an unreachable directory fails
    /// startup instead of the first request.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .context("failed to connect to the hostname directory")?;

        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .context("hostname directory did not answer a ping")?;

        tracing::info!("connected to the hostname directory");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl BackendDirectory for PostgresDirectory {
    fn lookup<'a>(&'a self, hostname: &'a str) -> LookupFuture<'a> {
        Box::pin(async move {
            let host = strip_port(hostname);

            let row = sqlx::query_as::<_, StatusPageRow>(
                "SELECT id, hostname, page_data_url FROM status_pages WHERE hostname = $1",
            )
            .bind(host)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

            Ok(row.map(Into::into))
        })
    }

    fn hostnames<'a>(&'a self) -> HostnamesFuture<'a> {
        Box::pin(async move {
            let rows: Vec<(String,)> = sqlx::query_as("SELECT hostname FROM status_pages")
                .fetch_all(&self.pool)
                .await
                .map_err(map_sqlx_error)?;

            Ok(rows.into_iter().map(|(hostname,)| hostname).collect())
        })
    }
}

/// Row-decoding failures get their own variant; everything else is the
/// storage layer failing.
fn map_sqlx_error(err: sqlx::Error) -> DirectoryError {
    match err {
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::ColumnNotFound(_) => {
            DirectoryError::MalformedRow(err.to_string())
        }
        other => DirectoryError::QueryFailed(other.to_string()),
    }
}
