//! PostgreSQL-based metadata store implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::models::*;
use crate::repos::BuildRepo;
use crate::store::{MetadataStore, order_clause};
use async_trait::async_trait;
use mirror_core::BuildId;
use mirror_core::config::PgSslMode;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode as SqlxPgSslMode};
use sqlx::{Pool, Postgres, QueryBuilder};
use std::str::FromStr;
use time::OffsetDateTime;

const POSTGRES_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS builds (
    id BIGSERIAL PRIMARY KEY,
    filename TEXT NOT NULL,
    device TEXT NOT NULL,
    version TEXT NOT NULL,
    date TEXT NOT NULL,
    size BIGINT NOT NULL,
    md5 TEXT NOT NULL,
    sha1 TEXT NOT NULL,
    sha256 TEXT NOT NULL,
    sha512 TEXT NOT NULL,
    signature_valid BOOLEAN NOT NULL DEFAULT FALSE,
    available_upstream BOOLEAN NOT NULL DEFAULT FALSE,
    local_path TEXT,
    remote_url TEXT,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL,
    UNIQUE (device, version, filename, sha256)
);

CREATE INDEX IF NOT EXISTS idx_builds_group ON builds (device, version, date);
CREATE INDEX IF NOT EXISTS idx_builds_sha256 ON builds (sha256);
"#;

const SELECT_BY_IDENTITY_FOR_UPDATE: &str = "SELECT * FROM builds WHERE device = $1 AND version = $2 AND filename = $3 AND sha256 = $4 FOR UPDATE";

/// PostgreSQL-based metadata store.
pub struct PostgresStore {
    pool: Pool<Postgres>,
}

impl PostgresStore {
    /// Connect using a full connection URL.
    pub async fn from_url(
        url: &str,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let opts = PgConnectOptions::from_str(url)?;
        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    /// Connect using individual parameters, so the password can come from
    /// its own environment variable.
    #[allow(clippy::too_many_arguments)]
    pub async fn from_params(
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
        database: &str,
        ssl_mode: Option<PgSslMode>,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let mut opts = PgConnectOptions::new()
            .host(host)
            .port(port)
            .database(database);

        if let Some(user) = username {
            opts = opts.username(user);
        }
        if let Some(pass) = password {
            opts = opts.password(pass);
        }
        if let Some(mode) = ssl_mode {
            opts = opts.ssl_mode(match mode {
                PgSslMode::Disable => SqlxPgSslMode::Disable,
                PgSslMode::Prefer => SqlxPgSslMode::Prefer,
                PgSslMode::Require => SqlxPgSslMode::Require,
            });
        }

        tracing::info!(
            host = host,
            port = port,
            database = database,
            username = username.unwrap_or("<none>"),
            ssl_mode = ?ssl_mode,
            "Connecting to PostgreSQL with individual parameters"
        );

        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    async fn connect(
        mut opts: PgConnectOptions,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        if let Some(timeout_ms) = statement_timeout_ms {
            opts = opts.options([("statement_timeout", format!("{timeout_ms}ms"))]);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for PostgresStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::raw_sql(POSTGRES_SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl BuildRepo for PostgresStore {
    async fn upsert_build(&self, build: &BuildUpsert) -> MetadataResult<BuildRow> {
        let size = i64::try_from(build.size)
            .map_err(|_| MetadataError::Constraint(format!("size {} exceeds i64", build.size)))?;
        let now = OffsetDateTime::now_utc();
        let mut tx = self.pool.begin().await?;

        let mut existing = sqlx::query_as::<_, BuildRow>(SELECT_BY_IDENTITY_FOR_UPDATE)
            .bind(&build.device)
            .bind(&build.version)
            .bind(&build.filename)
            .bind(&build.hashes.sha256)
            .fetch_optional(&mut *tx)
            .await?;

        if existing.is_none() {
            let inserted = sqlx::query_as::<_, BuildRow>(
                r#"
                INSERT INTO builds (
                    filename, device, version, date, size,
                    md5, sha1, sha256, sha512,
                    signature_valid, available_upstream,
                    local_path, remote_url, created_at, updated_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $14)
                ON CONFLICT (device, version, filename, sha256) DO NOTHING
                RETURNING *
                "#,
            )
            .bind(&build.filename)
            .bind(&build.device)
            .bind(&build.version)
            .bind(&build.date)
            .bind(size)
            .bind(&build.hashes.md5)
            .bind(&build.hashes.sha1)
            .bind(&build.hashes.sha256)
            .bind(&build.hashes.sha512)
            .bind(build.signature_valid)
            .bind(build.available_upstream.unwrap_or(false))
            .bind(build.local_path.apply(None))
            .bind(build.remote_url.apply(None))
            .bind(now)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(row) = inserted {
                tx.commit().await?;
                return Ok(row);
            }

            // Lost an insert race; lock the winner's row and update it.
            existing = sqlx::query_as::<_, BuildRow>(SELECT_BY_IDENTITY_FOR_UPDATE)
                .bind(&build.device)
                .bind(&build.version)
                .bind(&build.filename)
                .bind(&build.hashes.sha256)
                .fetch_optional(&mut *tx)
                .await?;
        }

        let current = existing.ok_or_else(|| {
            MetadataError::Internal(format!("build {} vanished during upsert", build.filename))
        })?;

        let row = sqlx::query_as::<_, BuildRow>(
            r#"
            UPDATE builds SET
                date = $1, size = $2, md5 = $3, sha1 = $4, sha512 = $5,
                signature_valid = $6, available_upstream = $7,
                local_path = $8, remote_url = $9, updated_at = $10
            WHERE id = $11
            RETURNING *
            "#,
        )
        .bind(&build.date)
        .bind(size)
        .bind(&build.hashes.md5)
        .bind(&build.hashes.sha1)
        .bind(&build.hashes.sha512)
        .bind(build.signature_valid)
        .bind(build.available_upstream.unwrap_or(current.available_upstream))
        .bind(build.local_path.apply(current.local_path.clone()))
        .bind(build.remote_url.apply(current.remote_url.clone()))
        .bind(now)
        .bind(current.id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(row)
    }

    async fn find_build(&self, id: BuildId) -> MetadataResult<Option<BuildRow>> {
        let row = sqlx::query_as::<_, BuildRow>("SELECT * FROM builds WHERE id = $1")
            .bind(id.as_i64())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn find_build_by_identity(
        &self,
        device: &str,
        version: &str,
        filename: &str,
        sha256: &str,
    ) -> MetadataResult<Option<BuildRow>> {
        let row = sqlx::query_as::<_, BuildRow>(
            "SELECT * FROM builds WHERE device = $1 AND version = $2 AND filename = $3 AND sha256 = $4",
        )
        .bind(device)
        .bind(version)
        .bind(filename)
        .bind(sha256)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn find_stored_by_sha256(&self, sha256: &str) -> MetadataResult<Option<BuildRow>> {
        let row = sqlx::query_as::<_, BuildRow>(
            "SELECT * FROM builds WHERE sha256 = $1 AND local_path IS NOT NULL ORDER BY id LIMIT 1",
        )
        .bind(sha256)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list_builds(&self, filter: &BuildFilter) -> MetadataResult<Vec<BuildRow>> {
        let mut query = QueryBuilder::<Postgres>::new("SELECT * FROM builds WHERE TRUE");
        if let Some(device) = &filter.device {
            query.push(" AND device = ").push_bind(device.clone());
        }
        if let Some(version) = &filter.version {
            query.push(" AND version = ").push_bind(version.clone());
        }
        match filter.stored {
            Some(true) => {
                query.push(" AND local_path IS NOT NULL");
            }
            Some(false) => {
                query.push(" AND local_path IS NULL");
            }
            None => {}
        }
        query.push(order_clause(filter.order));

        let rows = query.build_query_as::<BuildRow>().fetch_all(&self.pool).await?;
        Ok(rows)
    }

    async fn stored_groups(&self) -> MetadataResult<Vec<(String, String)>> {
        let groups = sqlx::query_as::<_, (String, String)>(
            "SELECT DISTINCT device, version FROM builds WHERE local_path IS NOT NULL ORDER BY device, version",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(groups)
    }

    async fn upstream_devices(&self) -> MetadataResult<Vec<String>> {
        let devices = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT device FROM builds WHERE available_upstream ORDER BY device",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(devices)
    }

    async fn set_upstream_availability(
        &self,
        device: &str,
        filenames: &[String],
    ) -> MetadataResult<u64> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE builds SET available_upstream = FALSE WHERE device = $1")
            .bind(device)
            .execute(&mut *tx)
            .await?;

        let flagged = sqlx::query(
            "UPDATE builds SET available_upstream = TRUE WHERE device = $1 AND filename = ANY($2)",
        )
        .bind(device)
        .bind(filenames)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        Ok(flagged)
    }

    async fn statistics(&self) -> MetadataResult<BuildStatistics> {
        let (build_count_known, build_size_known, build_size_average, device_count) =
            sqlx::query_as::<_, (i64, i64, Option<f64>, i64)>(
                r#"
                SELECT COUNT(*), COALESCE(SUM(size), 0)::BIGINT,
                       AVG(size)::DOUBLE PRECISION, COUNT(DISTINCT device)
                FROM builds
                "#,
            )
            .fetch_one(&self.pool)
            .await?;

        let (build_count_stored, build_size_stored) = sqlx::query_as::<_, (i64, i64)>(
            "SELECT COUNT(*), COALESCE(SUM(size), 0)::BIGINT FROM builds WHERE local_path IS NOT NULL",
        )
        .fetch_one(&self.pool)
        .await?;

        let device_version_count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM (SELECT DISTINCT device, version FROM builds) AS groups",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(BuildStatistics {
            build_count_known,
            build_size_known,
            build_count_stored,
            build_size_stored,
            device_count,
            device_version_count,
            build_size_average,
        })
    }
}
