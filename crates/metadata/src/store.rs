//! Metadata store trait and SQLite implementation.

use crate::error::MetadataResult;
use crate::repos::BuildRepo;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, Instant};

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore: BuildRepo + Send + Sync {
    /// Run database migrations.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;
}

/// SQLite-based metadata store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    query_timeout: Duration,
}

impl SqliteStore {
    /// Open (or create) a SQLite database and migrate it.
    pub async fn new(
        path: impl AsRef<Path>,
        query_timeout_secs: Option<u64>,
    ) -> MetadataResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        // A single connection serializes writers, which is what gives every
        // upsert transaction its isolation on SQLite.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self {
            pool,
            query_timeout: Duration::from_secs(query_timeout_secs.unwrap_or(60)),
        };
        store.migrate().await?;
        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// SQLite cannot cancel statements; slow ones are only reported.
    fn warn_if_slow(&self, operation: &'static str, started: Instant) {
        let elapsed = started.elapsed();
        if elapsed > self.query_timeout {
            tracing::warn!(
                operation,
                elapsed_ms = elapsed.as_millis() as u64,
                timeout_secs = self.query_timeout.as_secs(),
                "SQLite query exceeded advisory timeout"
            );
        }
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::raw_sql(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

mod sqlite_impl {
    use super::*;
    use crate::error::MetadataError;
    use crate::models::*;
    use mirror_core::BuildId;
    use sqlx::QueryBuilder;
    use time::OffsetDateTime;

    fn to_i64(size: u64) -> MetadataResult<i64> {
        i64::try_from(size)
            .map_err(|_| MetadataError::Constraint(format!("size {size} exceeds i64")))
    }

    #[async_trait]
    impl BuildRepo for SqliteStore {
        async fn upsert_build(&self, build: &BuildUpsert) -> MetadataResult<BuildRow> {
            let size = to_i64(build.size)?;
            let now = OffsetDateTime::now_utc();
            let mut tx = self.pool.begin().await?;

            let existing = sqlx::query_as::<_, BuildRow>(
                "SELECT * FROM builds WHERE device = ? AND version = ? AND filename = ? AND sha256 = ?",
            )
            .bind(&build.device)
            .bind(&build.version)
            .bind(&build.filename)
            .bind(&build.hashes.sha256)
            .fetch_optional(&mut *tx)
            .await?;

            let row = match existing {
                None => {
                    sqlx::query_as::<_, BuildRow>(
                        r#"
                        INSERT INTO builds (
                            filename, device, version, date, size,
                            md5, sha1, sha256, sha512,
                            signature_valid, available_upstream,
                            local_path, remote_url, created_at, updated_at
                        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
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
                    .bind(now)
                    .fetch_one(&mut *tx)
                    .await?
                }
                Some(current) => {
                    sqlx::query_as::<_, BuildRow>(
                        r#"
                        UPDATE builds SET
                            date = ?, size = ?, md5 = ?, sha1 = ?, sha512 = ?,
                            signature_valid = ?, available_upstream = ?,
                            local_path = ?, remote_url = ?, updated_at = ?
                        WHERE id = ?
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
                    .await?
                }
            };

            tx.commit().await?;
            Ok(row)
        }

        async fn find_build(&self, id: BuildId) -> MetadataResult<Option<BuildRow>> {
            let row = sqlx::query_as::<_, BuildRow>("SELECT * FROM builds WHERE id = ?")
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
                "SELECT * FROM builds WHERE device = ? AND version = ? AND filename = ? AND sha256 = ?",
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
                "SELECT * FROM builds WHERE sha256 = ? AND local_path IS NOT NULL ORDER BY id LIMIT 1",
            )
            .bind(sha256)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn list_builds(&self, filter: &BuildFilter) -> MetadataResult<Vec<BuildRow>> {
            let started = Instant::now();
            let mut query = QueryBuilder::<Sqlite>::new("SELECT * FROM builds WHERE 1 = 1");
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
            self.warn_if_slow("list_builds", started);
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
            sqlx::query("UPDATE builds SET available_upstream = 0 WHERE device = ?")
                .bind(device)
                .execute(&mut *tx)
                .await?;

            let mut flagged = 0;
            for filename in filenames {
                flagged += sqlx::query(
                    "UPDATE builds SET available_upstream = 1 WHERE device = ? AND filename = ?",
                )
                .bind(device)
                .bind(filename)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            }
            tx.commit().await?;
            Ok(flagged)
        }

        async fn statistics(&self) -> MetadataResult<BuildStatistics> {
            let started = Instant::now();
            let (build_count_known, build_size_known, build_size_average, device_count) =
                sqlx::query_as::<_, (i64, i64, Option<f64>, i64)>(
                    "SELECT COUNT(*), COALESCE(SUM(size), 0), AVG(size), COUNT(DISTINCT device) FROM builds",
                )
                .fetch_one(&self.pool)
                .await?;

            let (build_count_stored, build_size_stored) = sqlx::query_as::<_, (i64, i64)>(
                "SELECT COUNT(*), COALESCE(SUM(size), 0) FROM builds WHERE local_path IS NOT NULL",
            )
            .fetch_one(&self.pool)
            .await?;

            let device_version_count = sqlx::query_scalar::<_, i64>(
                "SELECT COUNT(*) FROM (SELECT DISTINCT device, version FROM builds) AS groups",
            )
            .fetch_one(&self.pool)
            .await?;

            self.warn_if_slow("statistics", started);
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
}

/// ORDER BY clause shared by both backends.
pub(crate) fn order_clause(order: crate::models::BuildOrder) -> &'static str {
    match order {
        crate::models::BuildOrder::Availability => {
            " ORDER BY CASE WHEN remote_url IS NOT NULL THEN 0 WHEN local_path IS NOT NULL THEN 1 ELSE 2 END, date DESC, id DESC"
        }
        crate::models::BuildOrder::Newest => " ORDER BY date DESC, id DESC",
    }
}

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS builds (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    filename TEXT NOT NULL,
    device TEXT NOT NULL,
    version TEXT NOT NULL,
    date TEXT NOT NULL,
    size INTEGER NOT NULL,
    md5 TEXT NOT NULL,
    sha1 TEXT NOT NULL,
    sha256 TEXT NOT NULL,
    sha512 TEXT NOT NULL,
    signature_valid INTEGER NOT NULL DEFAULT 0,
    available_upstream INTEGER NOT NULL DEFAULT 0,
    local_path TEXT,
    remote_url TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (device, version, filename, sha256)
);

CREATE INDEX IF NOT EXISTS idx_builds_group ON builds (device, version, date);
CREATE INDEX IF NOT EXISTS idx_builds_sha256 ON builds (sha256);
"#;
