//! SQLite backend.
//!
//! SQLite has no advisory locks, so the migration lock is a single-row lock
//! table next to the tracking table. Whoever inserts the row holds the lock;
//! waiters poll every 100ms. A row left behind by a crashed process has to be
//! deleted by hand.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{cancellable, run_unit, MigrationBackend, UnitConnection, LOCK_POLL_INTERVAL};
use crate::config::{LockMode, DEFAULT_TRACKING_TABLE};
use crate::dialect::{MigrationDialect, SqliteDialect};
use crate::error::{MigrateError, Result};
use crate::planner::Direction;
use crate::status::MigrationRecord;
use crate::unit::MigrationUnit;

static NEXT_OWNER: AtomicU64 = AtomicU64::new(0);

/// Migration backend for SQLite databases.
pub struct SqliteBackend {
    pool: SqlitePool,
    tracking_table: String,
    owner: String,
    held: AtomicBool,
}

impl SqliteBackend {
    /// Creates a backend using the default tracking table.
    pub fn new(pool: SqlitePool) -> Self {
        let owner = format!(
            "{}-{}",
            std::process::id(),
            NEXT_OWNER.fetch_add(1, Ordering::Relaxed)
        );
        Self {
            pool,
            tracking_table: DEFAULT_TRACKING_TABLE.to_string(),
            owner,
            held: AtomicBool::new(false),
        }
    }

    /// Uses `name` as the tracking table. The lock table is `<name>_lock`.
    #[must_use]
    pub fn with_tracking_table(mut self, name: impl Into<String>) -> Self {
        self.tracking_table = name.into();
        self
    }

    /// Returns the connection pool.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Returns the tracking table name.
    #[must_use]
    pub fn tracking_table(&self) -> &str {
        &self.tracking_table
    }

    fn quoted_tracking_table(&self) -> String {
        SqliteDialect::new().quote_identifier(&self.tracking_table)
    }

    fn quoted_lock_table(&self) -> String {
        SqliteDialect::new().quote_identifier(&format!("{}_lock", self.tracking_table))
    }

    async fn try_lock(&self) -> Result<bool> {
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                owner TEXT NOT NULL,
                locked_at TEXT NOT NULL
            )",
            self.quoted_lock_table()
        ))
        .execute(&self.pool)
        .await?;

        let result = sqlx::query(&format!(
            "INSERT OR IGNORE INTO {} (id, owner, locked_at) VALUES (1, ?, ?)",
            self.quoted_lock_table()
        ))
        .bind(&self.owner)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

impl UnitConnection for SqliteConnection {
    async fn run_statement(&mut self, sql: &str) -> sqlx::Result<()> {
        sqlx::query(sql).execute(self).await?;
        Ok(())
    }

    async fn write_record(
        &mut self,
        tracking_table: &str,
        unit: &MigrationUnit,
        direction: Direction,
    ) -> sqlx::Result<()> {
        match direction {
            Direction::Up => {
                sqlx::query(&format!(
                    "INSERT INTO {} (version, name, applied_at) VALUES (?, ?, ?)",
                    tracking_table
                ))
                .bind(unit.version())
                .bind(unit.name())
                .bind(Utc::now())
                .execute(self)
                .await?;
            }
            Direction::Down => {
                sqlx::query(&format!("DELETE FROM {} WHERE version = ?", tracking_table))
                    .bind(unit.version())
                    .execute(self)
                    .await?;
            }
        }
        Ok(())
    }
}

impl MigrationBackend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn ensure_tracking_table(&self, cancel: &CancellationToken) -> Result<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                version TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at TEXT NOT NULL
            )",
            self.quoted_tracking_table()
        );
        cancellable(cancel, async {
            sqlx::query(&sql).execute(&self.pool).await?;
            Ok(())
        })
        .await
    }

    async fn tracking_table_exists(&self, cancel: &CancellationToken) -> Result<bool> {
        cancellable(cancel, async {
            let row: Option<(i64,)> =
                sqlx::query_as("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?")
                    .bind(&self.tracking_table)
                    .fetch_optional(&self.pool)
                    .await?;
            Ok(row.is_some())
        })
        .await
    }

    async fn acquire_lock(
        &self,
        mode: LockMode,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if self.held.load(Ordering::SeqCst) {
            return Ok(());
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if cancellable(cancel, self.try_lock()).await? {
                self.held.store(true, Ordering::SeqCst);
                info!(owner = %self.owner, "Acquired migration lock");
                return Ok(());
            }

            if mode == LockMode::NoWait || deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(MigrateError::LockContention);
            }

            debug!("Migration lock held elsewhere, waiting");
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(MigrateError::Cancelled),
                () = tokio::time::sleep(LOCK_POLL_INTERVAL) => {}
            }
        }
    }

    async fn release_lock(&self) -> Result<()> {
        if !self.held.load(Ordering::SeqCst) {
            return Ok(());
        }

        // Cleared only once the row is gone.
        sqlx::query(&format!(
            "DELETE FROM {} WHERE id = 1 AND owner = ?",
            self.quoted_lock_table()
        ))
        .bind(&self.owner)
        .execute(&self.pool)
        .await?;

        self.held.store(false, Ordering::SeqCst);
        info!(owner = %self.owner, "Released migration lock");
        Ok(())
    }

    async fn apply_unit(&self, unit: &MigrationUnit, cancel: &CancellationToken) -> Result<()> {
        let table = self.quoted_tracking_table();
        run_unit(&self.pool, &table, unit, Direction::Up, cancel).await
    }

    async fn revert_unit(&self, unit: &MigrationUnit, cancel: &CancellationToken) -> Result<()> {
        let table = self.quoted_tracking_table();
        run_unit(&self.pool, &table, unit, Direction::Down, cancel).await
    }

    async fn applied_records(&self, cancel: &CancellationToken) -> Result<Vec<MigrationRecord>> {
        let sql = format!(
            "SELECT version, name, applied_at FROM {}",
            self.quoted_tracking_table()
        );
        let rows: Vec<(String, String, DateTime<Utc>)> =
            cancellable(cancel, async { Ok(sqlx::query_as(&sql).fetch_all(&self.pool).await?) })
                .await?;

        let mut records: Vec<MigrationRecord> = rows
            .into_iter()
            .map(|(version, name, applied_at)| MigrationRecord {
                version,
                name,
                applied_at,
            })
            .collect();
        records.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(records)
    }
}

impl Drop for SqliteBackend {
    fn drop(&mut self) {
        if !*self.held.get_mut() {
            return;
        }
        // Best effort: the row stays behind if no runtime is available.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(owner = %self.owner, "Dropped while holding the migration lock");
            return;
        };
        let pool = self.pool.clone();
        let sql = format!(
            "DELETE FROM {} WHERE id = 1 AND owner = ?",
            self.quoted_lock_table()
        );
        let owner = self.owner.clone();
        handle.spawn(async move {
            if let Err(e) = sqlx::query(&sql).bind(&owner).execute(&pool).await {
                warn!(owner = %owner, error = %e, "Failed to release migration lock on drop");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn create_test_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect(":memory:")
            .await
            .expect("Failed to create in-memory SQLite pool")
    }

    fn unit(version: &str, up: &[&str], down: &[&str]) -> MigrationUnit {
        MigrationUnit::new(
            version,
            format!("m{version}"),
            up.iter().map(|s| s.to_string()).collect(),
            down.iter().map(|s| s.to_string()).collect(),
        )
        .unwrap()
    }

    async fn table_exists(pool: &SqlitePool, name: &str) -> bool {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?")
                .bind(name)
                .fetch_optional(pool)
                .await
                .unwrap();
        row.is_some()
    }

    #[tokio::test]
    async fn test_tracking_table() {
        let backend = SqliteBackend::new(create_test_pool().await).with_tracking_table("history");
        let cancel = CancellationToken::new();

        assert!(!backend.tracking_table_exists(&cancel).await.unwrap());
        backend.ensure_tracking_table(&cancel).await.unwrap();
        backend.ensure_tracking_table(&cancel).await.unwrap();
        assert!(backend.tracking_table_exists(&cancel).await.unwrap());
        assert!(backend.applied_records(&cancel).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_apply_and_revert_unit() {
        let backend = SqliteBackend::new(create_test_pool().await);
        let cancel = CancellationToken::new();
        backend.ensure_tracking_table(&cancel).await.unwrap();

        let m = unit(
            "1",
            &["CREATE TABLE t (id INTEGER)", "-- seeded by hand"],
            &["DROP TABLE t"],
        );
        backend.apply_unit(&m, &cancel).await.unwrap();
        assert!(table_exists(backend.pool(), "t").await);

        let records = backend.applied_records(&cancel).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].version, "1");
        assert_eq!(records[0].name, "m1");

        backend.revert_unit(&m, &cancel).await.unwrap();
        assert!(!table_exists(backend.pool(), "t").await);
        assert!(backend.applied_records(&cancel).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_statement_rolls_back_unit() {
        let backend = SqliteBackend::new(create_test_pool().await);
        let cancel = CancellationToken::new();
        backend.ensure_tracking_table(&cancel).await.unwrap();

        let m = unit(
            "1",
            &["CREATE TABLE t (id INTEGER)", "INSERT INTO missing VALUES (1)"],
            &[],
        );
        let err = backend.apply_unit(&m, &cancel).await.unwrap_err();
        match err {
            MigrateError::Statement {
                version, statement, ..
            } => {
                assert_eq!(version, "1");
                assert_eq!(statement, "INSERT INTO missing VALUES (1)");
            }
            other => panic!("unexpected error: {other}"),
        }

        assert!(!table_exists(backend.pool(), "t").await);
        assert!(backend.applied_records(&cancel).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_apply() {
        let backend = SqliteBackend::new(create_test_pool().await);
        let cancel = CancellationToken::new();
        backend.ensure_tracking_table(&cancel).await.unwrap();

        cancel.cancel();
        let m = unit("1", &["CREATE TABLE t (id INTEGER)"], &[]);
        assert!(matches!(
            backend.apply_unit(&m, &cancel).await,
            Err(MigrateError::Cancelled)
        ));
        assert!(!table_exists(backend.pool(), "t").await);
    }

    #[tokio::test]
    async fn test_lock_contention() {
        let pool = create_test_pool().await;
        let first = SqliteBackend::new(pool.clone());
        let second = SqliteBackend::new(pool);
        let cancel = CancellationToken::new();

        first.acquire_lock(LockMode::NoWait, None, &cancel).await.unwrap();
        // Re-acquiring a held lock is a no-op.
        first.acquire_lock(LockMode::NoWait, None, &cancel).await.unwrap();

        assert!(matches!(
            second.acquire_lock(LockMode::NoWait, None, &cancel).await,
            Err(MigrateError::LockContention)
        ));
        assert!(matches!(
            second
                .acquire_lock(LockMode::Wait, Some(Duration::from_millis(250)), &cancel)
                .await,
            Err(MigrateError::LockContention)
        ));

        first.release_lock().await.unwrap();
        second.acquire_lock(LockMode::NoWait, None, &cancel).await.unwrap();
        second.release_lock().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_release_keeps_the_lock() {
        let pool = create_test_pool().await;
        let holder = SqliteBackend::new(pool.clone());
        let other = SqliteBackend::new(pool.clone());
        let cancel = CancellationToken::new();

        holder.acquire_lock(LockMode::NoWait, None, &cancel).await.unwrap();

        // Move the lock table away so the DELETE fails.
        sqlx::query("ALTER TABLE tidemark_migrations_lock RENAME TO parked_lock")
            .execute(&pool)
            .await
            .unwrap();
        assert!(matches!(
            holder.release_lock().await,
            Err(MigrateError::Database(_))
        ));
        assert!(holder.held.load(Ordering::SeqCst));

        sqlx::query("ALTER TABLE parked_lock RENAME TO tidemark_migrations_lock")
            .execute(&pool)
            .await
            .unwrap();
        assert!(matches!(
            other.acquire_lock(LockMode::NoWait, None, &cancel).await,
            Err(MigrateError::LockContention)
        ));

        // The retry still removes the row.
        holder.release_lock().await.unwrap();
        assert!(!holder.held.load(Ordering::SeqCst));
        other.acquire_lock(LockMode::NoWait, None, &cancel).await.unwrap();
        other.release_lock().await.unwrap();
    }

    #[tokio::test]
    async fn test_waiting_for_lock_is_cancellable() {
        let pool = create_test_pool().await;
        let holder = SqliteBackend::new(pool.clone());
        let waiter = SqliteBackend::new(pool);
        let cancel = CancellationToken::new();

        holder.acquire_lock(LockMode::Wait, None, &cancel).await.unwrap();

        let token = CancellationToken::new();
        let child = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            child.cancel();
        });
        assert!(matches!(
            waiter.acquire_lock(LockMode::Wait, None, &token).await,
            Err(MigrateError::Cancelled)
        ));

        holder.release_lock().await.unwrap();
    }
}
