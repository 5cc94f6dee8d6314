//! PostgreSQL backend.
//!
//! The migration lock is a session-level advisory lock. The session is a
//! pooled connection set aside for as long as the lock is held; it is never
//! returned to the pool while locked. If unlocking fails, or the backend is
//! dropped while locked, the connection is detached and closed so the server
//! frees the lock with the session.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnection, PgPool};
use sqlx::Postgres;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{cancellable, run_unit, MigrationBackend, UnitConnection, LOCK_POLL_INTERVAL};
use crate::config::{LockMode, DEFAULT_LOCK_KEY, DEFAULT_TRACKING_TABLE};
use crate::dialect::{MigrationDialect, PostgresDialect};
use crate::error::{MigrateError, Result};
use crate::planner::Direction;
use crate::status::MigrationRecord;
use crate::unit::MigrationUnit;

/// Migration backend for PostgreSQL databases.
pub struct PostgresBackend {
    pool: PgPool,
    tracking_table: String,
    lock_key: i64,
    lock_conn: Mutex<Option<PoolConnection<Postgres>>>,
}

impl PostgresBackend {
    /// Creates a backend using the default tracking table and lock key.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            tracking_table: DEFAULT_TRACKING_TABLE.to_string(),
            lock_key: DEFAULT_LOCK_KEY,
            lock_conn: Mutex::new(None),
        }
    }

    /// Uses `name` as the tracking table.
    #[must_use]
    pub fn with_tracking_table(mut self, name: impl Into<String>) -> Self {
        self.tracking_table = name.into();
        self
    }

    /// Uses `key` as the advisory lock key.
    #[must_use]
    pub fn with_lock_key(mut self, key: i64) -> Self {
        self.lock_key = key;
        self
    }

    /// Returns the connection pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Returns the advisory lock key.
    #[must_use]
    pub fn lock_key(&self) -> i64 {
        self.lock_key
    }

    fn quoted_tracking_table(&self) -> String {
        PostgresDialect::new().quote_identifier(&self.tracking_table)
    }

    async fn try_lock(&self, conn: &mut PoolConnection<Postgres>) -> Result<bool> {
        let (locked,): (bool,) = sqlx::query_as("SELECT pg_try_advisory_lock($1)")
            .bind(self.lock_key)
            .fetch_one(&mut **conn)
            .await?;
        Ok(locked)
    }

    /// Blocks on `pg_advisory_lock`. A cancelled wait leaves the session in
    /// an unknown state, so the caller must close it.
    async fn wait_lock(
        &self,
        conn: &mut PoolConnection<Postgres>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(MigrateError::Cancelled),
            res = sqlx::query("SELECT pg_advisory_lock($1)")
                .bind(self.lock_key)
                .execute(&mut **conn) => {
                res?;
                Ok(())
            }
        }
    }

    async fn poll_lock(
        &self,
        conn: &mut PoolConnection<Postgres>,
        mode: LockMode,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if cancellable(cancel, self.try_lock(conn)).await? {
                return Ok(());
            }
            if mode == LockMode::NoWait || deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(MigrateError::LockContention);
            }

            debug!(key = self.lock_key, "Advisory lock held elsewhere, waiting");
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(MigrateError::Cancelled),
                () = tokio::time::sleep(LOCK_POLL_INTERVAL) => {}
            }
        }
    }
}

impl UnitConnection for PgConnection {
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
                    "INSERT INTO {} (version, name, applied_at) VALUES ($1, $2, $3)",
                    tracking_table
                ))
                .bind(unit.version())
                .bind(unit.name())
                .bind(Utc::now())
                .execute(self)
                .await?;
            }
            Direction::Down => {
                sqlx::query(&format!("DELETE FROM {} WHERE version = $1", tracking_table))
                    .bind(unit.version())
                    .execute(self)
                    .await?;
            }
        }
        Ok(())
    }
}

/// Closes a lock session without returning it to the pool.
fn discard(conn: PoolConnection<Postgres>) {
    drop(conn.detach());
}

impl MigrationBackend for PostgresBackend {
    fn name(&self) -> &'static str {
        "postgresql"
    }

    async fn ensure_tracking_table(&self, cancel: &CancellationToken) -> Result<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                version TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
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
            let (exists,): (bool,) = sqlx::query_as(
                "SELECT EXISTS (
                    SELECT 1 FROM information_schema.tables
                    WHERE table_schema = current_schema() AND table_name = $1
                )",
            )
            .bind(&self.tracking_table)
            .fetch_one(&self.pool)
            .await?;
            Ok(exists)
        })
        .await
    }

    async fn acquire_lock(
        &self,
        mode: LockMode,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut slot = self.lock_conn.lock().await;
        if slot.is_some() {
            return Ok(());
        }

        let mut conn = cancellable(cancel, async { Ok(self.pool.acquire().await?) }).await?;

        let result = match (mode, timeout) {
            (LockMode::Wait, None) => self.wait_lock(&mut conn, cancel).await,
            _ => self.poll_lock(&mut conn, mode, timeout, cancel).await,
        };

        match result {
            Ok(()) => {
                info!(key = self.lock_key, "Acquired migration lock");
                *slot = Some(conn);
                Ok(())
            }
            // Nothing is held; the session is clean.
            Err(MigrateError::LockContention) => Err(MigrateError::LockContention),
            Err(e) => {
                discard(conn);
                Err(e)
            }
        }
    }

    async fn release_lock(&self) -> Result<()> {
        let Some(mut conn) = self.lock_conn.lock().await.take() else {
            return Ok(());
        };

        let unlocked: std::result::Result<(bool,), sqlx::Error> =
            sqlx::query_as("SELECT pg_advisory_unlock($1)")
                .bind(self.lock_key)
                .fetch_one(&mut *conn)
                .await;

        match unlocked {
            Ok((true,)) => {
                info!(key = self.lock_key, "Released migration lock");
            }
            Ok((false,)) => {
                warn!(key = self.lock_key, "Advisory lock was not held; closing session");
                discard(conn);
            }
            Err(e) => {
                warn!(key = self.lock_key, error = %e, "Failed to release advisory lock; closing session");
                discard(conn);
            }
        }
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

impl Drop for PostgresBackend {
    fn drop(&mut self) {
        if let Some(conn) = self.lock_conn.get_mut().take() {
            warn!(key = self.lock_key, "Dropped while holding the migration lock; closing session");
            discard(conn);
        }
    }
}
