//! Database backends.
//!
//! A backend owns the connection pool and knows how to keep the tracking
//! table, take the cross-process migration lock, and run a unit's statements
//! inside one transaction. The executor is generic over [`MigrationBackend`].

mod postgres;
mod sqlite;

pub use postgres::PostgresBackend;
pub use sqlite::SqliteBackend;

use std::future::Future;
use std::time::Duration;

use sqlx::{Database, Pool, Transaction};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::LockMode;
use crate::error::{MigrateError, Result};
use crate::planner::Direction;
use crate::status::MigrationRecord;
use crate::unit::{is_comment_only, is_manual_placeholder, MigrationUnit};

/// Interval between attempts while waiting for a polled lock.
pub(crate) const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Storage and locking primitives the executor runs on.
///
/// Every method that talks to the database races `cancel`; a cancelled call
/// returns [`MigrateError::Cancelled`] and leaves no partial unit behind.
pub trait MigrationBackend: Send + Sync {
    /// Returns the backend name.
    fn name(&self) -> &'static str;

    /// Creates the tracking table if it does not exist.
    fn ensure_tracking_table(
        &self,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Returns true if the tracking table exists.
    fn tracking_table_exists(
        &self,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Takes the migration lock. Taking a lock this backend already holds is
    /// a no-op.
    fn acquire_lock(
        &self,
        mode: LockMode,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Releases the migration lock if this backend holds it.
    fn release_lock(&self) -> impl Future<Output = Result<()>> + Send;

    /// Runs the unit's up statements and records it, in one transaction.
    fn apply_unit(
        &self,
        unit: &MigrationUnit,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Runs the unit's down statements and deletes its record, in one
    /// transaction.
    fn revert_unit(
        &self,
        unit: &MigrationUnit,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Returns every tracking record, ascending by version.
    fn applied_records(
        &self,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<Vec<MigrationRecord>>> + Send;
}

/// Awaits `fut` unless `cancel` fires first.
pub(crate) async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(MigrateError::Cancelled),
        res = fut => res,
    }
}

/// Connection-level steps of a unit transaction.
pub(crate) trait UnitConnection: Send {
    /// Executes one migration statement.
    fn run_statement(&mut self, sql: &str) -> impl Future<Output = sqlx::Result<()>> + Send;

    /// Inserts (up) or deletes (down) the unit's row in `tracking_table`,
    /// which is already quoted.
    fn write_record(
        &mut self,
        tracking_table: &str,
        unit: &MigrationUnit,
        direction: Direction,
    ) -> impl Future<Output = sqlx::Result<()>> + Send;
}

/// Runs one direction of `unit` and updates its record in a single
/// transaction. Any failure or cancellation rolls the transaction back.
pub(crate) async fn run_unit<DB>(
    pool: &Pool<DB>,
    tracking_table: &str,
    unit: &MigrationUnit,
    direction: Direction,
    cancel: &CancellationToken,
) -> Result<()>
where
    DB: Database,
    DB::Connection: UnitConnection,
{
    let statements = match direction {
        Direction::Up => unit.up(),
        Direction::Down => unit.down(),
    };
    if let Some(placeholder) = statements.iter().find(|sql| is_manual_placeholder(sql)) {
        return Err(MigrateError::ManualStepRequired {
            version: unit.version().to_string(),
            statement: placeholder.clone(),
        });
    }

    let mut tx = cancellable(cancel, async { Ok(pool.begin().await?) }).await?;

    for sql in executable_statements(unit.version(), statements) {
        debug!(version = %unit.version(), sql = %sql, "Executing statement");
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            res = UnitConnection::run_statement(&mut *tx, sql) => Some(res),
        };
        match outcome {
            Some(Ok(())) => {}
            Some(Err(source)) => {
                abort(tx, unit.version()).await;
                return Err(MigrateError::Statement {
                    version: unit.version().to_string(),
                    statement: sql.clone(),
                    source,
                });
            }
            None => {
                abort(tx, unit.version()).await;
                return Err(MigrateError::Cancelled);
            }
        }
    }

    let outcome = tokio::select! {
        biased;
        () = cancel.cancelled() => None,
        res = UnitConnection::write_record(&mut *tx, tracking_table, unit, direction) => Some(res),
    };
    match outcome {
        Some(Ok(())) => {}
        Some(Err(e)) => {
            abort(tx, unit.version()).await;
            return Err(e.into());
        }
        None => {
            abort(tx, unit.version()).await;
            return Err(MigrateError::Cancelled);
        }
    }

    tx.commit().await?;
    Ok(())
}

async fn abort<DB: Database>(tx: Transaction<'_, DB>, version: &str) {
    if let Err(e) = tx.rollback().await {
        warn!(version = %version, error = %e, "Failed to roll back transaction");
    }
}

/// Yields the statements that should reach the database, skipping
/// comment-only entries.
fn executable_statements<'a>(
    version: &'a str,
    statements: &'a [String],
) -> impl Iterator<Item = &'a String> + 'a {
    statements.iter().filter(move |sql| {
        if is_comment_only(sql) {
            warn!(version = %version, comment = %sql, "Skipping comment-only statement");
            false
        } else {
            true
        }
    })
}
