//! Migration executor.
//!
//! This module applies and rolls back migration units against a database
//! backend, keeping the tracking table in step with the schema.
//!
//! Single-unit [`MigrationExecutor::apply`] and [`MigrationExecutor::rollback`]
//! do not lock; callers wrap them in [`MigrationExecutor::lock`] and
//! [`MigrationExecutor::unlock`]. The batch operations take the lock once for
//! the whole batch and release it on every exit path. Dry runs never lock and
//! never write.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::MigrationBackend;
use crate::config::ExecutorOptions;
use crate::error::{MigrateError, Result};
use crate::planner::Direction;
use crate::status::{MigrationRecord, StatusReport};
use crate::unit::{is_manual_placeholder, MigrationUnit};

/// Outcome of a batch operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Versions applied or rolled back, in execution order. For a dry run,
    /// the versions that would have been.
    pub versions: Vec<String>,
    /// Whether this was a dry run.
    pub dry_run: bool,
}

impl BatchReport {
    /// Returns true if nothing was (or would be) executed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

/// Executes migration units against a backend.
pub struct MigrationExecutor<B: MigrationBackend> {
    backend: B,
    options: ExecutorOptions,
}

impl<B: MigrationBackend> MigrationExecutor<B> {
    /// Creates a new migration executor with default options.
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            options: ExecutorOptions::default(),
        }
    }

    /// Sets the executor options.
    #[must_use]
    pub fn with_options(mut self, options: ExecutorOptions) -> Self {
        self.options = options;
        self
    }

    /// Returns the backend.
    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Returns the options.
    #[must_use]
    pub fn options(&self) -> &ExecutorOptions {
        &self.options
    }

    /// Ensures the tracking table exists.
    pub async fn initialize(&self, cancel: &CancellationToken) -> Result<()> {
        self.backend.ensure_tracking_table(cancel).await
    }

    /// Acquires the migration lock according to the configured lock mode.
    pub async fn lock(&self, cancel: &CancellationToken) -> Result<()> {
        debug!(
            backend = self.backend.name(),
            mode = ?self.options.lock_mode,
            "Acquiring migration lock"
        );
        self.backend
            .acquire_lock(self.options.lock_mode, self.options.lock_timeout, cancel)
            .await
    }

    /// Releases the migration lock. Runs regardless of cancellation.
    pub async fn unlock(&self) -> Result<()> {
        self.backend.release_lock().await
    }

    /// Applies a single unit. Returns false if it was already applied.
    pub async fn apply(
        &self,
        unit: &MigrationUnit,
        dry_run: bool,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        if dry_run {
            log_dry_run(unit, Direction::Up);
            return Ok(true);
        }

        info!(version = %unit.version(), name = %unit.name(), "Applying migration");

        if self.applied_versions(cancel).await?.contains(unit.version()) {
            warn!(
                version = %unit.version(),
                name = %unit.name(),
                "Migration already applied, skipping"
            );
            return Ok(false);
        }

        if let Err(e) = self.backend.apply_unit(unit, cancel).await {
            error!(version = %unit.version(), error = %e, "Migration failed");
            return Err(e);
        }

        info!(version = %unit.version(), name = %unit.name(), "Migration applied successfully");
        Ok(true)
    }

    /// Rolls back a single unit. Returns false if it was not applied.
    pub async fn rollback(
        &self,
        unit: &MigrationUnit,
        dry_run: bool,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        if dry_run {
            log_dry_run(unit, Direction::Down);
            return Ok(true);
        }

        info!(version = %unit.version(), name = %unit.name(), "Rolling back migration");

        if !self.applied_versions(cancel).await?.contains(unit.version()) {
            warn!(
                version = %unit.version(),
                name = %unit.name(),
                "Migration not applied, skipping rollback"
            );
            return Ok(false);
        }

        if let Err(e) = self.backend.revert_unit(unit, cancel).await {
            error!(version = %unit.version(), error = %e, "Rollback failed");
            return Err(e);
        }

        info!(
            version = %unit.version(),
            name = %unit.name(),
            "Migration rolled back successfully"
        );
        Ok(true)
    }

    /// Applies every pending unit in the given order under one lock, halting
    /// at the first failure.
    pub async fn apply_pending(
        &self,
        units: &[MigrationUnit],
        dry_run: bool,
        cancel: &CancellationToken,
    ) -> Result<BatchReport> {
        index_units(units)?;

        if dry_run {
            let applied = self.preview_applied(cancel).await?;
            let mut versions = Vec::new();
            for unit in units.iter().filter(|u| !applied.contains(u.version())) {
                log_dry_run(unit, Direction::Up);
                versions.push(unit.version().to_string());
            }
            return Ok(BatchReport {
                versions,
                dry_run: true,
            });
        }

        self.with_lock(cancel, || async {
            self.initialize(cancel).await?;
            let mut versions = Vec::new();
            for unit in units {
                if self.apply(unit, false, cancel).await? {
                    versions.push(unit.version().to_string());
                }
            }
            info!(count = versions.len(), "Applied pending migrations");
            Ok(BatchReport {
                versions,
                dry_run: false,
            })
        })
        .await
    }

    /// Rolls back every applied version newer than `target`, newest first,
    /// under one lock. `target` itself stays applied.
    ///
    /// Fails with [`MigrateError::TargetNotFound`] if `target` is not among
    /// `units` or is not applied, and with [`MigrateError::MissingUnit`] if a
    /// version to roll back has no unit. Both are checked before anything is
    /// rolled back.
    pub async fn rollback_to(
        &self,
        target: &str,
        units: &[MigrationUnit],
        dry_run: bool,
        cancel: &CancellationToken,
    ) -> Result<BatchReport> {
        let by_version = index_units(units)?;
        if !by_version.contains_key(target) {
            return Err(MigrateError::TargetNotFound(target.to_string()));
        }

        self.rollback_batch(dry_run, cancel, |applied| {
            if !applied.contains(target) {
                return Err(MigrateError::TargetNotFound(target.to_string()));
            }
            resolve(
                applied.iter().rev().filter(|v| v.as_str() > target),
                &by_version,
            )
        })
        .await
    }

    /// Rolls back the newest `count` applied versions under one lock.
    pub async fn rollback_last(
        &self,
        units: &[MigrationUnit],
        count: usize,
        dry_run: bool,
        cancel: &CancellationToken,
    ) -> Result<BatchReport> {
        let by_version = index_units(units)?;

        self.rollback_batch(dry_run, cancel, |applied| {
            resolve(applied.iter().rev().take(count), &by_version)
        })
        .await
    }

    /// Returns every tracking record, ascending by version.
    pub async fn applied_migrations(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<MigrationRecord>> {
        self.backend.applied_records(cancel).await
    }

    /// Reports the status of every unit, plus records matching no unit.
    pub async fn status(
        &self,
        units: &[MigrationUnit],
        cancel: &CancellationToken,
    ) -> Result<StatusReport> {
        let records = if self.backend.tracking_table_exists(cancel).await? {
            self.backend.applied_records(cancel).await?
        } else {
            Vec::new()
        };
        Ok(StatusReport::build(units, &records))
    }

    async fn applied_versions(&self, cancel: &CancellationToken) -> Result<BTreeSet<String>> {
        Ok(self
            .backend
            .applied_records(cancel)
            .await?
            .into_iter()
            .map(|r| r.version)
            .collect())
    }

    /// Applied versions for a dry run; a missing tracking table means none.
    async fn preview_applied(&self, cancel: &CancellationToken) -> Result<BTreeSet<String>> {
        if self.backend.tracking_table_exists(cancel).await? {
            self.applied_versions(cancel).await
        } else {
            Ok(BTreeSet::new())
        }
    }

    async fn rollback_batch<'u, P>(
        &self,
        dry_run: bool,
        cancel: &CancellationToken,
        plan: P,
    ) -> Result<BatchReport>
    where
        P: FnOnce(&BTreeSet<String>) -> Result<Vec<&'u MigrationUnit>>,
    {
        if dry_run {
            let to_revert = plan(&self.preview_applied(cancel).await?)?;
            let mut versions = Vec::new();
            for unit in to_revert {
                log_dry_run(unit, Direction::Down);
                versions.push(unit.version().to_string());
            }
            return Ok(BatchReport {
                versions,
                dry_run: true,
            });
        }

        self.with_lock(cancel, || async {
            self.initialize(cancel).await?;
            let to_revert = plan(&self.applied_versions(cancel).await?)?;
            let mut versions = Vec::new();
            for unit in to_revert {
                if self.rollback(unit, false, cancel).await? {
                    versions.push(unit.version().to_string());
                }
            }
            info!(count = versions.len(), "Rolled back migrations");
            Ok(BatchReport {
                versions,
                dry_run: false,
            })
        })
        .await
    }

    /// Runs `body` holding the lock, releasing it whatever the outcome.
    async fn with_lock<T, F, Fut>(&self, cancel: &CancellationToken, body: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.lock(cancel).await?;
        let result = body().await;
        let released = self.unlock().await;

        match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(unlock_err)) => {
                warn!(error = %unlock_err, "Failed to release migration lock after error");
                Err(e)
            }
        }
    }
}

fn log_dry_run(unit: &MigrationUnit, direction: Direction) {
    let statements = match direction {
        Direction::Up => unit.up(),
        Direction::Down => unit.down(),
    };
    info!(
        version = %unit.version(),
        name = %unit.name(),
        %direction,
        "Dry run, not executing"
    );
    for sql in statements {
        if is_manual_placeholder(sql) {
            warn!(
                version = %unit.version(),
                placeholder = %sql,
                "Manual step must be written before this migration can run"
            );
        } else {
            info!(version = %unit.version(), sql = %sql, "Would execute");
        }
    }
}

/// Indexes units by version, rejecting duplicates.
fn index_units(units: &[MigrationUnit]) -> Result<BTreeMap<&str, &MigrationUnit>> {
    let mut by_version = BTreeMap::new();
    for unit in units {
        if by_version.insert(unit.version(), unit).is_some() {
            return Err(MigrateError::DuplicateVersion(unit.version().to_string()));
        }
    }
    Ok(by_version)
}

/// Maps versions to their units, failing on the first unknown one.
fn resolve<'a, 'u>(
    versions: impl Iterator<Item = &'a String>,
    by_version: &BTreeMap<&str, &'u MigrationUnit>,
) -> Result<Vec<&'u MigrationUnit>> {
    versions
        .map(|v| {
            by_version
                .get(v.as_str())
                .copied()
                .ok_or_else(|| MigrateError::MissingUnit(v.clone()))
        })
        .collect()
}
