//! Schema diffing, migration planning and locked migration execution.
//!
//! `tidemark` compares two relational schema snapshots and turns the
//! difference into ordered, reversible SQL:
//! - The differ is a pure comparison of a desired and an actual snapshot
//! - The planner orders statements so constraints never point at missing
//!   tables, and builds the inverse ("down") statements independently
//! - The executor applies units one transaction at a time, recording each in a
//!   tracking table, serialized across processes by a database lock
//!
//! # Architecture
//!
//! - **Schema** - `Snapshot`, `Table`, `Column` and friends
//! - **Diff** - `compare(desired, actual)` produces a `SchemaDiff`
//! - **Planner** - `generate_migration(diff, dialect)` produces a `MigrationPlan`
//! - **Dialect** - Database-specific DDL rendering (PostgreSQL, SQLite)
//! - **Store** - Migration units as `.up.sql` / `.down.sql` files
//! - **Executor** - Applies and rolls back units over a `MigrationBackend`
//!
//! # Example
//!
//! ```rust,ignore
//! use tidemark::prelude::*;
//!
//! let desired = Snapshot::new().table(
//!     Table::new("users")
//!         .column(Column::new("id", "bigserial").not_null())
//!         .column(Column::new("email", "varchar(255)").not_null().unique())
//!         .primary_key("users_pkey", &["id"]),
//! );
//!
//! let diff = compare(&desired, &Snapshot::new());
//! let plan = generate_migration(&diff, &PostgresDialect::new());
//! let unit = MigrationUnit::from_plan(generate_version(), "create_users", &plan)?;
//!
//! let executor = MigrationExecutor::new(PostgresBackend::new(pool));
//! executor.apply_pending(&[unit], false, &CancellationToken::new()).await?;
//! ```
//!
//! # CLI Usage
//!
//! ```bash
//! # Write a migration from two snapshots
//! tidemark plan --desired desired.json --actual actual.json --name add_users
//!
//! # Apply pending migrations
//! tidemark up
//!
//! # Roll back everything newer than a version
//! tidemark down --to 20240101120000
//!
//! # Show migration status
//! tidemark status
//! ```

pub mod backend;
pub mod config;
pub mod dialect;
pub mod diff;
pub mod error;
pub mod executor;
pub mod planner;
pub mod schema;
pub mod status;
pub mod store;
pub mod unit;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::backend::{MigrationBackend, PostgresBackend, SqliteBackend};
    pub use crate::config::{ExecutorOptions, LockMode};
    pub use crate::dialect::{MigrationDialect, PostgresDialect, SqliteDialect};
    pub use crate::diff::{compare, ColumnChange, PrimaryKeyChange, SchemaDiff, TableDiff};
    pub use crate::error::{ErrorKind, MigrateError, Result};
    pub use crate::executor::{BatchReport, MigrationExecutor};
    pub use crate::planner::{generate_migration, Direction, MigrationPlan, PlanWarning};
    pub use crate::schema::{
        Column, Constraint, ConstraintKind, ForeignKey, ForeignKeyAction, IdentityMode, Index,
        PrimaryKey, Snapshot, Table,
    };
    pub use crate::status::{MigrationRecord, MigrationStatus, StatusEntry, StatusReport};
    pub use crate::store::{generate_version, split_statements, MigrationStore};
    pub use crate::unit::MigrationUnit;
    pub use tokio_util::sync::CancellationToken;
}
