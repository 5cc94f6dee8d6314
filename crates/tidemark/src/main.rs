//! tidemark CLI
//!
//! Command-line tool for planning and running database migrations.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use tidemark::prelude::*;
use tidemark::store::slugify;

/// Schema diffing and locked migration execution.
#[derive(Parser)]
#[command(name = "tidemark")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Database URL (`postgres://...` or `sqlite:path`).
    #[arg(short, long, env = "DATABASE_URL", default_value = "sqlite:db.sqlite3")]
    database: String,

    /// Migrations directory.
    #[arg(
        short,
        long,
        env = "TIDEMARK_MIGRATIONS_DIR",
        default_value = "migrations"
    )]
    migrations_dir: PathBuf,

    /// Tracking table name.
    #[arg(long, default_value = tidemark::config::DEFAULT_TRACKING_TABLE)]
    tracking_table: String,

    /// Fail immediately if another process holds the migration lock.
    #[arg(long)]
    no_wait: bool,

    /// Give up waiting for the migration lock after this many seconds.
    #[arg(long)]
    lock_timeout: Option<u64>,

    /// Enable verbose output.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the migrations system (create the tracking table).
    Init,

    /// Apply pending migrations.
    Up {
        /// Show SQL without executing (dry run).
        #[arg(long)]
        dry_run: bool,
    },

    /// Roll back applied migrations.
    Down {
        /// Roll back everything newer than this version.
        #[arg(long, conflicts_with = "count")]
        to: Option<String>,

        /// Number of migrations to roll back (1 if neither option is given).
        #[arg(short, long)]
        count: Option<usize>,

        /// Show SQL without executing (dry run).
        #[arg(long)]
        dry_run: bool,
    },

    /// Show migration status.
    Status,

    /// Generate a migration from two schema snapshots (JSON).
    Plan {
        /// Desired schema snapshot.
        #[arg(long)]
        desired: PathBuf,

        /// Actual schema snapshot (empty schema if not specified).
        #[arg(long)]
        actual: Option<PathBuf>,

        /// Migration name/description.
        #[arg(short, long, default_value = "auto")]
        name: String,

        /// SQL dialect to generate.
        #[arg(long, value_enum, default_value_t = DialectArg::Postgres)]
        dialect: DialectArg,

        /// Show SQL without writing files (dry run).
        #[arg(long)]
        dry_run: bool,
    },

    /// Show SQL for a migration without executing.
    Sql {
        /// Migration version.
        version: String,

        /// Show rollback SQL instead of forward SQL.
        #[arg(short, long)]
        reverse: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum DialectArg {
    Postgres,
    Sqlite,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .without_time()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let store = MigrationStore::new(&cli.migrations_dir);

    // Commands that never touch the database.
    match &cli.command {
        Commands::Plan {
            desired,
            actual,
            name,
            dialect,
            dry_run,
        } => return plan(&store, desired, actual.as_deref(), name, *dialect, *dry_run),
        Commands::Sql { version, reverse } => {
            let unit = store.read(version)?;
            let statements = if *reverse { unit.down() } else { unit.up() };
            for sql in statements {
                println!("{};", sql);
            }
            return Ok(());
        }
        _ => {}
    }

    let mut options = ExecutorOptions::new();
    if cli.no_wait {
        options = options.no_wait();
    }
    if let Some(secs) = cli.lock_timeout {
        options = options.lock_timeout(Duration::from_secs(secs));
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            on_signal.cancel();
        }
    });

    if cli.database.starts_with("sqlite:") {
        let connect = SqliteConnectOptions::from_str(&cli.database)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect)
            .await?;
        let backend = SqliteBackend::new(pool).with_tracking_table(&cli.tracking_table);
        run(MigrationExecutor::new(backend).with_options(options), &cli.command, &store, &cancel)
            .await
    } else {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&cli.database)
            .await?;
        let backend = PostgresBackend::new(pool).with_tracking_table(&cli.tracking_table);
        run(MigrationExecutor::new(backend).with_options(options), &cli.command, &store, &cancel)
            .await
    }
}

async fn run<B: MigrationBackend>(
    executor: MigrationExecutor<B>,
    command: &Commands,
    store: &MigrationStore,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    match command {
        Commands::Init => {
            info!("Initializing migrations system...");
            executor.initialize(cancel).await?;
            info!("Tracking table created successfully.");
        }

        Commands::Up { dry_run } => {
            let units = store.list()?;
            if *dry_run {
                info!("Dry run mode - SQL will be logged but not executed.");
            }
            let report = executor
                .apply_pending(&units, *dry_run, cancel)
                .await
                .inspect_err(report_failure)?;
            if report.is_empty() {
                info!("No pending migrations.");
            } else {
                info!(versions = ?report.versions, "Done.");
            }
        }

        Commands::Down { to, count, dry_run } => {
            let units = store.list()?;
            let report = match to {
                Some(target) => executor.rollback_to(target, &units, *dry_run, cancel).await,
                None => {
                    executor
                        .rollback_last(&units, count.unwrap_or(1), *dry_run, cancel)
                        .await
                }
            }
            .inspect_err(report_failure)?;
            if report.is_empty() {
                info!("Nothing to roll back.");
            } else {
                info!(versions = ?report.versions, "Done.");
            }
        }

        Commands::Status => {
            let units = match store.list() {
                Ok(units) => units,
                Err(MigrateError::MigrationsDirNotFound(dir)) => {
                    warn!("Migrations directory {} not found", dir.display());
                    Vec::new()
                }
                Err(e) => return Err(e.into()),
            };
            print_status(&executor.status(&units, cancel).await?);
        }

        // Handled before connecting.
        Commands::Plan { .. } | Commands::Sql { .. } => {}
    }

    Ok(())
}

fn report_failure(e: &MigrateError) {
    match e.failed_version() {
        Some(version) => error!(version = %version, "Migration {} failed", version),
        None => error!(kind = ?e.kind(), "Migration run failed"),
    }
}

fn print_status(report: &StatusReport) {
    if report.entries.is_empty() && report.orphaned.is_empty() {
        info!("No migrations found.");
        return;
    }

    println!("\nMigrations:");
    println!("{:-<60}", "");
    for entry in &report.entries {
        let marker = match entry.status {
            MigrationStatus::Applied => "[X]",
            MigrationStatus::Pending => "[ ]",
            MigrationStatus::Failed => "[!]",
        };
        match entry.applied_at {
            Some(at) => println!(
                " {} {}_{} ({})",
                marker,
                entry.version,
                entry.name,
                at.format("%Y-%m-%d %H:%M:%S")
            ),
            None => println!(" {} {}_{}", marker, entry.version, entry.name),
        }
    }
    for record in &report.orphaned {
        println!(
            " [?] {}_{} (applied {}, no migration file)",
            record.version,
            record.name,
            record.applied_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    println!();
}

fn plan(
    store: &MigrationStore,
    desired: &Path,
    actual: Option<&Path>,
    name: &str,
    dialect: DialectArg,
    dry_run: bool,
) -> anyhow::Result<()> {
    let desired = read_snapshot(desired)?;
    let actual = match actual {
        Some(path) => read_snapshot(path)?,
        None => Snapshot::new(),
    };

    let diff = compare(&desired, &actual);
    if !diff.has_changes() {
        info!("No changes detected.");
        return Ok(());
    }

    let plan = match dialect {
        DialectArg::Postgres => generate_migration(&diff, &PostgresDialect::new()),
        DialectArg::Sqlite => generate_migration(&diff, &SqliteDialect::new()),
    };
    for warning in &plan.warnings {
        warn!("{}", warning);
    }

    let unit = MigrationUnit::from_plan(generate_version(), slugify(name), &plan)?;
    if dry_run {
        println!("-- {} (up)", unit.id());
        for sql in unit.up() {
            println!("{};", sql);
        }
        println!("\n-- {} (down)", unit.id());
        for sql in unit.down() {
            println!("{};", sql);
        }
    } else {
        let path = store.write(&unit)?;
        info!("Created migration: {}", path.display());
    }
    Ok(())
}

fn read_snapshot(path: &Path) -> anyhow::Result<Snapshot> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("reading snapshot {}", path.display()))?;
    Snapshot::from_json(&json).with_context(|| format!("parsing snapshot {}", path.display()))
}
