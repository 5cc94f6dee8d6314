//! PostgreSQL tests. They run only when `TIDEMARK_TEST_DATABASE_URL` points at
//! a database the tests may create and drop tables in.

use std::time::{SystemTime, UNIX_EPOCH};

use sqlx::postgres::{PgPool, PgPoolOptions};

use tidemark::prelude::*;

async fn test_pool() -> Option<PgPool> {
    let url = std::env::var("TIDEMARK_TEST_DATABASE_URL").ok()?;
    Some(
        PgPoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .expect("Failed to connect to TIDEMARK_TEST_DATABASE_URL"),
    )
}

/// A suffix that keeps concurrent test runs apart.
fn unique_suffix() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .subsec_nanos();
    format!("{}_{}", std::process::id(), nanos)
}

async fn table_exists(pool: &PgPool, name: &str) -> bool {
    let (exists,): (bool,) = sqlx::query_as(
        "SELECT EXISTS (
            SELECT 1 FROM information_schema.tables
            WHERE table_schema = current_schema() AND table_name = $1
        )",
    )
    .bind(name)
    .fetch_one(pool)
    .await
    .unwrap();
    exists
}

#[tokio::test]
async fn advisory_lock_is_exclusive() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let key = i64::from(std::process::id()) + 0x7464_0000;
    let cancel = CancellationToken::new();

    let first = PostgresBackend::new(pool.clone()).with_lock_key(key);
    let second = PostgresBackend::new(pool).with_lock_key(key);

    first
        .acquire_lock(LockMode::NoWait, None, &cancel)
        .await
        .unwrap();
    assert!(matches!(
        second.acquire_lock(LockMode::NoWait, None, &cancel).await,
        Err(MigrateError::LockContention)
    ));

    first.release_lock().await.unwrap();
    second
        .acquire_lock(LockMode::NoWait, None, &cancel)
        .await
        .unwrap();
    second.release_lock().await.unwrap();
}

#[tokio::test]
async fn dropping_a_locked_backend_frees_the_lock() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let key = i64::from(std::process::id()) + 0x7464_1000;
    let cancel = CancellationToken::new();

    let holder = PostgresBackend::new(pool.clone()).with_lock_key(key);
    holder
        .acquire_lock(LockMode::NoWait, None, &cancel)
        .await
        .unwrap();
    drop(holder);

    let next = PostgresBackend::new(pool).with_lock_key(key);
    next.acquire_lock(
        LockMode::Wait,
        Some(std::time::Duration::from_secs(5)),
        &cancel,
    )
    .await
    .unwrap();
    next.release_lock().await.unwrap();
}

#[tokio::test]
async fn generated_plan_applies_and_reverts() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let suffix = unique_suffix();
    let users = format!("users_{suffix}");
    let posts = format!("posts_{suffix}");
    let cancel = CancellationToken::new();

    let backend = PostgresBackend::new(pool.clone())
        .with_tracking_table(format!("tidemark_test_{suffix}"))
        .with_lock_key(i64::from(std::process::id()) + 0x7464_2000);
    let executor = MigrationExecutor::new(backend);

    let desired = Snapshot::new()
        .table(
            Table::new(&users)
                .column(
                    Column::new("id", "bigint")
                        .not_null()
                        .identity(IdentityMode::ByDefault),
                )
                .column(Column::new("email", "varchar(255)").not_null().unique())
                .primary_key(format!("{users}_pkey"), &["id"]),
        )
        .table(
            Table::new(&posts)
                .column(Column::new("id", "bigserial").not_null())
                .column(Column::new("author_id", "bigint").not_null())
                .primary_key(format!("{posts}_pkey"), &["id"])
                .index(Index::new(format!("{posts}_author_idx"), &["author_id"]))
                .foreign_key(
                    ForeignKey::new(format!("{posts}_author_fk"), &["author_id"], &users, &["id"])
                        .on_delete(ForeignKeyAction::Cascade),
                ),
        );

    let plan = generate_migration(&compare(&desired, &Snapshot::new()), &PostgresDialect::new());
    assert!(!plan.requires_manual_steps());
    let unit = MigrationUnit::from_plan("1", "create", &plan).unwrap();
    let units = vec![unit];

    executor.apply_pending(&units, false, &cancel).await.unwrap();
    assert!(table_exists(&pool, &users).await);
    assert!(table_exists(&pool, &posts).await);

    let report = executor.rollback_last(&units, 1, false, &cancel).await.unwrap();
    assert_eq!(report.versions, vec!["1"]);
    assert!(!table_exists(&pool, &users).await);
    assert!(!table_exists(&pool, &posts).await);

    sqlx::query(&format!("DROP TABLE \"tidemark_test_{suffix}\""))
        .execute(&pool)
        .await
        .unwrap();
}

#[tokio::test]
async fn failed_statement_leaves_no_trace() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let suffix = unique_suffix();
    let cancel = CancellationToken::new();
    let tracking = format!("tidemark_test_{suffix}");
    let executor = MigrationExecutor::new(
        PostgresBackend::new(pool.clone())
            .with_tracking_table(&tracking)
            .with_lock_key(i64::from(std::process::id()) + 0x7464_3000),
    );

    let broken = MigrationUnit::new(
        "1",
        "broken",
        vec![
            format!("CREATE TABLE \"half_{suffix}\" (id bigint)"),
            "ALTER TABLE \"does_not_exist\" ADD COLUMN x int".to_string(),
        ],
        vec![],
    )
    .unwrap();

    let err = executor
        .apply_pending(&[broken], false, &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Statement);
    assert!(!table_exists(&pool, &format!("half_{suffix}")).await);
    assert!(executor.applied_migrations(&cancel).await.unwrap().is_empty());

    sqlx::query(&format!("DROP TABLE \"{tracking}\""))
        .execute(&pool)
        .await
        .unwrap();
}
