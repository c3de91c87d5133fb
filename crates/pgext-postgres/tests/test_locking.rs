//! Integration tests for row-lock clauses.
//!
//! These tests require a PostgreSQL database to be running and are marked
//! `#[ignore]`.
//!
//! Run with: DATABASE_URL=postgresql://localhost/test_db cargo test -p pgext-postgres --test test_locking -- --ignored

use pgext_postgres::{
    ConnectConfig, Connection, LockBehavior, LockClause, LockedSelect, PgExtError, PgType,
};
use sqlx::Row;

/// Helper to get database URL from environment
fn get_database_url() -> String {
    std::env::var("DATABASE_URL").unwrap_or_else(|_| "postgresql://localhost/test_db".to_string())
}

/// Helper to create a job table with three rows
async fn setup_jobs(pool: &sqlx::PgPool, table: &str) -> Result<(), sqlx::Error> {
    sqlx::query(&format!(r#"DROP TABLE IF EXISTS "{}""#, table))
        .execute(pool)
        .await?;
    sqlx::query(&format!(
        r#"CREATE TABLE "{}" ("Id" BIGINT PRIMARY KEY, "State" INTEGER NOT NULL)"#,
        table
    ))
    .execute(pool)
    .await?;
    sqlx::query(&format!(
        r#"INSERT INTO "{}" ("Id", "State") VALUES (1, 0), (2, 0), (3, 0)"#,
        table
    ))
    .execute(pool)
    .await?;
    Ok(())
}

async fn cleanup_jobs(pool: &sqlx::PgPool, table: &str) -> Result<(), sqlx::Error> {
    sqlx::query(&format!(r#"DROP TABLE IF EXISTS "{}""#, table))
        .execute(pool)
        .await?;
    Ok(())
}

fn select_jobs(table: &str, clause: LockClause) -> LockedSelect {
    LockedSelect::new(format!(
        r#"SELECT "Id" FROM "{}" WHERE "State" = $1 ORDER BY "Id""#,
        table
    ))
    .expect("valid select")
    .bind(0i32, PgType::Int4)
    .lock(clause)
}

#[tokio::test]
#[ignore] // Only run with --ignored flag when database is available
async fn test_skip_locked_and_nowait() -> anyhow::Result<()> {
    let uri = get_database_url();
    let conn = Connection::new(&uri, ConnectConfig::default())?;
    let pool = conn.pool(3).await?;
    let table = "test_locking_jobs";
    setup_jobs(&pool, table).await?;

    // First transaction locks job 1.
    let mut holder = pool.begin().await?;
    let locked = LockedSelect::new(format!(r#"SELECT "Id" FROM "{}" WHERE "Id" = $1"#, table))?
        .bind(1i64, PgType::Int8)
        .lock(LockClause::for_update(LockBehavior::Default))
        .fetch_optional(&mut holder)
        .await?;
    assert!(locked.is_some());

    // SKIP LOCKED sees the other two.
    let mut skipper = pool.begin().await?;
    let ids: Vec<(i64,)> = select_jobs(table, LockClause::for_update(LockBehavior::SkipLocked))
        .fetch_all_as(&mut skipper)
        .await?;
    assert_eq!(ids, vec![(2,), (3,)]);
    skipper.rollback().await?;

    // NOWAIT fails instead of waiting.
    let mut impatient = pool.begin().await?;
    let result = select_jobs(table, LockClause::for_update(LockBehavior::NoWait))
        .fetch_all(&mut impatient)
        .await;
    assert!(matches!(result, Err(PgExtError::Database(_))));
    impatient.rollback().await?;

    // A trailing line comment does not swallow the clause.
    let mut commented = pool.begin().await?;
    let result = LockedSelect::new(format!(
        r#"SELECT "Id" FROM "{}" WHERE "Id" = $1 -- next job"#,
        table
    ))?
    .bind(1i64, PgType::Int8)
    .lock(LockClause::for_update(LockBehavior::NoWait))
    .fetch_all(&mut commented)
    .await;
    assert!(matches!(result, Err(PgExtError::Database(_))));
    commented.rollback().await?;

    // Without a lock clause all rows are visible.
    let mut reader = pool.begin().await?;
    let rows = select_jobs(table, LockClause::None).fetch_all(&mut reader).await?;
    let ids: Vec<i64> = rows.iter().map(|r| r.get(0)).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    reader.rollback().await?;

    holder.rollback().await?;
    cleanup_jobs(&pool, table).await?;
    Ok(())
}
