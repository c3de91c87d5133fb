//! Insert strategies under comparison.

use anyhow::{Context, Result};
use pgext_postgres::bulk::coerce_value;
use pgext_postgres::{quote_identifier, BulkLoader, ColumnDescriptor, EntitySchema};
use serde::Serialize;
use sqlx::postgres::PgArguments;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument};

use crate::user::User;

/// Rows per multi-row INSERT in the batched strategy.
pub const BATCH_SIZE: usize = 1500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Method {
    /// One INSERT per row
    Naive,
    /// Multi-row parameterized INSERT, one transaction per batch
    Batched,
    /// Binary COPY through the async loader
    Copy,
    /// Binary COPY through the blocking loader on a blocking thread
    CopyBlocking,
}

impl Method {
    pub const ALL: [Method; 4] = [
        Method::Naive,
        Method::Batched,
        Method::Copy,
        Method::CopyBlocking,
    ];
}

#[derive(Debug, Clone, Serialize)]
pub struct BenchmarkReport {
    pub method: Method,
    pub rows_count: usize,
    pub elapsed_ms: u64,
}

/// Everything a strategy needs.
pub struct BenchContext {
    pub pool: PgPool,
    pub loader: BulkLoader,
    pub schema: Arc<EntitySchema<User>>,
}

/// Runs one strategy over `users` and times it. Data generation is not timed.
#[instrument(skip(ctx, users), fields(rows = users.len()))]
pub async fn run(ctx: &BenchContext, method: Method, users: Vec<User>) -> Result<BenchmarkReport> {
    let rows_count = users.len();
    let started = Instant::now();

    match method {
        Method::Naive => insert_naive(ctx, &users).await?,
        Method::Batched => insert_batched(ctx, &users).await?,
        Method::Copy => {
            let result = ctx.loader.load(&users).await?;
            debug!(rows_copied = result.rows_copied, "Copy finished");
        }
        Method::CopyBlocking => {
            let loader = ctx.loader.clone();
            let result = tokio::task::spawn_blocking(move || loader.load_blocking(&users))
                .await
                .context("Blocking copy task failed")??;
            debug!(rows_copied = result.rows_copied, "Blocking copy finished");
        }
    }

    let elapsed_ms = started.elapsed().as_millis() as u64;
    info!(?method, rows_count, elapsed_ms, "Strategy finished");
    Ok(BenchmarkReport {
        method,
        rows_count,
        elapsed_ms,
    })
}

/// `INSERT INTO "t" ("a", "b") VALUES ($1, $2), ($3, $4)`
fn insert_statement(table: &str, columns: &[&ColumnDescriptor<User>], rows: usize) -> String {
    let column_list = columns
        .iter()
        .map(|c| quote_identifier(&c.name))
        .collect::<Vec<_>>()
        .join(", ");

    let mut param_num = 1;
    let mut values_clauses = Vec::with_capacity(rows);
    for _ in 0..rows {
        let mut placeholders = Vec::with_capacity(columns.len());
        for _ in 0..columns.len() {
            placeholders.push(format!("${}", param_num));
            param_num += 1;
        }
        values_clauses.push(format!("({})", placeholders.join(", ")));
    }

    format!(
        "INSERT INTO {} ({}) VALUES {}",
        quote_identifier(table),
        column_list,
        values_clauses.join(", ")
    )
}

fn bind_rows(columns: &[&ColumnDescriptor<User>], users: &[User]) -> Result<PgArguments> {
    let mut args = PgArguments::default();
    for user in users {
        for column in columns {
            let value = coerce_value(column.kind, &column.pg_type, column.read(user));
            value.bind_as(&column.pg_type, &mut args)?;
        }
    }
    Ok(args)
}

async fn insert_naive(ctx: &BenchContext, users: &[User]) -> Result<()> {
    let columns = ctx.schema.load_columns(true);
    let sql = insert_statement(ctx.schema.table(), &columns, 1);

    for user in users {
        let args = bind_rows(&columns, std::slice::from_ref(user))?;
        sqlx::query_with(&sql, args).execute(&ctx.pool).await?;
    }
    Ok(())
}

async fn insert_batched(ctx: &BenchContext, users: &[User]) -> Result<()> {
    let columns = ctx.schema.load_columns(true);

    for batch in users.chunks(BATCH_SIZE) {
        let sql = insert_statement(ctx.schema.table(), &columns, batch.len());
        let args = bind_rows(&columns, batch)?;

        let mut tx = ctx.pool.begin().await?;
        sqlx::query_with(&sql, args).execute(&mut *tx).await?;
        tx.commit().await?;
    }
    Ok(())
}
