//! pgext-bench - compare insert strategies against the demo `Users` table
//!
//! Usage:
//!   pgext-bench --database-url postgresql://localhost/bench
//!   pgext-bench --rows 50000 --method copy
//!   pgext-bench --method copy-blocking --skip-reset
//!
//! Each strategy prints one JSON report line to stdout:
//!   {"method":"copy","rows_count":10000,"elapsed_ms":412}

mod strategies;
mod user;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use pgext_postgres::{BulkConfig, BulkLoader, ConnectConfig, Connection, SchemaRegistry};
use tracing::info;

use strategies::{BenchContext, Method};
use user::User;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum MethodArg {
    Naive,
    Batched,
    Copy,
    CopyBlocking,
    All,
}

impl MethodArg {
    fn methods(self) -> Vec<Method> {
        match self {
            MethodArg::Naive => vec![Method::Naive],
            MethodArg::Batched => vec![Method::Batched],
            MethodArg::Copy => vec![Method::Copy],
            MethodArg::CopyBlocking => vec![Method::CopyBlocking],
            MethodArg::All => Method::ALL.to_vec(),
        }
    }
}

#[derive(Parser)]
#[command(name = "pgext-bench")]
#[command(about = "Bulk insert benchmark for pgext", long_about = None)]
#[command(version)]
struct Cli {
    /// PostgreSQL connection string
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Rows inserted per strategy
    #[arg(long, default_value_t = 10_000)]
    rows: usize,

    /// Strategy to run
    #[arg(long, value_enum, default_value = "all")]
    method: MethodArg,

    /// Keep the existing table instead of recreating it
    #[arg(long)]
    skip_reset: bool,

    /// Log level (overridden by RUST_LOG)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    let rt = tokio::runtime::Runtime::new()
        .context("Failed to create tokio runtime")?;

    rt.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    let registry = SchemaRegistry::global();
    registry.register(user::schema()?);
    let schema = registry.resolve::<User>()?;

    let conn = Connection::new(&cli.database_url, ConnectConfig::default())
        .context("Invalid database URL")?;
    conn.ping().await.context("Database is not reachable")?;

    if !cli.skip_reset {
        let migration = user::migration()?;
        let mut db = conn.open().await?;
        migration.revert(&mut db).await?;
        migration.apply(&mut db).await?;
        info!(migration = migration.name(), "Reset demo schema");
    }

    let ctx = BenchContext {
        pool: conn.pool(4).await?,
        loader: BulkLoader::new(conn, BulkConfig::default()),
        schema,
    };

    for method in cli.method.methods() {
        let users = user::generate(cli.rows);
        let report = strategies::run(&ctx, method, users).await?;
        println!("{}", serde_json::to_string(&report)?);
    }

    ctx.pool.close().await;
    Ok(())
}

/// Initialize logging based on log level
fn init_logging(level: &str) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .ok();

    Ok(())
}
