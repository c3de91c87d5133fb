//! Postgres extension helpers for application code built on sqlx.
//!
//! - **Bulk loading**: stream typed records through the binary `COPY` protocol,
//!   storing enum members as their integer representation.
//! - **Random ids**: SQL for a sequence plus an advisory-locked generator
//!   function that hands out increasing ids with random gaps.
//! - **Natural sort keys**: SQL for `get_natural_sort_key(text)` and a Rust
//!   mirror of it.
//! - **Row locks**: `FOR UPDATE` / `SKIP LOCKED` / `NOWAIT` as a typed query parameter.
//! - **Migrations**: paired up/down scripts for all of the above plus unique
//!   indexes on encrypted columns.
//!
//! # Architecture
//!
//! ```text
//! EntitySchema<T> (column accessors)  ──>  SchemaRegistry
//!                                               |
//!                               BulkLoader (coercion, buffering)
//!                                               |
//!                               BinaryCopyEncoder ──> CopySink
//!                                               |
//!                                    sqlx PgCopyIn (COPY FROM STDIN)
//! ```
//!
//! # Usage Examples
//!
//! ## Bulk Load
//!
//! ```rust,ignore
//! use pgext_postgres::{
//!     BulkConfig, BulkLoader, ConnectConfig, Connection, EntitySchema, ExtractedValue,
//!     PgType, SchemaRegistry,
//! };
//!
//! # async fn example(users: Vec<User>) -> pgext_postgres::Result<()> {
//! SchemaRegistry::global().register(
//!     EntitySchema::<User>::builder("Users")
//!         .primary_key("Id", PgType::Int8, |u| u.id.into())
//!         .column("Name", PgType::Text, |u| u.name.clone().into())
//!         .enum_column("Status", PgType::Int4, |u| ExtractedValue::from_enum(&u.status))
//!         .build()?,
//! );
//!
//! let conn = Connection::new("postgresql://localhost/app", ConnectConfig::default())?;
//! let result = BulkLoader::new(conn, BulkConfig::default()).load(&users).await?;
//! println!("copied {} rows in {}ms", result.rows_copied, result.elapsed_ms);
//! # Ok(())
//! # }
//! ```
//!
//! ## Random Id Sequence
//!
//! ```rust,ignore
//! use pgext_postgres::{MigrationBuilder, RandomIdSequenceSpec};
//!
//! let spec = RandomIdSequenceSpec::new("Users", "Id", 1_000_000, 1, 100)?;
//! let migration = MigrationBuilder::new()
//!     .create_random_id_sequence(&spec)
//!     .sql(
//!         format!(r#"CREATE TABLE "Users" ("Id" bigint PRIMARY KEY DEFAULT {})"#, spec.default_value_sql()),
//!         r#"DROP TABLE "Users""#,
//!     )
//!     .build("create_users");
//! migration.apply(&mut conn).await?;
//! ```

/// Connection establishment with timeouts and opt-in retry.
pub mod connection;

/// Value model (`ExtractedValue`, `PgEnum`) and column type mapping (`PgType`).
pub mod types;

/// Per-entity column accessor tables and the schema registry.
pub mod schema;

/// Binary `COPY` stream encoding.
pub mod copy;

/// Bulk loading over the binary copy protocol.
pub mod bulk;

/// Jittered random-id sequence and generator function SQL.
pub mod random_id;

/// Natural sort key SQL function and its Rust mirror.
pub mod natural_sort;

/// Row-lock clauses for SELECT statements.
pub mod locking;

/// Paired up/down migration scripts.
pub mod migration;

/// Identifier validation and quoting.
///
/// Every name interpolated into generated SQL is validated here first.
pub mod validation;

pub use bulk::{BulkConfig, BulkLoader, BulkResult, LoadRequest};
pub use connection::{ConnectConfig, Connection, RetryConfig};
pub use copy::{BinaryCopyEncoder, CopySink};
pub use locking::{LockBehavior, LockClause, LockedSelect};
pub use migration::{Migration, MigrationBuilder};
pub use natural_sort::natural_sort_key;
pub use random_id::{AdvisoryLock, RandomIdSequenceSpec};
pub use schema::{ColumnDescriptor, ColumnKind, EntitySchema, SchemaRegistry};
pub use types::{EnumRepr, EnumValue, ExtractedValue, PgEnum, PgType};
pub use validation::{quote_identifier, validate_identifier};

pub use pgext_common::{PgExtError, Result};
