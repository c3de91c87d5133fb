//! Paired up/down SQL for the schema objects this crate generates.
//!
//! ```rust,ignore
//! let migration = MigrationBuilder::new()
//!     .create_natural_sort_key_function()
//!     .create_random_id_sequence(&RandomIdSequenceSpec::new("Users", "Id", 1000, 1, 100)?)
//!     .create_unique_index_on_encrypted_column("Users", "Email", Some("\"Deleted\" = false"))?
//!     .build("create_users_helpers");
//!
//! migration.apply(&mut conn).await?;
//! ```

use sqlx::postgres::PgConnection;
use sqlx::Connection as _;
use tracing::{info, instrument};

use crate::natural_sort;
use crate::random_id::RandomIdSequenceSpec;
use crate::validation::{quote_identifier, validate_identifier_part};
use crate::Result;

/// Leading characters of an encrypted value that the unique index covers.
pub const ENCRYPTED_PREFIX_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Step {
    up: String,
    /// `None` for steps that cannot be reverted
    down: Option<String>,
}

/// Accumulates migration steps in order.
#[derive(Debug, Clone, Default)]
pub struct MigrationBuilder {
    steps: Vec<Step>,
}

impl MigrationBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw statement with its reverse. An empty `down` makes the step irreversible.
    pub fn sql(mut self, up: impl Into<String>, down: impl Into<String>) -> Self {
        let down = down.into();
        self.steps.push(Step {
            up: up.into(),
            down: if down.trim().is_empty() { None } else { Some(down) },
        });
        self
    }

    pub fn create_random_id_sequence(self, spec: &RandomIdSequenceSpec) -> Self {
        self.sql(spec.create_sql(), spec.drop_sql())
    }

    pub fn create_natural_sort_key_function(self) -> Self {
        self.sql(
            natural_sort::create_function_sql(),
            natural_sort::drop_function_sql(),
        )
    }

    /// Unique index over the first 64 characters of `column`, named
    /// `ix_<table>_<column>`, optionally partial.
    ///
    /// `condition` is inserted verbatim as the `WHERE` predicate.
    pub fn create_unique_index_on_encrypted_column(
        self,
        table: &str,
        column: &str,
        condition: Option<&str>,
    ) -> Result<Self> {
        let index = encrypted_index_name(table, column)?;
        let where_clause = match condition.map(str::trim) {
            Some(predicate) if !predicate.is_empty() => format!(" WHERE {}", predicate),
            _ => String::new(),
        };

        let up = format!(
            "CREATE UNIQUE INDEX {} ON {} (substr({}, 1, {})){};",
            quote_identifier(&index),
            quote_identifier(table),
            quote_identifier(column),
            ENCRYPTED_PREFIX_LEN,
            where_clause
        );
        let down = format!("DROP INDEX IF EXISTS {};", quote_identifier(&index));
        Ok(self.sql(up, down))
    }

    pub fn drop_unique_index_on_encrypted_column(self, table: &str, column: &str) -> Result<Self> {
        let index = encrypted_index_name(table, column)?;
        Ok(self.sql(format!("DROP INDEX {};", quote_identifier(&index)), ""))
    }

    pub fn build(self, name: impl Into<String>) -> Migration {
        Migration {
            name: name.into(),
            steps: self.steps,
        }
    }
}

/// `ix_<table>_<column>`
pub fn encrypted_index_name(table: &str, column: &str) -> Result<String> {
    validate_identifier_part(table)?;
    validate_identifier_part(column)?;
    let index = format!("ix_{}_{}", table, column);
    validate_identifier_part(&index)?;
    Ok(index)
}

/// A named, ordered set of steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    name: String,
    steps: Vec<Step>,
}

impl Migration {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Whether every step has a reverse.
    pub fn is_reversible(&self) -> bool {
        self.steps.iter().all(|s| s.down.is_some())
    }

    pub fn up_script(&self) -> String {
        self.steps
            .iter()
            .map(|s| s.up.trim_end())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Reverse statements, last step first. Irreversible steps are skipped.
    pub fn down_script(&self) -> String {
        self.steps
            .iter()
            .rev()
            .filter_map(|s| s.down.as_deref().map(str::trim_end))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Runs the up script in one transaction.
    #[instrument(skip(self, conn), fields(migration = %self.name, steps = self.steps.len()))]
    pub async fn apply(&self, conn: &mut PgConnection) -> Result<()> {
        run_script(conn, &self.up_script()).await?;
        info!("Migration applied");
        Ok(())
    }

    /// Runs the down script in one transaction.
    #[instrument(skip(self, conn), fields(migration = %self.name, steps = self.steps.len()))]
    pub async fn revert(&self, conn: &mut PgConnection) -> Result<()> {
        run_script(conn, &self.down_script()).await?;
        info!("Migration reverted");
        Ok(())
    }
}

async fn run_script(conn: &mut PgConnection, script: &str) -> Result<()> {
    if script.trim().is_empty() {
        return Ok(());
    }
    let mut tx = conn.begin().await?;
    sqlx::raw_sql(script).execute(&mut *tx).await?;
    tx.commit().await?;
    Ok(())
}
