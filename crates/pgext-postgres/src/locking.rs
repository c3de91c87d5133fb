//! Row-lock clauses for SELECT statements.
//!
//! The lock is part of the statement value: [`LockedSelect`] appends the
//! clause to the end of the query, and its execution helpers only accept a
//! `sqlx::Transaction`, since a row lock outside a transaction is released
//! as soon as the statement ends.
//!
//! ```rust,ignore
//! let mut tx = pool.begin().await?;
//! let rows = LockedSelect::new(r#"SELECT * FROM "Jobs" WHERE "State" = $1 LIMIT 10"#)?
//!     .bind(0i32, PgType::Int4)
//!     .lock(LockClause::for_update(LockBehavior::SkipLocked))
//!     .fetch_all(&mut tx)
//!     .await?;
//! tx.commit().await?;
//! ```

use sqlx::postgres::{PgArguments, PgRow};
use sqlx::{FromRow, Postgres, Transaction};
use std::fmt;
use tracing::debug;

use crate::types::{ExtractedValue, PgType};
use crate::{PgExtError, Result};

/// What a `FOR UPDATE` does when a selected row is already locked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockBehavior {
    /// Wait until the row is unlocked.
    #[default]
    Default,
    /// Leave locked rows out of the result.
    SkipLocked,
    /// Fail immediately.
    NoWait,
}

impl LockBehavior {
    pub fn sql_keyword(&self) -> &'static str {
        match self {
            LockBehavior::Default => "",
            LockBehavior::SkipLocked => "SKIP LOCKED",
            LockBehavior::NoWait => "NOWAIT",
        }
    }
}

/// Row-lock suffix of a SELECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockClause {
    #[default]
    None,
    ForUpdate(LockBehavior),
}

impl LockClause {
    pub fn for_update(behavior: LockBehavior) -> Self {
        LockClause::ForUpdate(behavior)
    }

    pub fn sql(&self) -> String {
        match self {
            LockClause::None => String::new(),
            LockClause::ForUpdate(LockBehavior::Default) => "FOR UPDATE".to_string(),
            LockClause::ForUpdate(behavior) => format!("FOR UPDATE {}", behavior.sql_keyword()),
        }
    }
}

impl fmt::Display for LockClause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql())
    }
}

/// A SELECT statement with its parameters and lock clause.
#[derive(Debug, Clone)]
pub struct LockedSelect {
    select: String,
    params: Vec<(ExtractedValue, PgType)>,
    lock: LockClause,
}

impl LockedSelect {
    /// Wraps a SELECT. Trailing semicolons and whitespace are dropped.
    pub fn new(sql: impl Into<String>) -> Result<Self> {
        let sql = sql.into();
        let select = sql
            .trim()
            .trim_end_matches(|c: char| c == ';' || c.is_whitespace())
            .to_string();

        let is_select = select
            .get(..6)
            .map(|head| head.eq_ignore_ascii_case("select"))
            .unwrap_or(false);
        if !is_select {
            return Err(PgExtError::Validation(
                "Row locks can only be applied to SELECT statements".to_string(),
            ));
        }

        Ok(Self {
            select,
            params: Vec::new(),
            lock: LockClause::None,
        })
    }

    pub fn lock(mut self, clause: LockClause) -> Self {
        self.lock = clause;
        self
    }

    /// Binds the next `$n` parameter.
    pub fn bind(mut self, value: impl Into<ExtractedValue>, pg_type: PgType) -> Self {
        self.params.push((value.into(), pg_type));
        self
    }

    pub fn lock_clause(&self) -> LockClause {
        self.lock
    }

    /// Final statement text. The clause goes on its own line so a trailing
    /// `--` comment in the SELECT cannot swallow it.
    pub fn sql(&self) -> String {
        match self.lock {
            LockClause::None => self.select.clone(),
            clause => format!("{}\n{}", self.select, clause.sql()),
        }
    }

    fn arguments(&self) -> Result<PgArguments> {
        let mut arguments = PgArguments::default();
        for (value, pg_type) in &self.params {
            value.bind_as(pg_type, &mut arguments)?;
        }
        Ok(arguments)
    }

    pub async fn fetch_all(&self, tx: &mut Transaction<'_, Postgres>) -> Result<Vec<PgRow>> {
        let sql = self.sql();
        debug!(sql = %sql, "Executing locked select");
        let rows = sqlx::query_with(&sql, self.arguments()?)
            .fetch_all(&mut **tx)
            .await?;
        Ok(rows)
    }

    pub async fn fetch_optional(&self, tx: &mut Transaction<'_, Postgres>) -> Result<Option<PgRow>> {
        let sql = self.sql();
        debug!(sql = %sql, "Executing locked select");
        let row = sqlx::query_with(&sql, self.arguments()?)
            .fetch_optional(&mut **tx)
            .await?;
        Ok(row)
    }

    /// Like [`fetch_all`](Self::fetch_all), mapping rows with `FromRow`.
    pub async fn fetch_all_as<T>(&self, tx: &mut Transaction<'_, Postgres>) -> Result<Vec<T>>
    where
        T: for<'r> FromRow<'r, PgRow> + Send + Unpin,
    {
        let sql = self.sql();
        debug!(sql = %sql, "Executing locked select");
        let rows = sqlx::query_as_with::<_, T, _>(&sql, self.arguments()?)
            .fetch_all(&mut **tx)
            .await?;
        Ok(rows)
    }
}
