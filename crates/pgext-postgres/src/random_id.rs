//! Jittered random-id generator: a sequence plus a PL/pgSQL function.
//!
//! The generated function takes an advisory lock, reads the sequence, adds a
//! uniformly random increment in `[min, max]`, stores the result back into
//! the sequence and returns it. Ids therefore grow monotonically but with
//! unpredictable gaps, and concurrent callers never see the same id.
//!
//! The lock key is the fixed [`RANDOM_ID_LOCK`], so every generator in a
//! database serializes against every other one. The lock is session scoped:
//! an error between acquire and release leaves it held until the session
//! ends.

use crate::validation::{quote_identifier, quote_literal, validate_identifier_part};
use crate::{PgExtError, Result};

/// Server-side advisory lock identified by a 64-bit key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AdvisoryLock {
    key: i64,
}

/// Lock shared by all random-id generators, so every generator in a database
/// serialises on it. The lock is session-level: if the generator body errors
/// after acquiring it, it stays held until the session ends.
pub const RANDOM_ID_LOCK: AdvisoryLock = AdvisoryLock::new(1);

impl AdvisoryLock {
    pub const fn new(key: i64) -> Self {
        Self { key }
    }

    pub fn key(&self) -> i64 {
        self.key
    }

    /// Call expression that blocks until the lock is held.
    /// Use after `SELECT` or, inside PL/pgSQL, `PERFORM`.
    pub fn acquire_sql(&self) -> String {
        format!("pg_advisory_lock({})", self.key)
    }

    pub fn release_sql(&self) -> String {
        format!("pg_advisory_unlock({})", self.key)
    }
}

/// Parameters of one generator: `<table>_<pk>_seq` plus `<table>_random_id_generator()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RandomIdSequenceSpec {
    table: String,
    pk_column: String,
    start_value: i64,
    min_increment: i32,
    max_increment: i32,
}

impl RandomIdSequenceSpec {
    /// Validates names and increment bounds.
    ///
    /// `min_increment` must be at least 1 so ids stay unique, and must not
    /// exceed `max_increment`.
    pub fn new(
        table: impl Into<String>,
        pk_column: impl Into<String>,
        start_value: i64,
        min_increment: i32,
        max_increment: i32,
    ) -> Result<Self> {
        let spec = Self {
            table: table.into(),
            pk_column: pk_column.into(),
            start_value,
            min_increment,
            max_increment,
        };

        validate_identifier_part(&spec.table)?;
        validate_identifier_part(&spec.pk_column)?;
        validate_identifier_part(&spec.sequence_name())?;
        validate_identifier_part(&spec.function_name())?;

        if min_increment < 1 {
            return Err(PgExtError::Validation(format!(
                "Minimum increment must be at least 1, got {}",
                min_increment
            )));
        }
        if min_increment > max_increment {
            return Err(PgExtError::Validation(format!(
                "Minimum increment {} exceeds maximum increment {}",
                min_increment, max_increment
            )));
        }

        Ok(spec)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn pk_column(&self) -> &str {
        &self.pk_column
    }

    pub fn start_value(&self) -> i64 {
        self.start_value
    }

    pub fn increment_range(&self) -> (i32, i32) {
        (self.min_increment, self.max_increment)
    }

    pub fn sequence_name(&self) -> String {
        sequence_name(&self.table, &self.pk_column)
    }

    pub fn function_name(&self) -> String {
        function_name(&self.table)
    }

    /// Column default that calls the generator, e.g. `"Users_random_id_generator"()`.
    pub fn default_value_sql(&self) -> String {
        default_value_sql(&self.table)
    }

    /// Idempotent script that creates the sequence if missing and
    /// (re)creates the generator function.
    pub fn create_sql(&self) -> String {
        let sequence = self.sequence_name();
        let sequence_ident = quote_identifier(&sequence);
        let sequence_regclass = quote_literal(&sequence_ident);
        let function_ident = quote_identifier(&self.function_name());
        let span = i64::from(self.max_increment) - i64::from(self.min_increment) + 1;
        // Ascending sequences default to MINVALUE 1, which rejects lower starts.
        let min_value = self.start_value.min(1);

        format!(
            r#"DO $$
BEGIN
    IF NOT EXISTS (SELECT 1 FROM pg_class WHERE relkind = 'S' AND relname = {sequence_name}) THEN
        CREATE SEQUENCE {sequence_ident} MINVALUE {min_value} START WITH {start};
        PERFORM setval({sequence_regclass}, {start}, true);
    END IF;
END
$$;

CREATE OR REPLACE FUNCTION {function_ident}()
RETURNS bigint
LANGUAGE plpgsql
AS $$
DECLARE
    current_value bigint;
    increment_value bigint;
    new_value bigint;
BEGIN
    PERFORM {acquire};

    current_value := nextval({sequence_regclass}) - 1;
    increment_value := floor(random() * {span})::bigint + {min};
    new_value := current_value + increment_value;
    PERFORM setval({sequence_regclass}, new_value, true);

    PERFORM {release};

    RETURN new_value;
END;
$$;
"#,
            sequence_name = quote_literal(&sequence),
            sequence_ident = sequence_ident,
            sequence_regclass = sequence_regclass,
            start = self.start_value,
            min_value = min_value,
            function_ident = function_ident,
            acquire = RANDOM_ID_LOCK.acquire_sql(),
            release = RANDOM_ID_LOCK.release_sql(),
            span = span,
            min = self.min_increment,
        )
    }

    /// Drops the function and then the sequence, each only if it exists.
    pub fn drop_sql(&self) -> String {
        let sequence = self.sequence_name();
        let function = self.function_name();

        format!(
            r#"DO $$
BEGIN
    IF EXISTS (SELECT 1 FROM pg_proc WHERE proname = {function_name}) THEN
        DROP FUNCTION {function_ident}();
    END IF;
    IF EXISTS (SELECT 1 FROM pg_class WHERE relkind = 'S' AND relname = {sequence_name}) THEN
        DROP SEQUENCE {sequence_ident};
    END IF;
END
$$;
"#,
            function_name = quote_literal(&function),
            function_ident = quote_identifier(&function),
            sequence_name = quote_literal(&sequence),
            sequence_ident = quote_identifier(&sequence),
        )
    }
}

pub fn sequence_name(table: &str, pk_column: &str) -> String {
    format!("{}_{}_seq", table, pk_column)
}

pub fn function_name(table: &str) -> String {
    format!("{}_random_id_generator", table)
}

pub fn default_value_sql(table: &str) -> String {
    format!("{}()", quote_identifier(&function_name(table)))
}
