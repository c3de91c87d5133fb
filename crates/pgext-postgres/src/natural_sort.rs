//! Natural sort keys.
//!
//! `get_natural_sort_key(text)` splits its input into digit and non-digit
//! runs and left-pads each digit run with zeros to width 10, so that plain
//! text ordering of the key orders `item2` before `item10`.

use crate::validation::{quote_identifier, validate_identifier_part};
use crate::Result;

pub const NATURAL_SORT_FUNCTION: &str = "get_natural_sort_key";

/// Width numeric runs are padded (or truncated) to.
pub const NUMERIC_RUN_WIDTH: usize = 10;

pub fn create_function_sql() -> String {
    format!(
        r#"CREATE OR REPLACE FUNCTION {name}(input_text TEXT)
RETURNS TEXT
LANGUAGE sql
IMMUTABLE
AS $$
  WITH tokens AS (
    SELECT regexp_matches(input_text, '(\d+|\D+)', 'g') AS parts
  ),
  padded AS (
    SELECT (
      CASE
        WHEN parts[1] ~ '^\d+$'
        THEN LPAD(parts[1], {width}, '0')
        ELSE parts[1]
      END
    ) AS chunk
    FROM tokens
  )
  SELECT string_agg(chunk, '')
  FROM padded;
$$;
"#,
        name = NATURAL_SORT_FUNCTION,
        width = NUMERIC_RUN_WIDTH,
    )
}

pub fn drop_function_sql() -> String {
    format!(
        r#"DO $$
BEGIN
    IF EXISTS (SELECT 1 FROM pg_proc WHERE proname = '{name}') THEN
        DROP FUNCTION {name}(TEXT);
    END IF;
END
$$;
"#,
        name = NATURAL_SORT_FUNCTION,
    )
}

/// Expression for a stored generated column keyed on `source_column`.
pub fn computed_column_sql(source_column: &str) -> Result<String> {
    validate_identifier_part(source_column)?;
    Ok(format!(
        "{}({})::text",
        NATURAL_SORT_FUNCTION,
        quote_identifier(source_column)
    ))
}

/// Computes in Rust the key the SQL function returns.
///
/// Returns `None` for empty input, where the SQL function yields NULL.
/// Digit runs longer than the pad width are cut to their first ten
/// characters, as `lpad` does.
pub fn natural_sort_key(input: &str) -> Option<String> {
    if input.is_empty() {
        return None;
    }

    let mut key = String::with_capacity(input.len() + NUMERIC_RUN_WIDTH);
    let mut run = String::new();
    let mut run_is_digits = false;

    for ch in input.chars() {
        let is_digit = ch.is_ascii_digit();
        if !run.is_empty() && is_digit != run_is_digits {
            push_run(&mut key, &run, run_is_digits);
            run.clear();
        }
        run_is_digits = is_digit;
        run.push(ch);
    }
    push_run(&mut key, &run, run_is_digits);

    Some(key)
}

fn push_run(key: &mut String, run: &str, is_digits: bool) {
    if !is_digits {
        key.push_str(run);
    } else if run.len() >= NUMERIC_RUN_WIDTH {
        key.push_str(&run[..NUMERIC_RUN_WIDTH]);
    } else {
        key.extend(std::iter::repeat('0').take(NUMERIC_RUN_WIDTH - run.len()));
        key.push_str(run);
    }
}
