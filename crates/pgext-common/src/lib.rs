//! Common utilities for pgext
//!
//! This crate provides the error type shared by every pgext crate.

pub mod error;

pub use error::{PgExtError, Result};
