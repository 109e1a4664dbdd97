//! SQL identifier validation
//!
//! Table, column and procedure names are interpolated into SQL text, so every
//! name goes through [`validate_identifier`] first. Accepted shapes are a bare
//! identifier or a `schema.name` pair.

use crate::error::{FeedError, Result};
use regex::Regex;
use std::sync::LazyLock;

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$").unwrap()
});

/// Return the identifier unchanged if it is safe to splice into SQL
pub fn validate_identifier(name: &str) -> Result<&str> {
    if IDENTIFIER.is_match(name) {
        Ok(name)
    } else {
        Err(FeedError::InvalidIdentifier(name.to_string()))
    }
}

/// Validate every identifier in a list, stopping at the first bad one
pub fn validate_all<'a, I>(names: I) -> Result<()>
where
    I: IntoIterator<Item = &'a str>,
{
    for name in names {
        validate_identifier(name)?;
    }
    Ok(())
}
