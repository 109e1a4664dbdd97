//! Opsfeed Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared error handling, identifier validation and logging setup used by
//! every opsfeed workspace member.
//!
//! # Example
//!
//! ```no_run
//! use opsfeed_common::{ident, Result};
//!
//! fn staging_table(name: &str) -> Result<&str> {
//!     ident::validate_identifier(name)
//! }
//! ```

pub mod error;
pub mod ident;
pub mod logging;

// Re-export commonly used types
pub use error::{FeedError, Result};
