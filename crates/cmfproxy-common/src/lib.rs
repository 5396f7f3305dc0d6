//! CMF Proxy Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared logging setup, error types and bundle integrity helpers used by
//! the `cmfproxy` workspace members.
//!
//! # Example
//!
//! ```no_run
//! use cmfproxy_common::checksum::{sha256_file, verify_sidecar};
//!
//! fn check(path: &std::path::Path) -> cmfproxy_common::Result<()> {
//!     let digest = sha256_file(path)?;
//!     verify_sidecar(path, &digest)?;
//!     Ok(())
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{CommonError, Result};
