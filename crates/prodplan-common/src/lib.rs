//! Prodplan Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, utilities, and error handling for the Prodplan workspace.
//!
//! # Overview
//!
//! This crate provides common functionality used across all workspace members:
//!
//! - **Error Handling**: the shared error type and result alias
//! - **Checksums**: SHA-256 file checksums and the errors fingerprint
//! - **Configuration**: environment-driven application configuration
//! - **Database**: connection pool factory
//! - **Logging**: tracing subscriber bootstrap
//!
//! # Example
//!
//! ```no_run
//! use prodplan_common::{Result, checksum};
//!
//! fn hash_source(path: &str) -> Result<()> {
//!     let sha = checksum::file_sha256(path)?;
//!     tracing::info!(%sha, "source checksum");
//!     Ok(())
//! }
//! ```

pub mod checksum;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{ProdplanError, Result};
