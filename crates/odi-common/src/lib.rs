//! ODI Common Library
//!
//! Shared error handling, checksums, and logging for the ODI ingestion workspace.
//!
//! - **Error Handling**: [`OdiError`] and the [`Result`] alias
//! - **Checksums**: streaming SHA-256 digests for archives and dictionaries
//! - **Types**: file digests recorded in run manifests
//! - **Logging**: `tracing` subscriber setup shared by every binary
//!
//! # Example
//!
//! ```no_run
//! use odi_common::checksum::compute_file_checksum;
//! use odi_common::types::ChecksumAlgorithm;
//!
//! fn fingerprint(path: &str) -> odi_common::Result<()> {
//!     let digest = compute_file_checksum(path, ChecksumAlgorithm::Sha256)?;
//!     tracing::info!(%digest, "archive fingerprinted");
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod checksum;
pub mod error;
pub mod logging;
pub mod types;

pub use error::{OdiError, Result};
