//! Error types for the ingestion pipeline
//!
//! Variants follow the pipeline's failure taxonomy. Whether an error is fatal
//! depends on where it surfaces: configuration and schema errors abort the run,
//! archive-level errors skip one archive, output errors skip one output.
//! Row-level data-quality problems are never errors; they are
//! [`Violation`](crate::reader::Violation)s carried on the row.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result type alias for ingestion operations
pub type Result<T> = std::result::Result<T, IngestError>;

/// A dictionary document that could not be turned into a column specification
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Schema dictionary parse error in {section}{}: {message}", .line.map(|l| format!(" at line {l}")).unwrap_or_default())]
pub struct SchemaParseError {
    /// 1-based line number, when the problem is tied to one line
    pub line: Option<usize>,
    /// Section of the document being parsed, e.g. "FIELDS"
    pub section: String,
    pub message: String,
}

impl SchemaParseError {
    pub fn at_line(line: usize, section: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            line: Some(line),
            section: section.into(),
            message: message.into(),
        }
    }

    pub fn document(section: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            line: None,
            section: section.into(),
            message: message.into(),
        }
    }
}

/// Ingestion pipeline error
#[derive(Error, Debug)]
pub enum IngestError {
    /// Invalid flags or missing directories; raised before any side effect
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    SchemaParse(#[from] SchemaParseError),

    /// A member path would land outside the staging directory
    #[error("Unsafe member '{member}' in archive '{archive}': path escapes the staging directory")]
    UnsafeArchiveMember { archive: String, member: String },

    /// Corrupt archive, unsupported container, or unreadable member
    #[error("Extraction failed for '{archive}': {message}")]
    Extraction { archive: String, message: String },

    /// An extracted file could not be read as delimited text
    #[error("Failed to read '{}': {message}", .path.display())]
    Read { path: PathBuf, message: String },

    /// A processed output or manifest could not be written
    #[error("Failed to write '{}': {message}", .path.display())]
    Output { path: PathBuf, message: String },

    #[error("Run interrupted")]
    Interrupted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Common(#[from] odi_common::OdiError),
}

impl IngestError {
    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create an extraction error for an archive
    pub fn extraction(archive: impl Into<String>, msg: impl ToString) -> Self {
        Self::Extraction {
            archive: archive.into(),
            message: msg.to_string(),
        }
    }

    /// Create a read error for an extracted file
    pub fn read(path: &Path, msg: impl ToString) -> Self {
        Self::Read {
            path: path.to_path_buf(),
            message: msg.to_string(),
        }
    }

    /// Create an output error for a file being written
    pub fn output(path: &Path, msg: impl ToString) -> Self {
        Self::Output {
            path: path.to_path_buf(),
            message: msg.to_string(),
        }
    }

    /// Stable tag recorded in the run manifest
    pub fn kind(&self) -> &'static str {
        match self {
            IngestError::Configuration(_) => "configuration_error",
            IngestError::SchemaParse(_) => "schema_parse_error",
            IngestError::UnsafeArchiveMember { .. } => "unsafe_archive_member",
            IngestError::Extraction { .. } => "extraction_error",
            IngestError::Read { .. } => "read_error",
            IngestError::Output { .. } => "output_error",
            IngestError::Interrupted => "interrupted",
            IngestError::Io(_) | IngestError::Common(odi_common::OdiError::Io(_)) => "io_error",
            IngestError::Serialization(_) => "serialization_error",
            IngestError::Common(_) => "common_error",
        }
    }

    /// Whether the error aborts the whole run rather than one archive or output
    pub fn is_fatal(&self) -> bool {
        matches!(self, IngestError::Configuration(_) | IngestError::SchemaParse(_))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_parse_error_names_line() {
        let err = SchemaParseError::at_line(14, "FIELDS", "malformed column row");
        assert_eq!(
            err.to_string(),
            "Schema dictionary parse error in FIELDS at line 14: malformed column row"
        );

        let err = SchemaParseError::document("FIELDS", "no column rows found");
        assert_eq!(err.to_string(), "Schema dictionary parse error in FIELDS: no column rows found");
    }

    #[test]
    fn test_kind_and_fatality() {
        let err = IngestError::UnsafeArchiveMember {
            archive: "a.zip".into(),
            member: "../../etc/passwd".into(),
        };
        assert_eq!(err.kind(), "unsafe_archive_member");
        assert!(!err.is_fatal());

        let err: IngestError = SchemaParseError::document("FIELDS", "empty").into();
        assert_eq!(err.kind(), "schema_parse_error");
        assert!(err.is_fatal());
        assert!(IngestError::configuration("missing dir").is_fatal());
    }
}
