//! Column specifications parsed from a dataset's schema dictionary

mod parser;

pub use parser::SchemaDictionaryParser;

use crate::error::SchemaParseError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Logical type of a column as documented in the dictionary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    String,
    Integer,
    Date,
    Coded,
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DataKind::String => "string",
            DataKind::Integer => "integer",
            DataKind::Date => "date",
            DataKind::Coded => "coded",
        };
        write!(f, "{s}")
    }
}

/// One documented column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    /// Column name exactly as written in the dictionary
    pub name: String,
    /// Zero-based position in a source record
    pub position: usize,
    pub data_kind: DataKind,
    pub max_length: Option<usize>,
    /// Upper-cased valid codes; present only for coded columns
    pub allowed_codes: Option<BTreeSet<String>>,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub description: String,
    /// Older releases may end a record before this column
    #[serde(skip_serializing_if = "is_false", default)]
    pub optional: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl ColumnSpec {
    /// Name used for this column in processed outputs: lowercase, with runs of
    /// non-alphanumeric characters collapsed to `_`
    pub fn output_name(&self) -> String {
        let mut out = String::with_capacity(self.name.len());
        for ch in self.name.trim().chars() {
            if ch.is_ascii_alphanumeric() {
                out.push(ch.to_ascii_lowercase());
            } else if !out.ends_with('_') {
                out.push('_');
            }
        }
        let trimmed = out.trim_matches('_');
        if trimmed.is_empty() {
            "column".to_string()
        } else {
            trimmed.to_string()
        }
    }

    /// Whether `value` is a documented code, compared case-insensitively
    pub fn accepts_code(&self, value: &str) -> bool {
        match &self.allowed_codes {
            Some(codes) => codes.contains(&value.to_ascii_uppercase()),
            None => true,
        }
    }
}

/// Ordered column specification for one dataset
///
/// Loaded once per run and shared read-only between workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaSpec {
    dataset: String,
    columns: Vec<ColumnSpec>,
    /// chrono format strings tried in order for date columns
    date_formats: Vec<String>,
}

impl SchemaSpec {
    /// Build a specification, checking that positions run 0..n without gaps
    pub fn new(
        dataset: impl Into<String>,
        columns: Vec<ColumnSpec>,
        date_formats: Vec<String>,
    ) -> std::result::Result<Self, SchemaParseError> {
        let mut seen = BTreeSet::new();
        for (index, column) in columns.iter().enumerate() {
            if column.position != index {
                return Err(SchemaParseError::document(
                    "FIELDS",
                    format!(
                        "column '{}' has position {} but is listed at position {}",
                        column.name, column.position, index
                    ),
                ));
            }
            if !seen.insert(column.output_name()) {
                return Err(SchemaParseError::document(
                    "FIELDS",
                    format!("duplicate column name '{}'", column.name),
                ));
            }
        }

        Ok(Self {
            dataset: dataset.into(),
            columns,
            date_formats,
        })
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn date_formats(&self) -> &[String] {
        &self.date_formats
    }

    /// Position of a column, matched case-insensitively
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name.eq_ignore_ascii_case(name.trim()))
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.index_of(name).map(|i| &self.columns[i])
    }

    /// Number of columns of each kind, used in run summaries
    pub fn kind_counts(&self) -> Vec<(DataKind, usize)> {
        [DataKind::String, DataKind::Integer, DataKind::Date, DataKind::Coded]
            .into_iter()
            .map(|kind| (kind, self.columns.iter().filter(|c| c.data_kind == kind).count()))
            .filter(|(_, n)| *n > 0)
            .collect()
    }
}
