//! Row ingestion: delimited text to typed rows
//!
//! [`RowIngestor`] reads an extracted file lazily with the `csv` crate and
//! assigns column names positionally from the [`SchemaSpec`]. Coercion never
//! fails a row; problems become [`Violation`]s carried on the [`TypedRow`].

use crate::error::{IngestError, Result};
use crate::schema::{ColumnSpec, DataKind, SchemaSpec};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";
const SNIFF_BYTES: u64 = 8 * 1024;
const DATE_PLACEHOLDERS: &[&str] = &["0", "00000000", "0000-00-00"];

// ============================================================================
// Text decoding and delimiter detection
// ============================================================================

/// Decode bytes as UTF-8, falling back to Latin-1 when they are not valid UTF-8
pub fn decode_text(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}

/// Pick the delimiter of a sample by counting tab, pipe and comma
///
/// The first non-empty line decides; if it holds none of them the whole sample
/// is counted, and tab is used when that is inconclusive too.
pub fn detect_delimiter(sample: &[u8]) -> u8 {
    const CANDIDATES: [u8; 3] = [b'\t', b'|', b','];

    let best = |bytes: &[u8]| -> Option<u8> {
        CANDIDATES
            .iter()
            .map(|&d| (d, bytes.iter().filter(|&&b| b == d).count()))
            .filter(|&(_, n)| n > 0)
            // max_by_key keeps the last maximum; reverse so earlier candidates win ties
            .rev()
            .max_by_key(|&(_, n)| n)
            .map(|(d, _)| d)
    };

    let first_line = sample
        .split(|&b| b == b'\n')
        .find(|line| line.iter().any(|b| !b.is_ascii_whitespace()));

    first_line
        .and_then(&best)
        .or_else(|| best(sample))
        .unwrap_or(b'\t')
}

// ============================================================================
// Records, values and violations
// ============================================================================

/// Fields of one source record, before typing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    /// 1-based line in the source file where the record starts
    pub line: u64,
    pub fields: Vec<String>,
}

/// Where a row came from
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Provenance {
    pub archive: String,
    pub file: String,
}

impl Provenance {
    pub fn new(archive: impl Into<String>, file: impl Into<String>) -> Self {
        Self {
            archive: archive.into(),
            file: file.into(),
        }
    }
}

/// A coerced field value
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypedValue {
    Text(String),
    Integer(i64),
    Date(NaiveDate),
    /// Enumerated value, kept verbatim
    Code(String),
    Null,
    /// Raw text that could not be coerced to the column's kind
    Invalid(String),
}

impl TypedValue {
    pub fn is_null(&self) -> bool {
        matches!(self, TypedValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            TypedValue::Text(s) | TypedValue::Code(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            TypedValue::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            TypedValue::Date(d) => Some(*d),
            _ => None,
        }
    }

    /// Text rendering for row-delimited outputs; invalid values render raw
    pub fn render(&self) -> String {
        match self {
            TypedValue::Text(s) | TypedValue::Code(s) | TypedValue::Invalid(s) => s.clone(),
            TypedValue::Integer(n) => n.to_string(),
            TypedValue::Date(d) => d.format("%Y-%m-%d").to_string(),
            TypedValue::Null => String::new(),
        }
    }
}

/// Kind of data-quality defect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    LengthMismatch,
    TypeCoercionFailure,
    CodeNotRecognized,
    DateUnparseable,
    MaxLengthExceeded,
}

impl ViolationKind {
    pub const ALL: [ViolationKind; 5] = [
        ViolationKind::LengthMismatch,
        ViolationKind::TypeCoercionFailure,
        ViolationKind::CodeNotRecognized,
        ViolationKind::DateUnparseable,
        ViolationKind::MaxLengthExceeded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationKind::LengthMismatch => "length_mismatch",
            ViolationKind::TypeCoercionFailure => "type_coercion_failure",
            ViolationKind::CodeNotRecognized => "code_not_recognized",
            ViolationKind::DateUnparseable => "date_unparseable",
            ViolationKind::MaxLengthExceeded => "max_length_exceeded",
        }
    }
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One defect, attributed to exactly one column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub column: String,
    pub kind: ViolationKind,
    /// Offending raw text
    pub raw: String,
    pub detail: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.column, self.kind)?;
        if !self.raw.is_empty() {
            write!(f, " [{}]", self.raw)?;
        }
        Ok(())
    }
}

/// A record after naming and coercion
///
/// Immutable once built; accessors only.
#[derive(Debug, Clone)]
pub struct TypedRow {
    schema: Arc<SchemaSpec>,
    provenance: Arc<Provenance>,
    line: u64,
    values: Vec<TypedValue>,
    violations: Vec<Violation>,
    placeholder_dates: Vec<usize>,
    missing_optional: Vec<usize>,
}

impl TypedRow {
    pub fn schema(&self) -> &SchemaSpec {
        &self.schema
    }

    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    /// 1-based line in the source file
    pub fn line(&self) -> u64 {
        self.line
    }

    /// Values in schema column order
    pub fn values(&self) -> &[TypedValue] {
        &self.values
    }

    /// Value of a column by name, matched case-insensitively
    pub fn get(&self, name: &str) -> Option<&TypedValue> {
        self.schema.index_of(name).map(|i| &self.values[i])
    }

    /// Column/value pairs in schema order
    pub fn iter(&self) -> impl Iterator<Item = (&ColumnSpec, &TypedValue)> {
        self.schema.columns().iter().zip(self.values.iter())
    }

    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }

    pub fn has_violations(&self) -> bool {
        !self.violations.is_empty()
    }

    /// Positions of date columns that held a placeholder such as `00000000`
    pub fn placeholder_dates(&self) -> &[usize] {
        &self.placeholder_dates
    }

    /// Positions of optional trailing columns the record ended before
    pub fn missing_optional(&self) -> &[usize] {
        &self.missing_optional
    }
}

// ============================================================================
// Options
// ============================================================================

/// How the first record of a source file is treated
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum HeaderPolicy {
    /// Files are headerless; every record is data
    #[default]
    Absent,
    /// The first record is a header and is discarded
    Skip,
}

impl FromStr for HeaderPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "absent" | "none" | "false" | "0" => Ok(HeaderPolicy::Absent),
            "skip" | "present" | "true" | "1" => Ok(HeaderPolicy::Skip),
            other => Err(format!("Invalid header policy: {other}")),
        }
    }
}

impl fmt::Display for HeaderPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderPolicy::Absent => write!(f, "absent"),
            HeaderPolicy::Skip => write!(f, "skip"),
        }
    }
}

/// Per-run reading options
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReadOptions {
    /// Field delimiter; detected per file when unset
    pub delimiter: Option<u8>,
    pub header: HeaderPolicy,
    /// Treat empty string values as null
    pub blank_as_null: bool,
}

// ============================================================================
// Raw record reading
// ============================================================================

/// Lazy, finite producer of [`RawRecord`]s for one file
pub struct RawRecords {
    path: PathBuf,
    inner: csv::ByteRecordsIntoIter<BufReader<File>>,
    skip_first: bool,
    first: bool,
    done: bool,
}

impl RawRecords {
    /// Open a delimited file
    pub fn open(path: &Path, options: &ReadOptions) -> Result<Self> {
        let mut file = File::open(path).map_err(|e| IngestError::read(path, e))?;

        let delimiter = match options.delimiter {
            Some(d) => d,
            None => {
                let mut sample = Vec::new();
                (&mut file)
                    .take(SNIFF_BYTES)
                    .read_to_end(&mut sample)
                    .map_err(|e| IngestError::read(path, e))?;
                file.seek(SeekFrom::Start(0)).map_err(|e| IngestError::read(path, e))?;
                detect_delimiter(&sample)
            },
        };
        debug!(path = %path.display(), delimiter = %(delimiter as char).escape_default(), "Opening source file");

        let reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .delimiter(delimiter)
            // Free-text fields in tab-separated releases carry stray quotes
            .quoting(delimiter != b'\t')
            .from_reader(BufReader::new(file));

        Ok(Self {
            path: path.to_path_buf(),
            inner: reader.into_byte_records(),
            skip_first: options.header == HeaderPolicy::Skip,
            first: true,
            done: false,
        })
    }
}

impl Iterator for RawRecords {
    type Item = Result<RawRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let record = match self.inner.next() {
                None => {
                    self.done = true;
                    return None;
                },
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(IngestError::read(&self.path, e)));
                },
                Some(Ok(record)) => record,
            };

            let first = std::mem::replace(&mut self.first, false);
            if first && self.skip_first {
                continue;
            }

            let line = record.position().map(|p| p.line()).unwrap_or_default();
            let fields = record
                .iter()
                .enumerate()
                .map(|(i, field)| {
                    if first && i == 0 {
                        decode_text(field)
                    } else {
                        decode_field(field)
                    }
                })
                .collect();
            return Some(Ok(RawRecord { line, fields }));
        }
    }
}

fn decode_field(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}

// ============================================================================
// Typing
// ============================================================================

/// Maps raw records of one dataset to [`TypedRow`]s
#[derive(Debug, Clone)]
pub struct RowIngestor {
    schema: Arc<SchemaSpec>,
    options: ReadOptions,
}

impl RowIngestor {
    pub fn new(schema: Arc<SchemaSpec>, options: ReadOptions) -> Self {
        Self { schema, options }
    }

    pub fn schema(&self) -> &Arc<SchemaSpec> {
        &self.schema
    }

    /// Lazily read and type every record of `path`
    pub fn open(&self, path: &Path, provenance: Provenance) -> Result<TypedRows> {
        Ok(TypedRows {
            records: RawRecords::open(path, &self.options)?,
            ingestor: self.clone(),
            provenance: Arc::new(provenance),
        })
    }

    /// Name and coerce one record
    pub fn type_record(&self, record: RawRecord, provenance: &Arc<Provenance>) -> TypedRow {
        let columns = self.schema.columns();
        let expected = columns.len();
        let found = record.fields.len();
        let mut violations = Vec::new();
        let mut placeholder_dates = Vec::new();
        let mut missing_optional = Vec::new();

        if found < expected && columns[found..].iter().all(|c| c.optional) {
            missing_optional.extend(found..expected);
        } else if found < expected {
            violations.push(Violation {
                column: columns[found].name.clone(),
                kind: ViolationKind::LengthMismatch,
                raw: String::new(),
                detail: format!("expected {expected} fields, found {found}"),
            });
        } else if found > expected {
            if let Some(last) = columns.last() {
                violations.push(Violation {
                    column: last.name.clone(),
                    kind: ViolationKind::LengthMismatch,
                    raw: record.fields[expected..].join("\t"),
                    detail: format!("expected {expected} fields, found {found}"),
                });
            }
        }

        let values = columns
            .iter()
            .map(|column| match record.fields.get(column.position) {
                Some(raw) => {
                    let (value, placeholder) = self.coerce(column, raw, &mut violations);
                    if placeholder {
                        placeholder_dates.push(column.position);
                    }
                    value
                },
                None => TypedValue::Null,
            })
            .collect();

        TypedRow {
            schema: Arc::clone(&self.schema),
            provenance: Arc::clone(provenance),
            line: record.line,
            values,
            violations,
            placeholder_dates,
            missing_optional,
        }
    }

    /// Coerce one field; the flag is set when a date placeholder was nulled
    ///
    /// Date columns declared as `CHAR(n)` are not width-checked, since a parsed
    /// or placeholder date carries no length constraint of its own.
    fn coerce(&self, column: &ColumnSpec, raw: &str, violations: &mut Vec<Violation>) -> (TypedValue, bool) {
        let value = raw.trim();
        let mut flag = |kind: ViolationKind, detail: String| {
            violations.push(Violation {
                column: column.name.clone(),
                kind,
                raw: raw.to_string(),
                detail,
            });
        };

        if value.is_empty() {
            return match column.data_kind {
                DataKind::String if !self.options.blank_as_null => (TypedValue::Text(String::new()), false),
                _ => (TypedValue::Null, false),
            };
        }

        let too_long = column.max_length.filter(|&max| value.chars().count() > max);

        match column.data_kind {
            DataKind::String => {
                if let Some(max) = too_long {
                    flag(ViolationKind::MaxLengthExceeded, format!("longer than {max} characters"));
                }
                (TypedValue::Text(value.to_string()), false)
            },
            DataKind::Integer => {
                if !value.bytes().all(|b| b.is_ascii_digit()) {
                    flag(ViolationKind::TypeCoercionFailure, "not an integer".to_string());
                    return (TypedValue::Invalid(raw.to_string()), false);
                }
                match value.parse::<i64>() {
                    Ok(n) => {
                        if let Some(max) = too_long {
                            flag(ViolationKind::MaxLengthExceeded, format!("more than {max} digits"));
                        }
                        (TypedValue::Integer(n), false)
                    },
                    Err(_) => {
                        flag(ViolationKind::TypeCoercionFailure, "integer out of range".to_string());
                        (TypedValue::Invalid(raw.to_string()), false)
                    },
                }
            },
            DataKind::Date => {
                if DATE_PLACEHOLDERS.contains(&value) {
                    return (TypedValue::Null, true);
                }
                let parsed = self
                    .schema
                    .date_formats()
                    .iter()
                    .find_map(|format| NaiveDate::parse_from_str(value, format).ok());
                match parsed {
                    Some(date) => (TypedValue::Date(date), false),
                    None => {
                        flag(
                            ViolationKind::DateUnparseable,
                            format!("no match for formats {:?}", self.schema.date_formats()),
                        );
                        (TypedValue::Invalid(raw.to_string()), false)
                    },
                }
            },
            DataKind::Coded => {
                if let Some(max) = too_long {
                    flag(ViolationKind::MaxLengthExceeded, format!("longer than {max} characters"));
                }
                if !column.accepts_code(value) {
                    flag(ViolationKind::CodeNotRecognized, "not a documented code".to_string());
                }
                (TypedValue::Code(value.to_string()), false)
            },
        }
    }
}

/// Lazy sequence of typed rows for one file
pub struct TypedRows {
    records: RawRecords,
    ingestor: RowIngestor,
    provenance: Arc<Provenance>,
}

impl TypedRows {
    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }
}

impl Iterator for TypedRows {
    type Item = Result<TypedRow>;

    fn next(&mut self) -> Option<Self::Item> {
        let record = self.records.next()?;
        Some(record.map(|r| self.ingestor.type_record(r, &self.provenance)))
    }
}
