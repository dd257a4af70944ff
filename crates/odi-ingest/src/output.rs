//! Processed table writers
//!
//! Rows are streamed into `<name>.partial` and renamed into place on
//! [`TableWriter::finish`]. A run that stops early leaves only the partial
//! file behind.

use crate::error::{IngestError, Result};
use crate::reader::{TypedRow, TypedValue};
use crate::schema::{DataKind, SchemaSpec};
use arrow::array::{ArrayRef, Date32Builder, Int64Builder, StringBuilder};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use chrono::Datelike;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

/// Rows buffered per Parquet record batch
pub const BATCH_SIZE: usize = 8192;

/// Days from 0001-01-01 to 1970-01-01
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

/// Columns appended after the schema columns
pub const PROVENANCE_COLUMNS: [&str; 3] = ["source_archive", "source_file", "violations"];

// ============================================================================
// Formats and kinds
// ============================================================================

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Apache Parquet
    #[default]
    #[value(alias = "parquet")]
    Columnar,
    /// Comma-separated text
    #[value(alias = "csv")]
    Text,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Columnar => "parquet",
            OutputFormat::Text => "csv",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "columnar" | "parquet" => Ok(OutputFormat::Columnar),
            "text" | "csv" => Ok(OutputFormat::Text),
            other => Err(format!("Invalid output format: {other}")),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Columnar => write!(f, "columnar"),
            OutputFormat::Text => write!(f, "text"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    PerSource,
    Combined,
}

/// A processed file as recorded in the run manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub path: PathBuf,
    pub kind: OutputKind,
    pub format: OutputFormat,
    pub rows: u64,
    /// False when the file was left as `.partial`
    pub complete: bool,
}

// ============================================================================
// Paths
// ============================================================================

/// Per-source output bases for the staged members of one archive, in member order
///
/// Each base is `<processed>/<archive stem>__<file stem>_processed` without
/// extension. Members sharing a file stem are named after their full member
/// path instead, and any name still taken gets a numeric suffix, so no two
/// sources of an archive share an output file.
pub fn per_source_bases(processed_dir: &Path, archive_stem: &str, members: &[&str]) -> Vec<PathBuf> {
    let stems: Vec<String> = members
        .iter()
        .map(|member| {
            Path::new(member)
                .file_stem()
                .map(|s| sanitize_name(&s.to_string_lossy()))
                .unwrap_or_else(|| "source".to_string())
        })
        .collect();

    let mut used = HashSet::new();
    members
        .iter()
        .zip(&stems)
        .map(|(member, stem)| {
            let shared = stems.iter().filter(|other| *other == stem).count() > 1;
            let name = if shared { sanitize_name(member) } else { stem.clone() };
            let mut candidate = name.clone();
            let mut n = 2;
            while !used.insert(candidate.clone()) {
                candidate = format!("{name}_{n}");
                n += 1;
            }
            processed_dir.join(format!("{archive_stem}__{candidate}_processed"))
        })
        .collect()
}

fn sanitize_name(name: &str) -> String {
    name.trim_matches('/')
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// `<processed>/<combined stem>`, without extension
pub fn combined_base(processed_dir: &Path, combined_stem: &str) -> PathBuf {
    processed_dir.join(combined_stem)
}

fn with_added_extension(base: &Path, ext: &str) -> PathBuf {
    let mut name = base.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(ext);
    base.with_file_name(name)
}

/// In-progress location of an output file
pub fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    path.with_file_name(name)
}

fn violations_text(row: &TypedRow) -> String {
    row.violations()
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Header names for processed outputs
pub fn output_column_names(schema: &SchemaSpec) -> Vec<String> {
    schema
        .columns()
        .iter()
        .map(|c| c.output_name())
        .chain(PROVENANCE_COLUMNS.iter().map(|s| s.to_string()))
        .collect()
}

// ============================================================================
// Writers
// ============================================================================

/// Streaming sink for typed rows
pub trait TableWriter: Send {
    fn write_row(&mut self, row: &TypedRow) -> Result<()>;

    fn rows_written(&self) -> u64;

    /// Final path the table is renamed to on success
    fn path(&self) -> &Path;

    fn format(&self) -> OutputFormat;

    /// Flush and move the table into place
    fn finish(self: Box<Self>) -> Result<u64>;
}

/// Open a writer for `base` plus the format's extension
///
/// When a Parquet writer cannot be created the table is written as CSV.
pub fn create_writer(format: OutputFormat, base: &Path, schema: &SchemaSpec) -> Result<Box<dyn TableWriter>> {
    if let Some(parent) = base.parent() {
        fs::create_dir_all(parent).map_err(|e| IngestError::output(parent, e))?;
    }
    match format {
        OutputFormat::Text => Ok(Box::new(CsvTableWriter::create(
            &with_added_extension(base, OutputFormat::Text.extension()),
            schema,
        )?)),
        OutputFormat::Columnar => {
            let path = with_added_extension(base, OutputFormat::Columnar.extension());
            match ParquetTableWriter::create(&path, schema) {
                Ok(writer) => Ok(Box::new(writer)),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Parquet writer unavailable, writing CSV instead");
                    let fallback = with_added_extension(base, OutputFormat::Text.extension());
                    Ok(Box::new(CsvTableWriter::create(&fallback, schema)?))
                },
            }
        },
    }
}

/// CSV output with raw values kept in place
pub struct CsvTableWriter {
    path: PathBuf,
    partial: PathBuf,
    writer: csv::Writer<File>,
    rows: u64,
}

impl CsvTableWriter {
    pub fn create(path: &Path, schema: &SchemaSpec) -> Result<Self> {
        let partial = partial_path(path);
        let mut writer = csv::Writer::from_path(&partial).map_err(|e| IngestError::output(path, e))?;
        writer
            .write_record(output_column_names(schema))
            .map_err(|e| IngestError::output(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            partial,
            writer,
            rows: 0,
        })
    }
}

impl TableWriter for CsvTableWriter {
    fn write_row(&mut self, row: &TypedRow) -> Result<()> {
        let provenance = row.provenance();
        let record = row
            .values()
            .iter()
            .map(TypedValue::render)
            .chain([provenance.archive.clone(), provenance.file.clone(), violations_text(row)]);
        self.writer
            .write_record(record)
            .map_err(|e| IngestError::output(&self.path, e))?;
        self.rows += 1;
        Ok(())
    }

    fn rows_written(&self) -> u64 {
        self.rows
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn format(&self) -> OutputFormat {
        OutputFormat::Text
    }

    fn finish(mut self: Box<Self>) -> Result<u64> {
        self.writer.flush().map_err(|e| IngestError::output(&self.path, e))?;
        fs::rename(&self.partial, &self.path).map_err(|e| IngestError::output(&self.path, e))?;
        info!(path = %self.path.display(), rows = self.rows, "Wrote CSV table");
        Ok(self.rows)
    }
}

enum ColumnBuffer {
    Utf8(StringBuilder),
    Int64(Int64Builder),
    Date32(Date32Builder),
}

impl ColumnBuffer {
    fn for_kind(kind: DataKind) -> Self {
        match kind {
            DataKind::String | DataKind::Coded => ColumnBuffer::Utf8(StringBuilder::new()),
            DataKind::Integer => ColumnBuffer::Int64(Int64Builder::new()),
            DataKind::Date => ColumnBuffer::Date32(Date32Builder::new()),
        }
    }

    /// Append a value; values that do not fit the column's type are null
    fn append(&mut self, value: &TypedValue) {
        match (self, value) {
            (ColumnBuffer::Utf8(b), TypedValue::Text(s) | TypedValue::Code(s)) => b.append_value(s),
            (ColumnBuffer::Utf8(b), _) => b.append_null(),
            (ColumnBuffer::Int64(b), TypedValue::Integer(n)) => b.append_value(*n),
            (ColumnBuffer::Int64(b), _) => b.append_null(),
            (ColumnBuffer::Date32(b), TypedValue::Date(d)) => {
                b.append_value(d.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE)
            },
            (ColumnBuffer::Date32(b), _) => b.append_null(),
        }
    }

    fn finish(&mut self) -> ArrayRef {
        match self {
            ColumnBuffer::Utf8(b) => Arc::new(b.finish()),
            ColumnBuffer::Int64(b) => Arc::new(b.finish()),
            ColumnBuffer::Date32(b) => Arc::new(b.finish()),
        }
    }
}

/// Arrow schema for a dataset's processed table
pub fn arrow_schema(schema: &SchemaSpec) -> SchemaRef {
    let mut fields: Vec<Field> = schema
        .columns()
        .iter()
        .map(|c| {
            let data_type = match c.data_kind {
                DataKind::String | DataKind::Coded => DataType::Utf8,
                DataKind::Integer => DataType::Int64,
                DataKind::Date => DataType::Date32,
            };
            Field::new(c.output_name(), data_type, true)
        })
        .collect();
    fields.extend(PROVENANCE_COLUMNS.iter().map(|name| Field::new(*name, DataType::Utf8, false)));
    Arc::new(Schema::new(fields))
}

/// Parquet output with typed columns
///
/// Values that failed coercion are null here; their raw text is in the
/// `violations` column.
pub struct ParquetTableWriter {
    path: PathBuf,
    partial: PathBuf,
    schema: SchemaRef,
    writer: ArrowWriter<File>,
    columns: Vec<ColumnBuffer>,
    archive: StringBuilder,
    file: StringBuilder,
    violations: StringBuilder,
    buffered: usize,
    rows: u64,
}

impl ParquetTableWriter {
    pub fn create(path: &Path, schema: &SchemaSpec) -> Result<Self> {
        let arrow = arrow_schema(schema);
        let partial = partial_path(path);
        let file = File::create(&partial).map_err(|e| IngestError::output(path, e))?;
        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .set_max_row_group_size(BATCH_SIZE * 16)
            .build();
        let writer = ArrowWriter::try_new(file, Arc::clone(&arrow), Some(props)).map_err(|e| {
            let _ = fs::remove_file(&partial);
            IngestError::output(path, e)
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            partial,
            schema: arrow,
            writer,
            columns: schema.columns().iter().map(|c| ColumnBuffer::for_kind(c.data_kind)).collect(),
            archive: StringBuilder::new(),
            file: StringBuilder::new(),
            violations: StringBuilder::new(),
            buffered: 0,
            rows: 0,
        })
    }

    fn flush_batch(&mut self) -> Result<()> {
        if self.buffered == 0 {
            return Ok(());
        }
        let mut arrays: Vec<ArrayRef> = self.columns.iter_mut().map(ColumnBuffer::finish).collect();
        arrays.push(Arc::new(self.archive.finish()));
        arrays.push(Arc::new(self.file.finish()));
        arrays.push(Arc::new(self.violations.finish()));

        let batch = RecordBatch::try_new(Arc::clone(&self.schema), arrays)
            .map_err(|e| IngestError::output(&self.path, e))?;
        self.writer.write(&batch).map_err(|e| IngestError::output(&self.path, e))?;
        self.buffered = 0;
        Ok(())
    }
}

impl TableWriter for ParquetTableWriter {
    fn write_row(&mut self, row: &TypedRow) -> Result<()> {
        for (buffer, value) in self.columns.iter_mut().zip(row.values()) {
            buffer.append(value);
        }
        let provenance = row.provenance();
        self.archive.append_value(&provenance.archive);
        self.file.append_value(&provenance.file);
        self.violations.append_value(violations_text(row));

        self.buffered += 1;
        self.rows += 1;
        if self.buffered >= BATCH_SIZE {
            self.flush_batch()?;
        }
        Ok(())
    }

    fn rows_written(&self) -> u64 {
        self.rows
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn format(&self) -> OutputFormat {
        OutputFormat::Columnar
    }

    fn finish(mut self: Box<Self>) -> Result<u64> {
        self.flush_batch()?;
        let Self {
            path,
            partial,
            writer,
            rows,
            ..
        } = *self;
        writer.close().map_err(|e| IngestError::output(&path, e))?;
        fs::rename(&partial, &path).map_err(|e| IngestError::output(&path, e))?;
        info!(path = %path.display(), rows, "Wrote Parquet table");
        Ok(rows)
    }
}
