//! Run manifest and human-readable summary
//!
//! One [`RunManifest`] is written per run, even when the run fails, so every
//! outcome is auditable from the outputs directory alone.

use crate::config::ConfigSnapshot;
use crate::error::{IngestError, Result};
use crate::extract::{MemberAction, MemberDecision};
use crate::output::OutputRecord;
use crate::validate::ValidationReport;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::info;
use uuid::Uuid;

// ============================================================================
// Status
// ============================================================================

/// Overall run outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    CompletedWithViolations,
    /// Some archives, sources or outputs failed; the rest were processed
    Partial,
    Failed,
    Interrupted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Succeeded => "succeeded",
            RunStatus::CompletedWithViolations => "completed_with_violations",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
            RunStatus::Interrupted => "interrupted",
        }
    }

    /// Process exit status for this outcome
    pub fn exit_code(&self) -> i32 {
        match self {
            RunStatus::Succeeded => 0,
            RunStatus::CompletedWithViolations => 2,
            RunStatus::Partial | RunStatus::Failed => 1,
            RunStatus::Interrupted => 130,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of one archive or one source file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    /// Some of the archive's sources failed
    Partial,
    Failed,
    Interrupted,
}

// ============================================================================
// Records
// ============================================================================

/// An error as recorded in the manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: String,
    pub message: String,
}

impl From<&IngestError> for ErrorRecord {
    fn from(err: &IngestError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// One ingested file of an archive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub member: String,
    pub staged_path: PathBuf,
    pub outcome: Outcome,
    pub rows_read: u64,
    pub rows_with_violations: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
}

/// One input archive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveRecord {
    pub name: String,
    pub label: String,
    pub path: PathBuf,
    pub sha256: Option<String>,
    pub size_bytes: Option<u64>,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
    pub decisions: Vec<MemberDecision>,
    pub sources: Vec<SourceRecord>,
}

/// Dictionary the run was validated against
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaSummary {
    pub dataset: String,
    pub dictionary: PathBuf,
    pub sha256: Option<String>,
    pub columns: usize,
    /// Column count per data kind
    pub kinds: BTreeMap<String, usize>,
    pub date_formats: Vec<String>,
}

/// Counts per pipeline stage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCounts {
    pub archives_discovered: usize,
    pub archives_extracted: usize,
    pub archives_failed: usize,
    pub files_staged: usize,
    pub files_ingested: usize,
    pub files_failed: usize,
    pub rows_read: u64,
    pub rows_with_violations: u64,
    pub rows_written: u64,
    pub rows_combined: u64,
}

/// Structured record of one pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub status: RunStatus,
    pub config: ConfigSnapshot,
    pub schema: Option<SchemaSummary>,
    pub inputs: Vec<ArchiveRecord>,
    pub outputs: Vec<OutputRecord>,
    pub counts: StageCounts,
    pub validation: ValidationReport,
    /// Errors that aborted the run
    pub errors: Vec<ErrorRecord>,
    /// Stage failures the run continued past, such as a failed combined output
    #[serde(default)]
    pub warnings: Vec<ErrorRecord>,
}

impl RunManifest {
    /// Start a manifest for a new run
    pub fn begin(config: ConfigSnapshot) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: 0,
            status: RunStatus::Failed,
            validation: ValidationReport::new(config.dataset.clone()),
            config,
            schema: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            counts: StageCounts::default(),
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn record_error(&mut self, err: &IngestError) {
        self.errors.push(ErrorRecord::from(err));
    }

    pub fn record_warning(&mut self, err: &IngestError) {
        self.warnings.push(ErrorRecord::from(err));
    }

    /// Derive the run status and stamp the finish time
    pub fn finalize(&mut self, started: Instant, interrupted: bool) {
        self.status = self.resolve_status(interrupted);
        self.validation.seal();
        self.finished_at = Some(Utc::now());
        self.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    }

    fn resolve_status(&self, interrupted: bool) -> RunStatus {
        if interrupted {
            return RunStatus::Interrupted;
        }
        let nothing_ingested = self.counts.files_ingested == 0;
        if !self.errors.is_empty() || self.inputs.is_empty() || nothing_ingested {
            return RunStatus::Failed;
        }
        let degraded = self.inputs.iter().any(|a| a.outcome != Outcome::Succeeded)
            || self.outputs.iter().any(|o| !o.complete)
            || !self.warnings.is_empty();
        if degraded {
            RunStatus::Partial
        } else if self.validation.rows_with_violations > 0 {
            RunStatus::CompletedWithViolations
        } else {
            RunStatus::Succeeded
        }
    }

    /// Human-readable summary of the run
    pub fn summary_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "ODI ingestion run {}", self.run_id);
        let _ = writeln!(out, "Status:    {}", self.status);
        let _ = writeln!(out, "Started:   {}", self.started_at.to_rfc3339());
        let _ = writeln!(out, "Duration:  {} ms", self.duration_ms);
        let _ = writeln!(out, "Format:    {}", self.config.output_format);
        match &self.schema {
            Some(schema) => {
                let _ = writeln!(
                    out,
                    "Dataset:   {} ({} columns from {})",
                    schema.dataset,
                    schema.columns,
                    schema.dictionary.display()
                );
            },
            None => {
                let _ = writeln!(out, "Dataset:   {} (schema not loaded)", self.config.dataset);
            },
        }

        let c = &self.counts;
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "Archives:  {} discovered, {} extracted, {} failed",
            c.archives_discovered, c.archives_extracted, c.archives_failed
        );
        let _ = writeln!(
            out,
            "Files:     {} staged, {} ingested, {} failed",
            c.files_staged, c.files_ingested, c.files_failed
        );
        let _ = writeln!(
            out,
            "Rows:      {} read, {} with violations, {} written, {} combined",
            c.rows_read, c.rows_with_violations, c.rows_written, c.rows_combined
        );

        if !self.inputs.is_empty() {
            let _ = writeln!(out, "\nInputs:");
            for archive in &self.inputs {
                let skipped = archive
                    .decisions
                    .iter()
                    .filter(|d| d.action == MemberAction::SkippedExisting)
                    .count();
                let _ = write!(
                    out,
                    "  {} [{:?}] {} sources",
                    archive.label,
                    archive.outcome,
                    archive.sources.len()
                );
                if skipped > 0 {
                    let _ = write!(out, ", {skipped} already extracted");
                }
                if let Some(err) = &archive.error {
                    let _ = write!(out, " - {}: {}", err.kind, err.message);
                }
                let _ = writeln!(out);
                for source in archive.sources.iter().filter(|s| s.error.is_some()) {
                    if let Some(err) = &source.error {
                        let _ = writeln!(out, "    {} - {}: {}", source.member, err.kind, err.message);
                    }
                }
            }
        }

        let report = &self.validation;
        if !report.by_kind.is_empty() {
            let _ = writeln!(out, "\nViolations by kind:");
            for (kind, n) in &report.by_kind {
                let _ = writeln!(out, "  {kind}: {n}");
            }
            let _ = writeln!(out, "\nViolations by column:");
            for (column, kinds) in &report.by_column {
                let counts: Vec<String> = kinds.iter().map(|(k, n)| format!("{k}={n}")).collect();
                let _ = write!(out, "  {}: {}", column, counts.join(", "));
                if let Some(examples) = report.examples.get(column) {
                    let shown: Vec<&str> = examples.iter().map(String::as_str).collect();
                    let _ = write!(out, " (e.g. {})", shown.join(" | "));
                }
                let _ = writeln!(out);
            }
        }
        if !report.placeholder_dates.is_empty() {
            let _ = writeln!(out, "\nPlaceholder dates read as null:");
            for (column, n) in &report.placeholder_dates {
                let _ = writeln!(out, "  {column}: {n}");
            }
        }


        let _ = writeln!(out, "\nDataset checks:");
        match report.duplicate_row_count() {
            Some(n) => {
                let _ = writeln!(out, "  duplicate rows: {n}");
            },
            None => {
                let _ = writeln!(out, "  duplicate rows: not checked ({} rows)", report.duplicate_rows.values);
            },
        }
        if let Some(id) = &report.id_check {
            let duplicates = id
                .ids
                .duplicates
                .map_or_else(|| "not checked".to_string(), |n| n.to_string());
            let _ = writeln!(out, "  {}: {} null, {} duplicate", id.column, id.nulls, duplicates);
        }
        if let Some(year) = &report.model_year {
            let _ = writeln!(out, "  {}: {} outside 1900-2100 or 9999", year.column, year.out_of_range);
        }
        for (column, n) in &report.missing_optional {
            let _ = writeln!(out, "  {column}: absent from {n} records");
        }

        if !self.outputs.is_empty() {
            let _ = writeln!(out, "\nOutputs:");
            for output in &self.outputs {
                let state = if output.complete { "complete" } else { "partial" };
                let _ = writeln!(out, "  {} ({} rows, {})", output.path.display(), output.rows, state);
            }
        }

        for (title, records) in [("Errors", &self.errors), ("Warnings", &self.warnings)] {
            if records.is_empty() {
                continue;
            }
            let _ = writeln!(out, "\n{title}:");
            for err in records {
                let _ = writeln!(out, "  {}: {}", err.kind, err.message);
            }
        }
        out
    }
}

// ============================================================================
// Writer
// ============================================================================

/// Paths of a written manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestPaths {
    pub manifest: PathBuf,
    pub summary: PathBuf,
}

/// Writes `<stem>_manifest.json` and `<stem>_summary.txt`
#[derive(Debug, Clone)]
pub struct ManifestWriter {
    outputs_dir: PathBuf,
    stem: String,
}

impl ManifestWriter {
    pub fn new(outputs_dir: impl Into<PathBuf>, stem: impl Into<String>) -> Self {
        Self {
            outputs_dir: outputs_dir.into(),
            stem: stem.into(),
        }
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.outputs_dir.join(format!("{}_manifest.json", self.stem))
    }

    pub fn summary_path(&self) -> PathBuf {
        self.outputs_dir.join(format!("{}_summary.txt", self.stem))
    }

    /// Write both files, each through a temp file and rename
    pub fn write(&self, manifest: &RunManifest) -> Result<ManifestPaths> {
        fs::create_dir_all(&self.outputs_dir).map_err(|e| IngestError::output(&self.outputs_dir, e))?;

        let paths = ManifestPaths {
            manifest: self.manifest_path(),
            summary: self.summary_path(),
        };
        let json = serde_json::to_string_pretty(manifest)?;
        write_atomically(&paths.manifest, json.as_bytes())?;
        write_atomically(&paths.summary, manifest.summary_text().as_bytes())?;

        info!(
            run_id = %manifest.run_id,
            status = %manifest.status,
            path = %paths.manifest.display(),
            "Wrote run manifest"
        );
        Ok(paths)
    }

    /// Load a previously written manifest
    pub fn load(path: impl AsRef<Path>) -> Result<RunManifest> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| IngestError::read(path, e))?;
        Ok(serde_json::from_str(&content)?)
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);
    fs::write(&tmp, bytes).map_err(|e| IngestError::output(path, e))?;
    fs::rename(&tmp, path).map_err(|e| IngestError::output(path, e))?;
    Ok(())
}
