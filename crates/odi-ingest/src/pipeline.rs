//! Run orchestration
//!
//! A run moves through configure, schema, discover, extract/ingest/validate,
//! combine and manifest. Archives are independent units of work; a bounded
//! pool processes them concurrently and results are gathered back in arrival
//! order so the manifest and the combined output never depend on scheduling.

use crate::combine::{CombineSource, Combiner};
use crate::config::PipelineConfig;
use crate::error::{IngestError, Result};
use crate::extract::{discover_archives, ArchiveExtractor, ArchiveInput, MemberAction};
use crate::manifest::{
    ArchiveRecord, ErrorRecord, ManifestPaths, ManifestWriter, Outcome, RunManifest, RunStatus, SchemaSummary,
    SourceRecord,
};
use crate::output::{
    combined_base, create_writer, partial_path, per_source_bases, OutputFormat, OutputKind, OutputRecord,
};
use crate::profile::DatasetProfile;
use crate::reader::{Provenance, RowIngestor};
use crate::schema::{SchemaDictionaryParser, SchemaSpec};
use crate::validate::{ValidationReport, Validator};
use odi_common::checksum::digest_file;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Result of one run: the finalized manifest and where it was written
#[derive(Debug)]
pub struct RunOutcome {
    pub manifest: RunManifest,
    /// `None` when the manifest itself could not be written
    pub paths: Option<ManifestPaths>,
}

impl RunOutcome {
    pub fn status(&self) -> RunStatus {
        self.manifest.status
    }

    /// Process exit status; a lost manifest always fails the run
    pub fn exit_code(&self) -> i32 {
        match self.paths {
            Some(_) => self.manifest.status.exit_code(),
            None => RunStatus::Failed.exit_code(),
        }
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, cancel: CancellationToken) -> Self {
        Self { config, cancel }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Execute one run
    ///
    /// Configuration problems are returned as `Err` before anything is
    /// written. Every later failure is recorded in the manifest instead.
    pub async fn run(&self) -> Result<RunOutcome> {
        self.config.validate()?;
        let profile = self.config.profile()?;
        let doc = self.config.schema_doc_path()?;

        let started = Instant::now();
        let mut manifest = RunManifest::begin(self.config.snapshot());
        let writer = ManifestWriter::new(self.config.outputs_dir(), profile.manifest_stem);
        info!(run_id = %manifest.run_id, dataset = %profile.id, "Starting ingestion run");

        let schema = match load_schema(&profile, &doc) {
            Ok((schema, summary)) => {
                manifest.schema = Some(summary);
                Arc::new(schema)
            },
            Err(e) => {
                error!(error = %e, path = %doc.display(), "Schema dictionary rejected");
                manifest.record_error(&e);
                return Ok(self.conclude(manifest, &writer, started));
            },
        };

        // A schema without columns cannot validate anything
        if let Err(e) = Validator::new(schema.clone()) {
            manifest.record_error(&e);
            return Ok(self.conclude(manifest, &writer, started));
        }

        let processed_dir = self.config.processed_dir();
        for dir in [self.config.staging_dir(), processed_dir.clone()] {
            if let Err(e) = fs::create_dir_all(&dir) {
                manifest.record_error(&IngestError::output(&dir, e));
                return Ok(self.conclude(manifest, &writer, started));
            }
        }

        let archives = match discover_archives(&self.config.input_dirs(), &profile) {
            Ok(archives) if archives.is_empty() => {
                let dirs: Vec<String> = self.config.input_dirs().iter().map(|d| d.display().to_string()).collect();
                manifest.record_error(&IngestError::configuration(format!(
                    "no {} archives found in {}",
                    profile.id,
                    dirs.join(", ")
                )));
                return Ok(self.conclude(manifest, &writer, started));
            },
            Ok(archives) => archives,
            Err(e) => {
                manifest.record_error(&e);
                return Ok(self.conclude(manifest, &writer, started));
            },
        };
        info!(archives = archives.len(), workers = self.config.workers, "Discovered archives");

        let context = ArchiveContext {
            extractor: Arc::new(ArchiveExtractor::new(
                self.config.staging_dir(),
                self.config.overwrite_extracted,
            )),
            ingestor: RowIngestor::new(schema.clone(), self.config.read_options()),
            processed_dir: processed_dir.clone(),
            format: self.config.output_format,
            cancel: self.cancel.clone(),
        };
        let results = process_all(context, archives, self.config.workers).await;

        let mut sources = Vec::new();
        for result in results {
            manifest.counts.archives_discovered += 1;
            if result.extracted {
                manifest.counts.archives_extracted += 1;
            }
            if result.record.outcome == Outcome::Failed {
                manifest.counts.archives_failed += 1;
            }
            manifest.counts.files_staged += result.record.sources.len();
            for source in &result.record.sources {
                match source.outcome {
                    Outcome::Succeeded => manifest.counts.files_ingested += 1,
                    _ => manifest.counts.files_failed += 1,
                }
            }
            manifest.counts.rows_written += result.rows_written;
            manifest.validation.merge(&result.report);
            manifest.outputs.extend(result.outputs);
            manifest.inputs.push(result.record);
            sources.extend(result.sources);
        }
        manifest.counts.rows_read = manifest.validation.rows_read;
        manifest.counts.rows_with_violations = manifest.validation.rows_with_violations;

        if self.config.combine && !sources.is_empty() && !self.cancel.is_cancelled() {
            let combined = combined_base(&processed_dir, profile.combined_stem);
            let ingestor = RowIngestor::new(schema.clone(), self.config.read_options());
            let format = self.config.output_format;
            let cancel = self.cancel.clone();
            let joined =
                tokio::task::spawn_blocking(move || combine_sources(ingestor, sources, format, &combined, &cancel))
                    .await;
            match joined {
                Ok((record, Ok(()))) => {
                    manifest.counts.rows_combined = record.rows;
                    manifest.outputs.push(record);
                },
                Ok((record, Err(e))) => {
                    if !matches!(e, IngestError::Interrupted) {
                        warn!(error = %e, "Combined output failed");
                        manifest.record_warning(&e);
                    }
                    manifest.outputs.push(record);
                },
                Err(e) => {
                    error!(error = %e, "Combine task aborted");
                    manifest.record_warning(&IngestError::output(&processed_dir, e));
                },
            }
        }

        Ok(self.conclude(manifest, &writer, started))
    }

    fn conclude(&self, mut manifest: RunManifest, writer: &ManifestWriter, started: Instant) -> RunOutcome {
        manifest.finalize(started, self.cancel.is_cancelled());
        let paths = match writer.write(&manifest) {
            Ok(paths) => Some(paths),
            Err(e) => {
                error!(error = %e, "Failed to write run manifest");
                None
            },
        };
        info!(
            status = %manifest.status,
            rows_read = manifest.counts.rows_read,
            rows_with_violations = manifest.counts.rows_with_violations,
            duration_ms = manifest.duration_ms,
            "Run finished"
        );
        RunOutcome { manifest, paths }
    }
}

/// Parse the dictionary and describe it for the manifest
fn load_schema(profile: &DatasetProfile, doc: &Path) -> Result<(SchemaSpec, SchemaSummary)> {
    let schema = SchemaDictionaryParser::for_profile(profile).parse_file(profile.id, doc)?;
    let summary = SchemaSummary {
        dataset: schema.dataset().to_string(),
        dictionary: doc.to_path_buf(),
        sha256: digest_file(doc).ok().map(|d| d.sha256),
        columns: schema.len(),
        kinds: schema
            .kind_counts()
            .into_iter()
            .map(|(kind, n)| (kind.to_string(), n))
            .collect(),
        date_formats: schema.date_formats().to_vec(),
    };
    info!(dataset = %summary.dataset, columns = summary.columns, "Loaded schema dictionary");
    Ok((schema, summary))
}

// ============================================================================
// Per-archive work
// ============================================================================

/// Everything a worker needs to process one archive
#[derive(Clone)]
struct ArchiveContext {
    extractor: Arc<ArchiveExtractor>,
    ingestor: RowIngestor,
    processed_dir: PathBuf,
    format: OutputFormat,
    cancel: CancellationToken,
}

struct ArchiveResult {
    record: ArchiveRecord,
    extracted: bool,
    outputs: Vec<OutputRecord>,
    sources: Vec<CombineSource>,
    report: ValidationReport,
    rows_written: u64,
}

impl ArchiveResult {
    fn empty(archive: &ArchiveInput, dataset: &str, outcome: Outcome, error: Option<ErrorRecord>) -> Self {
        Self {
            record: ArchiveRecord {
                name: archive.name.clone(),
                label: archive.label.clone(),
                path: archive.path.clone(),
                sha256: None,
                size_bytes: None,
                outcome,
                error,
                decisions: Vec::new(),
                sources: Vec::new(),
            },
            extracted: false,
            outputs: Vec::new(),
            sources: Vec::new(),
            report: ValidationReport::new(dataset),
            rows_written: 0,
        }
    }
}

/// Process every archive on a bounded pool, returning results in arrival order
async fn process_all(context: ArchiveContext, archives: Vec<ArchiveInput>, workers: usize) -> Vec<ArchiveResult> {
    let semaphore = Arc::new(Semaphore::new(workers.max(1)));
    let dataset = context.ingestor.schema().dataset().to_string();

    let handles: Vec<_> = archives
        .into_iter()
        .map(|archive| {
            let sem = semaphore.clone();
            let ctx = context.clone();
            let input = archive.clone();
            let handle = tokio::spawn(async move {
                let _permit = sem.acquire_owned().await.ok();
                tokio::task::spawn_blocking(move || ctx.process_archive(&input)).await
            });
            (archive, handle)
        })
        .collect();

    let mut results = Vec::with_capacity(handles.len());
    for (archive, handle) in handles {
        let result = match handle.await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) | Err(e) => {
                error!(archive = %archive.label, error = %e, "Archive worker aborted");
                let err = IngestError::extraction(&archive.label, e);
                ArchiveResult::empty(&archive, &dataset, Outcome::Failed, Some(ErrorRecord::from(&err)))
            },
        };
        results.push(result);
    }
    results
}

impl ArchiveContext {
    fn process_archive(&self, archive: &ArchiveInput) -> ArchiveResult {
        let dataset = self.ingestor.schema().dataset().to_string();
        if self.cancel.is_cancelled() {
            return ArchiveResult::empty(archive, &dataset, Outcome::Interrupted, None);
        }

        let digest = digest_file(&archive.path).ok();
        let outcome = match self.extractor.extract(archive, &self.cancel) {
            Ok(outcome) => outcome,
            Err(IngestError::Interrupted) => {
                return ArchiveResult::empty(archive, &dataset, Outcome::Interrupted, None);
            },
            Err(e) => {
                warn!(archive = %archive.label, error = %e, "Skipping archive");
                let mut result = ArchiveResult::empty(archive, &dataset, Outcome::Failed, Some(ErrorRecord::from(&e)));
                result.record.sha256 = digest.as_ref().map(|d| d.sha256.clone());
                result.record.size_bytes = digest.as_ref().map(|d| d.size);
                return result;
            },
        };
        info!(
            archive = %archive.label,
            extracted = outcome.count(MemberAction::Extracted) + outcome.count(MemberAction::Overwritten),
            skipped = outcome.count(MemberAction::SkippedExisting),
            "Archive staged"
        );

        let mut result = ArchiveResult::empty(archive, &dataset, Outcome::Succeeded, None);
        result.extracted = true;
        result.record.sha256 = digest.as_ref().map(|d| d.sha256.clone());
        result.record.size_bytes = digest.as_ref().map(|d| d.size);

        let staged: Vec<(&str, &Path)> = outcome.staged().collect();
        let members: Vec<&str> = staged.iter().map(|(member, _)| *member).collect();
        let bases = per_source_bases(&self.processed_dir, &archive.stem(), &members);
        for ((member, path), base) in staged.into_iter().zip(&bases) {
            let ingested = self.ingest_source(archive, member, path, base);
            result.report.merge(&ingested.report);
            if let Some(output) = ingested.output {
                if output.complete {
                    result.rows_written += output.rows;
                }
                result.outputs.push(output);
            }
            result.sources.extend(ingested.combine);
            result.record.sources.push(ingested.record);
        }

        let succeeded = result
            .record
            .sources
            .iter()
            .filter(|s| s.outcome == Outcome::Succeeded)
            .count();
        result.record.outcome = if result.record.sources.iter().any(|s| s.outcome == Outcome::Interrupted) {
            Outcome::Interrupted
        } else if succeeded == result.record.sources.len() {
            Outcome::Succeeded
        } else if succeeded > 0 {
            Outcome::Partial
        } else {
            Outcome::Failed
        };
        result.record.decisions = outcome.decisions;
        result
    }

    /// Read, validate and write one staged file
    fn ingest_source(&self, archive: &ArchiveInput, member: &str, path: &Path, base: &Path) -> IngestedSource {
        let mut ingested = IngestedSource {
            record: SourceRecord {
                member: member.to_string(),
                staged_path: path.to_path_buf(),
                outcome: Outcome::Failed,
                rows_read: 0,
                rows_with_violations: 0,
                output: None,
                error: None,
            },
            output: None,
            combine: None,
            report: ValidationReport::new(self.ingestor.schema().dataset()),
        };

        let rows = match self.ingestor.open(path, Provenance::new(&archive.label, member)) {
            Ok(rows) => rows,
            Err(e) => {
                warn!(file = %path.display(), error = %e, "Skipping unreadable file");
                ingested.record.error = Some(ErrorRecord::from(&e));
                return ingested;
            },
        };

        let mut writer = match create_writer(self.format, base, self.ingestor.schema()) {
            Ok(writer) => writer,
            Err(e) => {
                warn!(file = %path.display(), error = %e, "Cannot create output");
                ingested.record.error = Some(ErrorRecord::from(&e));
                return ingested;
            },
        };

        let validator = match Validator::new(self.ingestor.schema().clone()) {
            Ok(validator) => validator,
            Err(e) => {
                ingested.record.error = Some(ErrorRecord::from(&e));
                return ingested;
            },
        };
        let mut validated = validator.validate(rows);

        let mut failure = None;
        for row in validated.by_ref() {
            if self.cancel.is_cancelled() {
                failure = Some(IngestError::Interrupted);
                break;
            }
            if let Err(e) = row.and_then(|row| writer.write_row(&row)) {
                failure = Some(e);
                break;
            }
        }
        ingested.report = validated.into_report();
        ingested.record.rows_read = ingested.report.rows_read;
        ingested.record.rows_with_violations = ingested.report.rows_with_violations;

        let format = writer.format();
        let final_path = writer.path().to_path_buf();
        let written = writer.rows_written();
        let finished = match failure {
            Some(e) => Err(e),
            None => writer.finish(),
        };

        match finished {
            Ok(rows) => {
                ingested.record.outcome = Outcome::Succeeded;
                ingested.record.output = Some(final_path.clone());
                ingested.output = Some(OutputRecord {
                    path: final_path,
                    kind: OutputKind::PerSource,
                    format,
                    rows,
                    complete: true,
                });
                ingested.combine = Some(CombineSource {
                    archive_index: archive.index,
                    archive: archive.label.clone(),
                    file: member.to_string(),
                    path: path.to_path_buf(),
                });
            },
            Err(e) => {
                if matches!(e, IngestError::Interrupted) {
                    ingested.record.outcome = Outcome::Interrupted;
                } else {
                    warn!(file = %path.display(), error = %e, "Ingestion of file failed");
                    ingested.record.error = Some(ErrorRecord::from(&e));
                }
                ingested.output = Some(OutputRecord {
                    path: partial_path(&final_path),
                    kind: OutputKind::PerSource,
                    format,
                    rows: written,
                    complete: false,
                });
            },
        }
        ingested
    }
}

struct IngestedSource {
    record: SourceRecord,
    output: Option<OutputRecord>,
    combine: Option<CombineSource>,
    report: ValidationReport,
}

/// Write the combined table; the record describes whatever was produced
fn combine_sources(
    ingestor: RowIngestor,
    sources: Vec<CombineSource>,
    format: OutputFormat,
    base: &Path,
    cancel: &CancellationToken,
) -> (OutputRecord, Result<()>) {
    let schema = ingestor.schema().clone();
    let mut writer = match create_writer(format, base, &schema) {
        Ok(writer) => writer,
        Err(e) => {
            let record = OutputRecord {
                path: base.to_path_buf(),
                kind: OutputKind::Combined,
                format,
                rows: 0,
                complete: false,
            };
            return (record, Err(e));
        },
    };

    let combiner = Combiner::new(ingestor);
    let combined = combiner.combine(sources, writer.as_mut(), cancel);
    let mut record = OutputRecord {
        path: writer.path().to_path_buf(),
        kind: OutputKind::Combined,
        format: writer.format(),
        rows: writer.rows_written(),
        complete: false,
    };
    match combined.and_then(|_| writer.finish()) {
        Ok(rows) => {
            record.rows = rows;
            record.complete = true;
            (record, Ok(()))
        },
        Err(e) => {
            record.path = partial_path(&record.path);
            (record, Err(e))
        },
    }
}
