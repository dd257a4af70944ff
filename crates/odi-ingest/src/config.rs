//! Pipeline configuration
//!
//! Every component receives its directories and flags from a
//! [`PipelineConfig`] value. Sources are layered: built-in defaults, then
//! `ODI_*` environment variables, then command-line flags.

use crate::error::{IngestError, Result};
use crate::output::OutputFormat;
use crate::profile::DatasetProfile;
use crate::reader::{HeaderPolicy, ReadOptions};
use serde::Serialize;
use std::path::{Path, PathBuf};

// ============================================================================
// Configuration Constants
// ============================================================================

/// Dataset ingested when none is specified
pub const DEFAULT_DATASET: &str = "complaints";

/// Root of the data tree when none is specified
pub const DEFAULT_DATA_DIR: &str = "data";

/// Directory holding the schema dictionaries
pub const DEFAULT_DOCS_DIR: &str = "docs";

/// Ingestion run configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineConfig {
    pub dataset: String,
    pub data_dir: PathBuf,
    /// Input archive directories in arrival order; `<data_dir>/raw` when empty
    pub raw_dirs: Vec<PathBuf>,
    pub staging_dir: Option<PathBuf>,
    pub processed_dir: Option<PathBuf>,
    pub outputs_dir: Option<PathBuf>,
    pub schema_doc: Option<PathBuf>,
    pub output_format: OutputFormat,
    pub overwrite_extracted: bool,
    pub combine: bool,
    pub header: HeaderPolicy,
    pub blank_as_null: bool,
    /// Field delimiter; auto-detected per file when unset
    pub delimiter: Option<u8>,
    pub workers: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dataset: DEFAULT_DATASET.to_string(),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            raw_dirs: Vec::new(),
            staging_dir: None,
            processed_dir: None,
            outputs_dir: None,
            schema_doc: None,
            output_format: OutputFormat::default(),
            overwrite_extracted: false,
            combine: true,
            header: HeaderPolicy::default(),
            blank_as_null: false,
            delimiter: None,
            workers: default_workers(),
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

/// Parse a boolean environment value
pub fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(IngestError::configuration(format!("{name}: expected a boolean, got '{other}'"))),
    }
}

/// Parse a delimiter given as a single character or a name
pub fn parse_delimiter(value: &str) -> Result<u8> {
    if value == "\\t" || value == "\t" {
        return Ok(b'\t');
    }
    match value.trim().to_lowercase().as_str() {
        "tab" => Ok(b'\t'),
        "pipe" => Ok(b'|'),
        "comma" => Ok(b','),
        other if other.len() == 1 && other.is_ascii() => Ok(other.as_bytes()[0]),
        other => Err(IngestError::configuration(format!(
            "delimiter must be a single ASCII character, got '{other}'"
        ))),
    }
}

impl PipelineConfig {
    /// Defaults overlaid with `ODI_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::default().merge_env()
    }

    /// Overlay `ODI_*` environment variables onto this configuration
    pub fn merge_env(self) -> Result<Self> {
        self.merge_vars(|name| std::env::var(name).ok())
    }

    /// Overlay `ODI_*` settings resolved through `var` onto this configuration
    pub fn merge_vars(mut self, var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(dataset) = var("ODI_DATASET") {
            self.dataset = dataset;
        }
        if let Some(dir) = var("ODI_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(doc) = var("ODI_SCHEMA_DOC") {
            self.schema_doc = Some(PathBuf::from(doc));
        }
        if let Some(format) = var("ODI_OUTPUT_FORMAT") {
            self.output_format = format.parse().map_err(IngestError::Configuration)?;
        }
        if let Some(value) = var("ODI_OVERWRITE_EXTRACTED") {
            self.overwrite_extracted = parse_flag("ODI_OVERWRITE_EXTRACTED", &value)?;
        }
        if let Some(value) = var("ODI_COMBINE_PROCESSED") {
            self.combine = parse_flag("ODI_COMBINE_PROCESSED", &value)?;
        }
        if let Some(value) = var("ODI_HEADER_ROW") {
            self.header = value.parse().map_err(IngestError::Configuration)?;
        }
        if let Some(value) = var("ODI_BLANK_AS_NULL") {
            self.blank_as_null = parse_flag("ODI_BLANK_AS_NULL", &value)?;
        }
        if let Some(value) = var("ODI_DELIMITER") {
            self.delimiter = Some(parse_delimiter(&value)?);
        }
        if let Some(value) = var("ODI_WORKERS") {
            self.workers = value
                .trim()
                .parse()
                .map_err(|_| IngestError::configuration(format!("ODI_WORKERS: invalid worker count '{value}'")))?;
        }

        Ok(self)
    }

    /// Built-in profile for the configured dataset
    pub fn profile(&self) -> Result<DatasetProfile> {
        DatasetProfile::lookup(&self.dataset).ok_or_else(|| {
            IngestError::configuration(format!(
                "unknown dataset '{}' (known: {})",
                self.dataset,
                DatasetProfile::KNOWN.join(", ")
            ))
        })
    }

    pub fn input_dirs(&self) -> Vec<PathBuf> {
        if self.raw_dirs.is_empty() {
            vec![self.data_dir.join("raw")]
        } else {
            self.raw_dirs.clone()
        }
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.staging_dir.clone().unwrap_or_else(|| self.data_dir.join("extracted"))
    }

    pub fn processed_dir(&self) -> PathBuf {
        self.processed_dir.clone().unwrap_or_else(|| self.data_dir.join("processed"))
    }

    pub fn outputs_dir(&self) -> PathBuf {
        self.outputs_dir.clone().unwrap_or_else(|| self.data_dir.join("outputs"))
    }

    /// Dictionary document path; defaults to the profile's file under `docs/`
    pub fn schema_doc_path(&self) -> Result<PathBuf> {
        match &self.schema_doc {
            Some(path) => Ok(path.clone()),
            None => Ok(Path::new(DEFAULT_DOCS_DIR).join(self.profile()?.dictionary_file)),
        }
    }

    pub fn read_options(&self) -> ReadOptions {
        ReadOptions {
            delimiter: self.delimiter,
            header: self.header,
            blank_as_null: self.blank_as_null,
        }
    }

    /// Check the configuration without touching the filesystem beyond reads
    pub fn validate(&self) -> Result<()> {
        self.profile()?;

        if self.workers == 0 {
            return Err(IngestError::configuration("workers must be at least 1"));
        }

        for dir in self.input_dirs() {
            if !dir.is_dir() {
                return Err(IngestError::configuration(format!(
                    "input directory not found: {}",
                    dir.display()
                )));
            }
        }

        let doc = self.schema_doc_path()?;
        if !doc.is_file() {
            return Err(IngestError::configuration(format!(
                "schema dictionary not found: {}",
                doc.display()
            )));
        }

        for (label, dir) in [
            ("staging", self.staging_dir()),
            ("processed", self.processed_dir()),
            ("outputs", self.outputs_dir()),
        ] {
            if dir.exists() && !dir.is_dir() {
                return Err(IngestError::configuration(format!(
                    "{label} path exists and is not a directory: {}",
                    dir.display()
                )));
            }
        }

        Ok(())
    }

    /// Effective values as recorded in the run manifest
    pub fn snapshot(&self) -> ConfigSnapshot {
        ConfigSnapshot {
            dataset: self.dataset.clone(),
            input_dirs: self.input_dirs(),
            staging_dir: self.staging_dir(),
            processed_dir: self.processed_dir(),
            outputs_dir: self.outputs_dir(),
            schema_doc: self.schema_doc_path().ok(),
            output_format: self.output_format,
            overwrite_extracted: self.overwrite_extracted,
            combine: self.combine,
            header: self.header,
            blank_as_null: self.blank_as_null,
            delimiter: self.delimiter.map(|d| (d as char).to_string()),
            workers: self.workers,
        }
    }
}

/// Resolved configuration written into the run manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct ConfigSnapshot {
    pub dataset: String,
    pub input_dirs: Vec<PathBuf>,
    pub staging_dir: PathBuf,
    pub processed_dir: PathBuf,
    pub outputs_dir: PathBuf,
    pub schema_doc: Option<PathBuf>,
    pub output_format: OutputFormat,
    pub overwrite_extracted: bool,
    pub combine: bool,
    pub header: HeaderPolicy,
    pub blank_as_null: bool,
    pub delimiter: Option<String>,
    pub workers: usize,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_derive_from_data_dir() {
        let config = PipelineConfig {
            data_dir: PathBuf::from("/srv/odi"),
            ..PipelineConfig::default()
        };
        assert_eq!(config.input_dirs(), vec![PathBuf::from("/srv/odi/raw")]);
        assert_eq!(config.staging_dir(), PathBuf::from("/srv/odi/extracted"));
        assert_eq!(config.processed_dir(), PathBuf::from("/srv/odi/processed"));
        assert_eq!(config.outputs_dir(), PathBuf::from("/srv/odi/outputs"));
        assert_eq!(config.schema_doc_path().unwrap(), PathBuf::from("docs/CMPL.txt"));
        assert!(config.combine);
        assert_eq!(config.output_format, OutputFormat::Columnar);
        assert_eq!(config.header, HeaderPolicy::Absent);
    }

    #[test]
    fn test_parse_flag_and_delimiter() {
        assert!(parse_flag("X", "Yes").unwrap());
        assert!(!parse_flag("X", "0").unwrap());
        assert!(parse_flag("X", "maybe").is_err());

        assert_eq!(parse_delimiter("\\t").unwrap(), b'\t');
        assert_eq!(parse_delimiter("pipe").unwrap(), b'|');
        assert_eq!(parse_delimiter(",").unwrap(), b',');
        assert!(parse_delimiter(";;").is_err());
    }

    #[test]
    fn test_validate_rejects_missing_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig {
            data_dir: dir.path().to_path_buf(),
            ..PipelineConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert_eq!(err.kind(), "configuration_error");
        assert!(err.to_string().contains("input directory"));

        std::fs::create_dir_all(dir.path().join("raw")).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("schema dictionary"));

        let doc = dir.path().join("CMPL.txt");
        std::fs::write(&doc, "FIELDS:\n1 CMPLID CHAR(9)\n").unwrap();
        let config = PipelineConfig {
            schema_doc: Some(doc),
            ..config
        };
        config.validate().unwrap();

        let bad = PipelineConfig {
            workers: 0,
            ..config.clone()
        };
        assert!(bad.validate().is_err());

        let unknown = PipelineConfig {
            dataset: "investigations".into(),
            ..config
        };
        assert!(unknown.validate().unwrap_err().to_string().contains("unknown dataset"));
    }

    #[test]
    fn test_validate_has_no_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("raw")).unwrap();
        let config = PipelineConfig {
            data_dir: dir.path().to_path_buf(),
            ..PipelineConfig::default()
        };
        let _ = config.validate();
        assert!(!config.staging_dir().exists());
        assert!(!config.outputs_dir().exists());
    }

    #[test]
    fn test_merge_vars() {
        let vars: HashMap<&str, &str> = [
            ("ODI_OUTPUT_FORMAT", "csv"),
            ("ODI_COMBINE_PROCESSED", "false"),
            ("ODI_DELIMITER", "pipe"),
        ]
        .into_iter()
        .collect();

        let config = PipelineConfig::default()
            .merge_vars(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.output_format, OutputFormat::Text);
        assert!(!config.combine);
        assert_eq!(config.delimiter, Some(b'|'));
        assert_eq!(config.workers, PipelineConfig::default().workers);
    }

    #[test]
    fn test_merge_vars_rejects_bad_values() {
        let err = PipelineConfig::default()
            .merge_vars(|name| (name == "ODI_WORKERS").then(|| "many".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("ODI_WORKERS"));
    }
}
