//! ODI Ingest Library
//!
//! Schema-driven ingestion of NHTSA Office of Defects Investigation (ODI)
//! complaint releases.
//!
//! # Overview
//!
//! A run turns the raw release archives into validated, typed tables:
//!
//! - **Schema**: Parse the published field dictionary into a [`SchemaSpec`]
//! - **Extraction**: Stage the tabular members of each archive safely
//! - **Ingestion**: Read headerless delimited text into typed rows
//! - **Validation**: Count data-quality violations without dropping rows
//! - **Combination**: Merge per-source outputs in a deterministic order
//! - **Manifest**: Record everything the run did in a JSON manifest and text summary
//!
//! # Example
//!
//! ```no_run
//! use odi_ingest::{Pipeline, PipelineConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = PipelineConfig::from_env()?;
//!     let outcome = Pipeline::new(config, CancellationToken::new()).run().await?;
//!     println!("{}", outcome.manifest.summary_text());
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod combine;
pub mod config;
pub mod error;
pub mod extract;
pub mod manifest;
pub mod output;
pub mod pipeline;
pub mod profile;
pub mod reader;
pub mod schema;
pub mod validate;

// Re-export commonly used types
pub use config::PipelineConfig;
pub use error::{IngestError, Result, SchemaParseError};
pub use manifest::{RunManifest, RunStatus};
pub use pipeline::{Pipeline, RunOutcome};
pub use schema::{SchemaDictionaryParser, SchemaSpec};

use clap::Parser;
use output::OutputFormat;
use reader::HeaderPolicy;
use std::path::PathBuf;

/// ODI complaint ingestion
///
/// Flags override `ODI_*` environment variables, which override defaults.
#[derive(Parser, Debug, Default)]
#[command(name = "odi-ingest")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Dataset profile to ingest (complaints, recalls)
    #[arg(long)]
    pub dataset: Option<String>,

    /// Root data directory holding raw/, extracted/, processed/ and outputs/
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Input archive directory; repeat to ingest several in order
    #[arg(long = "input-dir", value_name = "DIR")]
    pub input_dirs: Vec<PathBuf>,

    /// Staging directory for extracted files
    #[arg(long)]
    pub staging_dir: Option<PathBuf>,

    /// Directory for per-source and combined tables
    #[arg(long)]
    pub processed_dir: Option<PathBuf>,

    /// Directory for the run manifest and summary
    #[arg(long)]
    pub outputs_dir: Option<PathBuf>,

    /// Field dictionary document
    #[arg(long)]
    pub schema_doc: Option<PathBuf>,

    /// Output table format
    #[arg(long, value_enum)]
    pub output_format: Option<OutputFormat>,

    /// Replace files already present in the staging directory
    #[arg(long)]
    pub overwrite_extracted: bool,

    /// Skip writing the combined table
    #[arg(long)]
    pub no_combine: bool,

    /// Treatment of the first record of each file
    #[arg(long = "header-row", value_enum, value_name = "POLICY")]
    pub header: Option<HeaderPolicy>,

    /// Store blank fields as null instead of empty text
    #[arg(long)]
    pub blank_as_null: bool,

    /// Field delimiter (tab, pipe, comma or a single character); detected when unset
    #[arg(long)]
    pub delimiter: Option<String>,

    /// Archives processed concurrently
    #[arg(long)]
    pub workers: Option<usize>,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// Resolve the run configuration from the environment and these flags
    pub fn into_config(self) -> Result<PipelineConfig> {
        self.apply(PipelineConfig::from_env()?)
    }

    /// Overlay the flags that were given onto `config`
    pub fn apply(self, mut config: PipelineConfig) -> Result<PipelineConfig> {
        if let Some(dataset) = self.dataset {
            config.dataset = dataset;
        }
        if let Some(dir) = self.data_dir {
            config.data_dir = dir;
        }
        if !self.input_dirs.is_empty() {
            config.raw_dirs = self.input_dirs;
        }
        if self.staging_dir.is_some() {
            config.staging_dir = self.staging_dir;
        }
        if self.processed_dir.is_some() {
            config.processed_dir = self.processed_dir;
        }
        if self.outputs_dir.is_some() {
            config.outputs_dir = self.outputs_dir;
        }
        if self.schema_doc.is_some() {
            config.schema_doc = self.schema_doc;
        }
        if let Some(format) = self.output_format {
            config.output_format = format;
        }
        if self.overwrite_extracted {
            config.overwrite_extracted = true;
        }
        if self.no_combine {
            config.combine = false;
        }
        if let Some(header) = self.header {
            config.header = header;
        }
        if self.blank_as_null {
            config.blank_as_null = true;
        }
        if let Some(delimiter) = self.delimiter {
            config.delimiter = Some(config::parse_delimiter(&delimiter)?);
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        Ok(config)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_flags_override_config() {
        let cli = Cli::try_parse_from([
            "odi-ingest",
            "--dataset",
            "recalls",
            "--input-dir",
            "a",
            "--input-dir",
            "b",
            "--output-format",
            "csv",
            "--no-combine",
            "--header-row",
            "skip",
            "--delimiter",
            "pipe",
            "--workers",
            "2",
        ])
        .unwrap();
        let config = cli.apply(PipelineConfig::default()).unwrap();
        assert_eq!(config.dataset, "recalls");
        assert_eq!(config.raw_dirs, vec![PathBuf::from("a"), PathBuf::from("b")]);
        assert_eq!(config.output_format, OutputFormat::Text);
        assert!(!config.combine);
        assert_eq!(config.header, HeaderPolicy::Skip);
        assert_eq!(config.delimiter, Some(b'|'));
        assert_eq!(config.workers, 2);
    }

    #[test]
    fn test_absent_flags_keep_config() {
        let base = PipelineConfig {
            workers: 7,
            combine: true,
            ..PipelineConfig::default()
        };
        let config = Cli::try_parse_from(["odi-ingest"]).unwrap().apply(base.clone()).unwrap();
        assert_eq!(config, base);
    }

    #[test]
    fn test_invalid_delimiter_is_configuration_error() {
        let cli = Cli::try_parse_from(["odi-ingest", "--delimiter", "ab"]).unwrap();
        let err = cli.apply(PipelineConfig::default()).unwrap_err();
        assert_eq!(err.kind(), "configuration_error");
    }
}
