//! Shared fixtures for pipeline and binary tests
//!
//! A [`Workspace`] is a temp directory laid out the way a run expects it:
//! a dictionary document, a `raw/` input directory and a `data/` root.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use odi_ingest::output::OutputFormat;
use odi_ingest::PipelineConfig;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

/// Three-column complaints dictionary
pub const DICTIONARY: &str = "\
ODI COMPLAINTS TEST LAYOUT

FIELDS:
=======
Field# Name     Type/Size   Description
------ -------- ----------- ----------------------------
1      CMPLID   CHAR(9)     NHTSA'S INTERNAL UNIQUE SEQUENCE NUMBER
2      MFR_NAME CHAR(60)    MANUFACTURER'S NAME
3      YEARTXT  NUMBER(4)   MODEL YEAR
";

pub const FIRST_ARCHIVE: &str = "COMPLAINTS_RECEIVED_2020-2024.zip";
pub const SECOND_ARCHIVE: &str = "COMPLAINTS_RECEIVED_2025-2026.zip";

pub struct Workspace {
    pub dir: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        let workspace = Self {
            dir: tempfile::tempdir().unwrap(),
        };
        std::fs::create_dir_all(workspace.raw_dir()).unwrap();
        workspace.write_dictionary(DICTIONARY);
        workspace
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.root().join("raw")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root().join("data")
    }

    pub fn dictionary(&self) -> PathBuf {
        self.root().join("CMPL.txt")
    }

    pub fn processed_dir(&self) -> PathBuf {
        self.data_dir().join("processed")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.data_dir().join("extracted")
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.data_dir().join("outputs").join("ingest_odi_manifest.json")
    }

    pub fn write_dictionary(&self, text: &str) {
        std::fs::write(self.dictionary(), text).unwrap();
    }

    /// Write a zip archive into `raw/` with the given members
    pub fn add_archive(&self, name: &str, members: &[(&str, &str)]) -> PathBuf {
        let path = self.raw_dir().join(name);
        let mut zip = ZipWriter::new(File::create(&path).unwrap());
        for (member, body) in members {
            zip.start_file(*member, SimpleFileOptions::default()).unwrap();
            zip.write_all(body.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
        path
    }

    /// Run configuration over this workspace, writing CSV
    pub fn config(&self) -> PipelineConfig {
        PipelineConfig {
            dataset: "complaints".to_string(),
            data_dir: self.data_dir(),
            raw_dirs: vec![self.raw_dir()],
            schema_doc: Some(self.dictionary()),
            output_format: OutputFormat::Text,
            workers: 2,
            ..PipelineConfig::default()
        }
    }
}

/// `n` tab-delimited clean rows whose ids start with `prefix`
pub fn clean_rows(prefix: &str, n: usize) -> String {
    (0..n).map(|i| format!("{prefix}{i:04}\tACME MOTORS\t2020\n")).collect()
}

/// Rows of a CSV output file, header excluded
pub fn read_csv(path: &Path) -> (Vec<String>, Vec<Vec<String>>) {
    let mut reader = csv::Reader::from_path(path).unwrap();
    let headers = reader.headers().unwrap().iter().map(str::to_string).collect();
    let rows = reader
        .records()
        .map(|r| r.unwrap().iter().map(str::to_string).collect())
        .collect();
    (headers, rows)
}
