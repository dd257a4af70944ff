//! Built-in dataset profiles
//!
//! A profile carries the per-dataset knowledge the dictionary document does
//! not encode: which archives belong to the dataset, which character columns
//! hold dates, documented enum overrides, and output naming.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// Column-level corrections applied on top of a parsed dictionary
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchemaOverrides {
    /// Character columns that hold dates even when the description omits the format
    pub date_columns: BTreeSet<String>,
    /// Replacement code sets for enumerated columns
    pub enum_codes: BTreeMap<String, BTreeSet<String>>,
    /// Relaxed maximum lengths for fields whose width changed between releases
    pub max_lengths: BTreeMap<String, usize>,
    /// Trailing columns that releases predating them omit
    pub optional_columns: BTreeSet<String>,
}

impl SchemaOverrides {
    pub fn is_date_column(&self, name: &str) -> bool {
        self.date_columns.contains(&name.to_ascii_uppercase())
    }
}

/// Static description of one dataset the pipeline knows how to ingest
#[derive(Debug, Clone, Serialize)]
pub struct DatasetProfile {
    /// Dataset identifier, e.g. "complaints"
    pub id: &'static str,
    /// Dictionary document file name looked up under the docs directory
    pub dictionary_file: &'static str,
    /// Canonical release archive names, preferred when present
    pub expected_archives: &'static [&'static str],
    /// Lowercase name fragments used when no canonical archive is present
    pub discovery_terms: &'static [&'static str],
    /// File stem of the combined dataset output
    pub combined_stem: &'static str,
    /// File stem of the run manifest and summary
    pub manifest_stem: &'static str,
    pub overrides: SchemaOverrides,
}

const COMPLAINT_ARCHIVES: &[&str] = &[
    "COMPLAINTS_RECEIVED_2020-2024.zip",
    "COMPLAINTS_RECEIVED_2025-2026.zip",
    "complaints_2020_2024.zip",
    "complaints_2025_2026.zip",
];

const RECALL_ARCHIVES: &[&str] = &[
    "RCL_FROM_2020_2024.zip",
    "RCL_FROM_2025_2026.zip",
    "rcl_from_2020_2024.zip",
    "rcl_from_2025_2026.zip",
];

fn upper_set(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|n| n.to_ascii_uppercase()).collect()
}

impl DatasetProfile {
    /// Identifiers of every built-in profile
    pub const KNOWN: &'static [&'static str] = &["complaints", "recalls"];

    /// Look up a built-in profile by dataset identifier
    pub fn lookup(id: &str) -> Option<Self> {
        match id.trim().to_ascii_lowercase().as_str() {
            "complaints" => Some(Self::complaints()),
            "recalls" => Some(Self::recalls()),
            _ => None,
        }
    }

    pub fn complaints() -> Self {
        Self {
            id: "complaints",
            dictionary_file: "CMPL.txt",
            expected_archives: COMPLAINT_ARCHIVES,
            discovery_terms: &["complaint"],
            combined_stem: "odi_complaints_combined",
            manifest_stem: "ingest_odi",
            overrides: SchemaOverrides {
                date_columns: upper_set(&["FAILDATE", "DATEA", "LDATE", "PURCH_DT", "MANUF_DT"]),
                ..SchemaOverrides::default()
            },
        }
    }

    pub fn recalls() -> Self {
        let mut enum_codes = BTreeMap::new();
        enum_codes.insert("INFLUENCED_BY".to_string(), upper_set(&["MFR", "OVSC", "ODI"]));

        let mut max_lengths = BTreeMap::new();
        // FMVSS widened in the 2025 release; older rows carry up to 6 characters
        max_lengths.insert("FMVSS".to_string(), 6);

        Self {
            id: "recalls",
            dictionary_file: "RCL.txt",
            expected_archives: RECALL_ARCHIVES,
            discovery_terms: &["rcl", "recall"],
            combined_stem: "odi_recalls_combined",
            manifest_stem: "ingest_recalls",
            overrides: SchemaOverrides {
                date_columns: upper_set(&["BGMAN", "ENDMAN", "ODATE", "RCDATE", "DATEA"]),
                enum_codes,
                max_lengths,
                optional_columns: upper_set(&["DO_NOT_DRIVE", "PARK_OUTSIDE"]),
            },
        }
    }

    /// Whether an archive file name belongs to this dataset by discovery term
    pub fn matches_archive_name(&self, file_name: &str) -> bool {
        let lower = file_name.to_ascii_lowercase();
        lower.ends_with(".zip") && self.discovery_terms.iter().any(|term| lower.contains(term))
    }
}
