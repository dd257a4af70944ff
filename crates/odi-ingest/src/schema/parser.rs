// Schema dictionary parser
//
// The dictionary is a plain-text document with a preamble, a column table
// opened by `FIELDS:`, and optional trailing sections. A column row reads
// `<field#> <NAME> <TYPE>(<size>) [description]`; indented lines continue the
// previous column's description. A `CODES:` section lists enumerations per
// column.

use super::{ColumnSpec, DataKind, SchemaSpec};
use crate::error::{IngestError, Result, SchemaParseError};
use crate::profile::{DatasetProfile, SchemaOverrides};
use crate::reader::decode_text;
use regex::Regex;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::LazyLock;
use tracing::{debug, info};

#[allow(clippy::expect_used)]
static COLUMN_ROW: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(\d+)\s+([A-Za-z][A-Za-z0-9_]*)\s+([A-Za-z0-9]+)\s*\(\s*(\d+)\s*\)\s*(.*)$")
        .expect("valid column row regex")
});

#[allow(clippy::expect_used)]
static CODE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*([A-Za-z0-9]{1,10})\s*=").expect("valid code line regex")
});

#[allow(clippy::expect_used)]
static BRACKET_CODES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([A-Za-z0-9,\s/]+)\]").expect("valid bracket regex"));

#[allow(clippy::expect_used)]
static YES_NO: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)'Y'\s+OR\s+'N'|\bY/N\b").expect("valid yes/no regex"));

#[allow(clippy::expect_used)]
static DATE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)YYYYMMDD|MM/DD/YYYY|YYYY-MM-DD").expect("valid date pattern regex")
});

const DEFAULT_DATE_FORMAT: &str = "%Y%m%d";

/// Where in the document the parser currently is
#[derive(Debug, Clone, PartialEq, Eq)]
enum Section {
    Preamble,
    Fields,
    /// Code definitions; holds the column whose sub-block is open
    Codes(Option<usize>),
    Trailer,
}

impl Section {
    fn label(&self) -> &'static str {
        match self {
            Section::Preamble => "PREAMBLE",
            Section::Fields => "FIELDS",
            Section::Codes(_) => "CODES",
            Section::Trailer => "TRAILER",
        }
    }
}

/// A column row with everything gathered for it so far
#[derive(Debug)]
struct RawColumn {
    name: String,
    type_token: String,
    size: usize,
    line: usize,
    description: Vec<String>,
    codes: BTreeSet<String>,
}

impl RawColumn {
    fn add_description(&mut self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        self.codes.extend(codes_in_line(text));
        self.description.push(text.to_string());
    }
}

/// Codes documented inline: `CODE = meaning` lines and bracketed lists
fn codes_in_line(line: &str) -> Vec<String> {
    let mut codes = Vec::new();
    if let Some(caps) = CODE_LINE.captures(line) {
        codes.push(caps[1].to_ascii_uppercase());
    }
    let upper = line.to_ascii_uppercase();
    for caps in BRACKET_CODES.captures_iter(&upper) {
        codes.extend(
            caps[1]
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string),
        );
    }
    codes
}

fn is_rule(trimmed: &str) -> bool {
    !trimmed.is_empty() && trimmed.chars().all(|c| c == '=' || c == '-' || c.is_whitespace())
}

fn is_indented(line: &str) -> bool {
    line.starts_with(' ') || line.starts_with('\t')
}

fn is_footnote(trimmed: &str) -> bool {
    trimmed.starts_with('*') || trimmed.starts_with('#')
}

/// Section header: an unindented line ending in ':'
fn section_header(line: &str) -> Option<String> {
    if is_indented(line) {
        return None;
    }
    let trimmed = line.trim();
    trimmed
        .strip_suffix(':')
        .map(|name| name.trim().to_ascii_uppercase())
        .filter(|name| !name.is_empty())
}

fn kind_for_type_token(token: &str) -> Option<DataKind> {
    match token.to_ascii_uppercase().as_str() {
        "CHAR" | "VARCHAR" | "VARCHAR2" | "TEXT" => Some(DataKind::String),
        "NUMBER" | "NUM" | "INTEGER" | "INT" => Some(DataKind::Integer),
        "DATE" => Some(DataKind::Date),
        _ => None,
    }
}

fn chrono_format(pattern: &str) -> &'static str {
    match pattern.to_ascii_uppercase().as_str() {
        "MM/DD/YYYY" => "%m/%d/%Y",
        "YYYY-MM-DD" => "%Y-%m-%d",
        _ => DEFAULT_DATE_FORMAT,
    }
}

/// Parses dictionary documents into [`SchemaSpec`]s
#[derive(Debug, Clone, Default)]
pub struct SchemaDictionaryParser {
    overrides: SchemaOverrides,
}

impl SchemaDictionaryParser {
    pub fn new(overrides: SchemaOverrides) -> Self {
        Self { overrides }
    }

    pub fn for_profile(profile: &DatasetProfile) -> Self {
        Self::new(profile.overrides.clone())
    }

    /// Read and parse a dictionary file
    pub fn parse_file(&self, dataset: &str, path: &Path) -> Result<SchemaSpec> {
        let bytes = std::fs::read(path).map_err(|e| {
            IngestError::configuration(format!(
                "cannot read schema dictionary {}: {}",
                path.display(),
                e
            ))
        })?;
        let spec = self.parse(dataset, &decode_text(&bytes))?;
        info!(
            dataset,
            path = %path.display(),
            columns = spec.len(),
            "Parsed schema dictionary"
        );
        Ok(spec)
    }

    /// Parse dictionary text
    ///
    /// Any line inside the column table that is not a column row, a
    /// continuation, a footnote, a rule or a section header is an error.
    pub fn parse(&self, dataset: &str, text: &str) -> std::result::Result<SchemaSpec, SchemaParseError> {
        let mut section = Section::Preamble;
        let mut columns: Vec<RawColumn> = Vec::new();

        for (index, line) in text.lines().enumerate() {
            let line_no = index + 1;
            let line = line.trim_end();
            let trimmed = line.trim();

            match section {
                Section::Preamble => {
                    if trimmed.to_ascii_uppercase().contains("FIELDS:") {
                        section = Section::Fields;
                    }
                },
                Section::Fields => {
                    if trimmed.is_empty() || is_rule(trimmed) || is_footnote(trimmed) {
                        continue;
                    }
                    if let Some(caps) = COLUMN_ROW.captures(line) {
                        columns.push(Self::column_row(&caps, line_no, columns.len())?);
                        continue;
                    }
                    if !columns.is_empty() {
                        if let Some(header) = section_header(line) {
                            debug!(line = line_no, header = %header, "Column table closed");
                            section = if header == "CODES" || header == "CODE DEFINITIONS" {
                                Section::Codes(None)
                            } else {
                                Section::Trailer
                            };
                            continue;
                        }
                    }
                    // Numeric code lines like "9999 = UNKNOWN" are continuations
                    if trimmed.starts_with(|c: char| c.is_ascii_digit()) && !CODE_LINE.is_match(trimmed) {
                        return Err(SchemaParseError::at_line(
                            line_no,
                            section.label(),
                            format!("malformed column row: '{trimmed}'"),
                        ));
                    }
                    match columns.last_mut() {
                        // Table headings before the first column row
                        None => continue,
                        Some(column) if is_indented(line) => column.add_description(trimmed),
                        Some(_) => {
                            return Err(SchemaParseError::at_line(
                                line_no,
                                section.label(),
                                format!("unexpected line in column table: '{trimmed}'"),
                            ));
                        },
                    }
                },
                Section::Codes(current) => {
                    if trimmed.is_empty() || is_rule(trimmed) || is_footnote(trimmed) {
                        continue;
                    }
                    if let Some(header) = section_header(line) {
                        let position = columns
                            .iter()
                            .position(|c| c.name.eq_ignore_ascii_case(&header))
                            .ok_or_else(|| {
                                SchemaParseError::at_line(
                                    line_no,
                                    "CODES",
                                    format!("code block for unknown column '{header}'"),
                                )
                            })?;
                        section = Section::Codes(Some(position));
                        continue;
                    }
                    let Some(position) = current else {
                        return Err(SchemaParseError::at_line(
                            line_no,
                            "CODES",
                            format!("code line outside a column block: '{trimmed}'"),
                        ));
                    };
                    if !is_indented(line) {
                        return Err(SchemaParseError::at_line(
                            line_no,
                            "CODES",
                            format!("unexpected line in code definitions: '{trimmed}'"),
                        ));
                    }
                    if let Some(caps) = CODE_LINE.captures(trimmed) {
                        columns[position].codes.insert(caps[1].to_ascii_uppercase());
                    }
                },
                Section::Trailer => {},
            }
        }

        if section == Section::Preamble {
            return Err(SchemaParseError::document("FIELDS", "no 'FIELDS:' section found"));
        }
        if columns.is_empty() {
            return Err(SchemaParseError::document("FIELDS", "no column rows found"));
        }

        self.finish(dataset, columns)
    }

    fn column_row(
        caps: &regex::Captures<'_>,
        line_no: usize,
        expected_position: usize,
    ) -> std::result::Result<RawColumn, SchemaParseError> {
        let field_no: usize = caps[1].parse().map_err(|_| {
            SchemaParseError::at_line(line_no, "FIELDS", format!("field number '{}' is too large", &caps[1]))
        })?;
        if field_no != expected_position + 1 {
            return Err(SchemaParseError::at_line(
                line_no,
                "FIELDS",
                format!(
                    "field number {} out of sequence, expected {}",
                    field_no,
                    expected_position + 1
                ),
            ));
        }
        let size = caps[4].parse().map_err(|_| {
            SchemaParseError::at_line(line_no, "FIELDS", format!("field size '{}' is too large", &caps[4]))
        })?;

        let mut column = RawColumn {
            name: caps[2].to_string(),
            type_token: caps[3].to_ascii_uppercase(),
            size,
            line: line_no,
            description: Vec::new(),
            codes: BTreeSet::new(),
        };
        column.add_description(&caps[5]);
        Ok(column)
    }

    /// Resolve kinds, apply overrides and collect date formats
    fn finish(
        &self,
        dataset: &str,
        columns: Vec<RawColumn>,
    ) -> std::result::Result<SchemaSpec, SchemaParseError> {
        let mut date_formats: Vec<String> = Vec::new();
        let mut specs = Vec::with_capacity(columns.len());

        for (position, raw) in columns.into_iter().enumerate() {
            let declared = kind_for_type_token(&raw.type_token).ok_or_else(|| {
                SchemaParseError::at_line(
                    raw.line,
                    "FIELDS",
                    format!("unknown type token '{}' for column '{}'", raw.type_token, raw.name),
                )
            })?;

            let description = raw.description.join(" ");
            let mut has_date_pattern = false;
            for m in DATE_PATTERN.find_iter(&description) {
                has_date_pattern = true;
                let format = chrono_format(m.as_str()).to_string();
                if !date_formats.contains(&format) {
                    date_formats.push(format);
                }
            }

            let mut codes = raw.codes;
            if YES_NO.is_match(&description) {
                codes.insert("Y".to_string());
                codes.insert("N".to_string());
            }
            let key = raw.name.to_ascii_uppercase();
            if let Some(replacement) = self.overrides.enum_codes.get(&key) {
                codes = replacement.clone();
            }

            let data_kind = match declared {
                DataKind::String if has_date_pattern || self.overrides.is_date_column(&raw.name) => {
                    DataKind::Date
                },
                DataKind::String if !codes.is_empty() => DataKind::Coded,
                other => other,
            };

            let max_length = self.overrides.max_lengths.get(&key).copied().or(Some(raw.size));

            specs.push(ColumnSpec {
                name: raw.name,
                position,
                data_kind,
                max_length,
                allowed_codes: (data_kind == DataKind::Coded).then_some(codes),
                description,
                optional: self.overrides.optional_columns.contains(&key),
            });
        }

        if date_formats.is_empty() {
            date_formats.push(DEFAULT_DATE_FORMAT.to_string());
        }

        SchemaSpec::new(dataset, specs, date_formats)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SAMPLE: &str = "\
ODI COMPLAINTS FLAT FILE
Last updated 2025-01-01

FIELDS:
=======

Field# Name     Type/Size   Description
------ -------- ----------- -----------------------------
1      CMPLID   CHAR(9)     NHTSA'S INTERNAL UNIQUE SEQUENCE NUMBER
2      MFR_NAME CHAR(60)    MANUFACTURER'S NAME
3      YEARTXT  CHAR(4)     MODEL YEAR, 9999 IF UNKNOWN
4      CRASH    CHAR(1)     WAS VEHICLE INVOLVED IN A CRASH, 'Y' OR 'N'
5      FAILDATE CHAR(8)     DATE OF INCIDENT (YYYYMMDD)
6      MILES    NUMBER(7)   VEHICLE MILEAGE
7      CMPL_TYPE CHAR(4)    SOURCE OF COMPLAINT CODE:
                              CAG  =CONSUMER ACTION GROUP
                              EVOQ =HOTLINE VOQ
* Footnote: MILES is self-reported

CODES:
CMPL_TYPE:
    IVOQ = NHTSA WEB SITE
";

    fn parser() -> SchemaDictionaryParser {
        SchemaDictionaryParser::for_profile(&DatasetProfile::complaints())
    }

    #[test]
    fn test_parse_sample_dictionary() {
        let spec = parser().parse("complaints", SAMPLE).unwrap();
        assert_eq!(spec.len(), 7);
        assert_eq!(spec.dataset(), "complaints");

        let names: Vec<&str> = spec.columns().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["CMPLID", "MFR_NAME", "YEARTXT", "CRASH", "FAILDATE", "MILES", "CMPL_TYPE"]);

        assert_eq!(spec.columns()[0].data_kind, DataKind::String);
        assert_eq!(spec.columns()[0].max_length, Some(9));
        assert_eq!(spec.columns()[3].data_kind, DataKind::Coded);
        assert_eq!(spec.columns()[4].data_kind, DataKind::Date);
        assert_eq!(spec.columns()[5].data_kind, DataKind::Integer);

        let codes: Vec<&str> = spec.columns()[6]
            .allowed_codes
            .as_ref()
            .unwrap()
            .iter()
            .map(String::as_str)
            .collect();
        assert_eq!(codes, vec!["CAG", "EVOQ", "IVOQ"]);
        assert_eq!(spec.date_formats(), &["%Y%m%d".to_string()]);
    }

    #[test]
    fn test_three_column_dictionary() {
        let doc = "FIELDS:\n1 CMPLID CHAR(9) ID\n2 MFR_NAME CHAR(60) MAKER\n3 YEARTXT NUMBER(4) MODEL YEAR\n";
        let spec = SchemaDictionaryParser::default().parse("complaints", doc).unwrap();
        let kinds: Vec<DataKind> = spec.columns().iter().map(|c| c.data_kind).collect();
        assert_eq!(kinds, vec![DataKind::String, DataKind::String, DataKind::Integer]);
        assert_eq!(spec.columns()[2].max_length, Some(4));
    }

    #[test]
    fn test_malformed_row_inside_table_names_line() {
        let doc = "FIELDS:\n1 CMPLID CHAR(9)\n2 MFR_NAME CHAR 60\n";
        let err = parser().parse("complaints", doc).unwrap_err();
        assert_eq!(err.line, Some(3));
        assert_eq!(err.section, "FIELDS");
    }

    #[test]
    fn test_unindented_prose_inside_table_is_error() {
        let doc = "FIELDS:\n1 CMPLID CHAR(9)\nTHIS IS NOT A COLUMN\n";
        let err = parser().parse("complaints", doc).unwrap_err();
        assert_eq!(err.line, Some(3));
    }

    #[test]
    fn test_field_numbers_must_be_contiguous() {
        let doc = "FIELDS:\n1 CMPLID CHAR(9)\n3 YEARTXT NUMBER(4)\n";
        let err = parser().parse("complaints", doc).unwrap_err();
        assert!(err.message.contains("out of sequence"));
    }

    #[test]
    fn test_unknown_type_token_is_error() {
        let doc = "FIELDS:\n1 CMPLID BLOB(9)\n";
        let err = parser().parse("complaints", doc).unwrap_err();
        assert_eq!(err.line, Some(2));
        assert!(err.message.contains("BLOB"));
    }

    #[test]
    fn test_missing_or_empty_table_is_error() {
        assert!(parser().parse("complaints", "no table here\n").is_err());
        let err = parser().parse("complaints", "FIELDS:\nField# Name Type\n").unwrap_err();
        assert!(err.message.contains("no column rows"));
    }

    #[test]
    fn test_code_block_for_unknown_column_is_error() {
        let doc = "FIELDS:\n1 CMPLID CHAR(9)\n\nCODES:\nNOPE:\n    A = ALPHA\n";
        let err = parser().parse("complaints", doc).unwrap_err();
        assert_eq!(err.line, Some(5));
        assert_eq!(err.section, "CODES");
    }

    #[test]
    fn test_trailer_sections_are_ignored() {
        let doc = "FIELDS:\n1 CMPLID CHAR(9)\n\nNOTES:\nanything goes here\n42 not a column\n";
        let spec = parser().parse("complaints", doc).unwrap();
        assert_eq!(spec.len(), 1);
    }

    #[test]
    fn test_recall_overrides_apply() {
        let doc = "\
FIELDS:
1 RECORD_ID NUMBER(9)
2 FMVSS CHAR(3) STANDARD NUMBER
3 INFLUENCED_BY CHAR(4) WHO INFLUENCED THE RECALL
4 RCDATE CHAR(8) RECORD CREATION DATE
";
        let spec = SchemaDictionaryParser::for_profile(&DatasetProfile::recalls())
            .parse("recalls", doc)
            .unwrap();
        assert_eq!(spec.column("FMVSS").unwrap().max_length, Some(6));
        let influenced = spec.column("INFLUENCED_BY").unwrap();
        assert_eq!(influenced.data_kind, DataKind::Coded);
        assert!(influenced.accepts_code("ovsc"));
        assert_eq!(spec.column("RCDATE").unwrap().data_kind, DataKind::Date);
        assert!(!spec.column("FMVSS").unwrap().optional);
    }

    #[test]
    fn test_recall_advisory_columns_are_optional() {
        let doc = "\
FIELDS:
1 RECORD_ID NUMBER(9)
2 DO_NOT_DRIVE CHAR(3) DO NOT DRIVE ADVISORY Y/N
3 PARK_OUTSIDE CHAR(3) PARK OUTSIDE ADVISORY Y/N
";
        let spec = SchemaDictionaryParser::for_profile(&DatasetProfile::recalls())
            .parse("recalls", doc)
            .unwrap();
        let optional: Vec<&str> = spec.columns().iter().filter(|c| c.optional).map(|c| c.name.as_str()).collect();
        assert_eq!(optional, vec!["DO_NOT_DRIVE", "PARK_OUTSIDE"]);
    }

    #[test]
    fn test_date_formats_collected_in_order() {
        let doc = "\
FIELDS:
1 LDATE CHAR(10) LOAD DATE MM/DD/YYYY
2 DATEA CHAR(8) ADDED YYYYMMDD
3 ODATE CHAR(10) OWNER NOTIFIED YYYY-MM-DD
";
        let spec = SchemaDictionaryParser::default().parse("recalls", doc).unwrap();
        assert_eq!(spec.date_formats(), &["%m/%d/%Y", "%Y%m%d", "%Y-%m-%d"]);
    }

    proptest! {
        #[test]
        fn prop_parse_is_deterministic(
            names in proptest::collection::btree_set("[A-Z][A-Z0-9]{0,10}", 1..12),
            sizes in proptest::collection::vec(1usize..200, 12),
        ) {
            let mut doc = String::from("HEADER\nFIELDS:\n");
            for (i, name) in names.iter().enumerate() {
                doc.push_str(&format!("{} {} CHAR({}) VALUE [B, A, C]\n", i + 1, name, sizes[i]));
            }
            let first = parser().parse("complaints", &doc).unwrap();
            let second = parser().parse("complaints", &doc).unwrap();
            prop_assert_eq!(&first, &second);
            prop_assert_eq!(
                serde_json::to_string(&first).unwrap(),
                serde_json::to_string(&second).unwrap()
            );
            prop_assert_eq!(first.len(), names.len());
        }
    }
}
